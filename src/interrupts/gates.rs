//! Trap gate stubs
//!
//! Naked entry stubs the IDT points at. Each gate reserves a `TrapFrame`
//! directly below the hardware-pushed frame, stores the interrupted
//! register file into it, calls its handler with a pointer to the frame,
//! and falls into the shared `trap_frame_resume` epilogue.
//!
//! Two shapes exist: `noerr` for vectors where the CPU pushes no error code
//! and `witherr` for the seven vectors where it does (#DF #TS #NP #SS #GP
//! #PF #AC). The `fatal` variants tail into a halt loop instead of the
//! epilogue: #DF and #MC must not return, and if their handler does anyway
//! the machine halts rather than re-executing a faulting instruction.
//!
//! Frame placement invariant shared with `trap_frame_resume`: the record
//! base is always `hw frame base - 176`, for both shapes. Interrupt
//! delivery in 64-bit mode aligns the hardware frame so the record lands at
//! `rsp % 16 == 8`; the gates drop 8 more bytes around the handler call so
//! the handler observes a procedure-call-ABI stack.

use super::frame::TrapFrame;

/// Vectors for which the CPU pushes a hardware error code.
pub const ERROR_CODE_VECTORS: [u8; 7] = [8, 10, 11, 12, 13, 14, 17];

/// Does `vector` carry a hardware-pushed error code?
pub fn has_error_code(vector: u8) -> bool {
    ERROR_CODE_VECTORS.contains(&vector)
}

/// Shared epilogue, also the resume target for preemption-suspended threads.
///
/// Entered with the stack pointer at a `TrapFrame` base. Reads the frame's
/// `rsp` slot to pick the hardware frame to return through; if a handler
/// redirected that slot at another suspended thread's frame, pivots to the
/// record sitting 176 bytes below it and restores that thread instead.
/// Writes rip/cs/rflags back into the hardware frame (the frame's own
/// saved-rsp and ss qwords stay authoritative), reloads the register file,
/// and lands the stack pointer on the hardware frame for `iretq`.
#[unsafe(naked)]
pub extern "C" fn trap_frame_resume() {
    core::arch::naked_asm!(
        "cli",
        "mov rax, [rsp + 0xA0]", // hardware frame to return through
        "lea rsp, [rax - 176]",  // pivot to the record below it
        "mov rcx, [rsp + 0x88]",
        "mov [rax + 0x00], rcx", // rip
        "mov rcx, [rsp + 0x90]",
        "mov [rax + 0x08], rcx", // cs
        "mov rcx, [rsp + 0x98]",
        "mov [rax + 0x10], rcx", // rflags
        "mov r15, [rsp + 0x00]",
        "mov r14, [rsp + 0x08]",
        "mov r13, [rsp + 0x10]",
        "mov r12, [rsp + 0x18]",
        "mov r11, [rsp + 0x20]",
        "mov r10, [rsp + 0x28]",
        "mov r9,  [rsp + 0x30]",
        "mov r8,  [rsp + 0x38]",
        "mov rsi, [rsp + 0x40]",
        "mov rdi, [rsp + 0x48]",
        "mov rbp, [rsp + 0x50]",
        "mov rdx, [rsp + 0x58]",
        "mov rcx, [rsp + 0x60]",
        "mov rbx, [rsp + 0x68]",
        "mov rax, [rsp + 0x70]",
        "lea rsp, [rsp + 176]", // every register is live again; lea keeps it that way
        "iretq",
    );
}

// The prologue stores the register file before touching any register, so
// only the freshly reserved record is used as scratch. rax/rcx become free
// once their slots are written.
macro_rules! trap_gate {
    (noerr $name:ident, $vec:expr, $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "sub rsp, 176",
                "mov [rsp + 0x00], r15",
                "mov [rsp + 0x08], r14",
                "mov [rsp + 0x10], r13",
                "mov [rsp + 0x18], r12",
                "mov [rsp + 0x20], r11",
                "mov [rsp + 0x28], r10",
                "mov [rsp + 0x30], r9",
                "mov [rsp + 0x38], r8",
                "mov [rsp + 0x40], rsi",
                "mov [rsp + 0x48], rdi",
                "mov [rsp + 0x50], rbp",
                "mov [rsp + 0x58], rdx",
                "mov [rsp + 0x60], rcx",
                "mov [rsp + 0x68], rbx",
                "mov [rsp + 0x70], rax",
                "mov qword ptr [rsp + 0x78], {vector}",
                "mov qword ptr [rsp + 0x80], 0",
                "lea rax, [rsp + 176]",  // hardware frame base
                "mov rcx, [rax + 0x00]",
                "mov [rsp + 0x88], rcx", // rip
                "mov rcx, [rax + 0x08]",
                "mov [rsp + 0x90], rcx", // cs
                "mov rcx, [rax + 0x10]",
                "mov [rsp + 0x98], rcx", // rflags
                "mov [rsp + 0xA0], rax",
                "mov rcx, ss",
                "mov [rsp + 0xA8], rcx",
                "mov rdi, rsp",
                "sub rsp, 8",
                "call {handler}",
                "add rsp, 8",
                "jmp {resume}",
                vector = const $vec,
                handler = sym $handler,
                resume = sym trap_frame_resume,
            );
        }
    };
    (witherr $name:ident, $vec:expr, $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                // CPU pushed an error code; reserving 168 keeps the record
                // base at hw_base - 176 with the error qword at slot 0xA8.
                "sub rsp, 168",
                "mov [rsp + 0x00], r15",
                "mov [rsp + 0x08], r14",
                "mov [rsp + 0x10], r13",
                "mov [rsp + 0x18], r12",
                "mov [rsp + 0x20], r11",
                "mov [rsp + 0x28], r10",
                "mov [rsp + 0x30], r9",
                "mov [rsp + 0x38], r8",
                "mov [rsp + 0x40], rsi",
                "mov [rsp + 0x48], rdi",
                "mov [rsp + 0x50], rbp",
                "mov [rsp + 0x58], rdx",
                "mov [rsp + 0x60], rcx",
                "mov [rsp + 0x68], rbx",
                "mov [rsp + 0x70], rax",
                "mov qword ptr [rsp + 0x78], {vector}",
                "mov rax, [rsp + 0xA8]", // hardware error code, before ss overwrites it
                "mov [rsp + 0x80], rax",
                "lea rax, [rsp + 176]",
                "mov rcx, [rax + 0x00]",
                "mov [rsp + 0x88], rcx",
                "mov rcx, [rax + 0x08]",
                "mov [rsp + 0x90], rcx",
                "mov rcx, [rax + 0x10]",
                "mov [rsp + 0x98], rcx",
                "mov [rsp + 0xA0], rax",
                "mov rcx, ss",
                "mov [rsp + 0xA8], rcx",
                "mov rdi, rsp",
                "sub rsp, 8",
                "call {handler}",
                "add rsp, 8",
                "jmp {resume}",
                vector = const $vec,
                handler = sym $handler,
                resume = sym trap_frame_resume,
            );
        }
    };
    (noerr fatal $name:ident, $vec:expr, $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "sub rsp, 176",
                "mov [rsp + 0x00], r15",
                "mov [rsp + 0x08], r14",
                "mov [rsp + 0x10], r13",
                "mov [rsp + 0x18], r12",
                "mov [rsp + 0x20], r11",
                "mov [rsp + 0x28], r10",
                "mov [rsp + 0x30], r9",
                "mov [rsp + 0x38], r8",
                "mov [rsp + 0x40], rsi",
                "mov [rsp + 0x48], rdi",
                "mov [rsp + 0x50], rbp",
                "mov [rsp + 0x58], rdx",
                "mov [rsp + 0x60], rcx",
                "mov [rsp + 0x68], rbx",
                "mov [rsp + 0x70], rax",
                "mov qword ptr [rsp + 0x78], {vector}",
                "mov qword ptr [rsp + 0x80], 0",
                "lea rax, [rsp + 176]",
                "mov rcx, [rax + 0x00]",
                "mov [rsp + 0x88], rcx",
                "mov rcx, [rax + 0x08]",
                "mov [rsp + 0x90], rcx",
                "mov rcx, [rax + 0x10]",
                "mov [rsp + 0x98], rcx",
                "mov [rsp + 0xA0], rax",
                "mov rcx, ss",
                "mov [rsp + 0xA8], rcx",
                "mov rdi, rsp",
                "sub rsp, 8",
                "call {handler}",
                // the handler must not return; halt if it does
                "cli",
                "2:",
                "hlt",
                "jmp 2b",
                vector = const $vec,
                handler = sym $handler,
            );
        }
    };
    (witherr fatal $name:ident, $vec:expr, $handler:path) => {
        #[unsafe(naked)]
        pub extern "C" fn $name() {
            core::arch::naked_asm!(
                "sub rsp, 168",
                "mov [rsp + 0x00], r15",
                "mov [rsp + 0x08], r14",
                "mov [rsp + 0x10], r13",
                "mov [rsp + 0x18], r12",
                "mov [rsp + 0x20], r11",
                "mov [rsp + 0x28], r10",
                "mov [rsp + 0x30], r9",
                "mov [rsp + 0x38], r8",
                "mov [rsp + 0x40], rsi",
                "mov [rsp + 0x48], rdi",
                "mov [rsp + 0x50], rbp",
                "mov [rsp + 0x58], rdx",
                "mov [rsp + 0x60], rcx",
                "mov [rsp + 0x68], rbx",
                "mov [rsp + 0x70], rax",
                "mov qword ptr [rsp + 0x78], {vector}",
                "mov rax, [rsp + 0xA8]",
                "mov [rsp + 0x80], rax",
                "lea rax, [rsp + 176]",
                "mov rcx, [rax + 0x00]",
                "mov [rsp + 0x88], rcx",
                "mov rcx, [rax + 0x08]",
                "mov [rsp + 0x90], rcx",
                "mov rcx, [rax + 0x10]",
                "mov [rsp + 0x98], rcx",
                "mov [rsp + 0xA0], rax",
                "mov rcx, ss",
                "mov [rsp + 0xA8], rcx",
                "mov rdi, rsp",
                "sub rsp, 8",
                "call {handler}",
                "cli",
                "2:",
                "hlt",
                "jmp 2b",
                vector = const $vec,
                handler = sym $handler,
            );
        }
    };
}

// --- Exception gates ---

use super::handlers;

trap_gate!(noerr divide_error_gate, 0, handlers::trap_unexpected);
trap_gate!(noerr debug_gate, 1, handlers::trap_debug);
trap_gate!(noerr nmi_gate, 2, handlers::trap_unexpected);
trap_gate!(noerr breakpoint_gate, 3, handlers::trap_breakpoint);
trap_gate!(noerr overflow_gate, 4, handlers::trap_unexpected);
trap_gate!(noerr bound_range_gate, 5, handlers::trap_unexpected);
trap_gate!(noerr invalid_opcode_gate, 6, handlers::trap_invalid_opcode);
trap_gate!(noerr device_na_gate, 7, handlers::trap_unexpected);
trap_gate!(witherr fatal double_fault_gate, 8, handlers::trap_double_fault);
trap_gate!(noerr coproc_overrun_gate, 9, handlers::trap_unexpected);
trap_gate!(witherr invalid_tss_gate, 10, handlers::trap_unexpected);
trap_gate!(witherr segment_np_gate, 11, handlers::trap_unexpected);
trap_gate!(witherr stack_fault_gate, 12, handlers::trap_unexpected);
trap_gate!(witherr gp_fault_gate, 13, handlers::trap_general_protection);
trap_gate!(witherr page_fault_gate, 14, handlers::trap_page_fault);
trap_gate!(noerr x87_fault_gate, 16, handlers::trap_unexpected);
trap_gate!(witherr align_check_gate, 17, handlers::trap_unexpected);
trap_gate!(noerr fatal machine_check_gate, 18, handlers::trap_machine_check);
trap_gate!(noerr simd_fault_gate, 19, handlers::trap_unexpected);
trap_gate!(noerr virt_fault_gate, 20, handlers::trap_unexpected);

// --- Interrupt gates ---

trap_gate!(noerr timer_gate, super::TIMER_VECTOR, handlers::trap_timer);
trap_gate!(noerr resched_ipi_gate, super::RESCHED_VECTOR, handlers::trap_resched_ipi);

/// Minimal gate for the LAPIC spurious vector. No `TrapFrame` is built; the
/// caller-saved registers the C handler may touch are preserved and the
/// hardware frame is left alone.
#[unsafe(naked)]
pub extern "C" fn spurious_gate() {
    core::arch::naked_asm!(
        "push rax",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "call {handler}",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rax",
        "iretq",
        handler = sym handlers::trap_spurious,
    );
}

/// Entry symbol for `vector`, if the core installs one.
///
/// This is the mapping the IDT loader consumes; the gate shape (error code
/// or not) is a property of the vector, not a choice.
pub fn entry_for_vector(vector: u8) -> Option<u64> {
    let gate: extern "C" fn() = match vector {
        0 => divide_error_gate,
        1 => debug_gate,
        2 => nmi_gate,
        3 => breakpoint_gate,
        4 => overflow_gate,
        5 => bound_range_gate,
        6 => invalid_opcode_gate,
        7 => device_na_gate,
        8 => double_fault_gate,
        9 => coproc_overrun_gate,
        10 => invalid_tss_gate,
        11 => segment_np_gate,
        12 => stack_fault_gate,
        13 => gp_fault_gate,
        14 => page_fault_gate,
        16 => x87_fault_gate,
        17 => align_check_gate,
        18 => machine_check_gate,
        19 => simd_fault_gate,
        20 => virt_fault_gate,
        v if v == super::TIMER_VECTOR => timer_gate,
        v if v == super::RESCHED_VECTOR => resched_ipi_gate,
        v if v == super::SPURIOUS_VECTOR => spurious_gate,
        _ => return None,
    };
    Some(gate as u64)
}

/// Handler signature every full gate dispatches to.
pub type TrapHandler = extern "C" fn(&mut TrapFrame);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_set_matches_architecture() {
        // #DF, #TS, #NP, #SS, #GP, #PF, #AC and nothing else
        for v in 0u8..=32 {
            let expect = matches!(v, 8 | 10 | 11 | 12 | 13 | 14 | 17);
            assert_eq!(has_error_code(v), expect, "vector {}", v);
        }
    }

    #[test]
    fn installed_vectors_have_entries() {
        for v in [0u8, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 16, 17, 18, 19, 20] {
            assert!(entry_for_vector(v).is_some(), "vector {}", v);
        }
        assert!(entry_for_vector(super::super::TIMER_VECTOR).is_some());
        assert!(entry_for_vector(super::super::RESCHED_VECTOR).is_some());
        assert!(entry_for_vector(super::super::SPURIOUS_VECTOR).is_some());
        // reserved vectors stay empty
        assert!(entry_for_vector(15).is_none());
        assert!(entry_for_vector(21).is_none());
        assert!(entry_for_vector(47).is_none());
    }

    #[test]
    fn gates_are_distinct_symbols() {
        let a = entry_for_vector(6).unwrap();
        let b = entry_for_vector(14).unwrap();
        let c = entry_for_vector(super::super::TIMER_VECTOR).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, 0);
    }
}
