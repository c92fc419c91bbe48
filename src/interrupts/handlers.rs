//! Trap handlers
//!
//! One handler per installed vector, each taking the `TrapFrame` its gate
//! built. Fault handlers that can fire while the formatter or heap is in an
//! unknown state (#DF, #MC, #GP, #UD, #PF) log through the raw serial path.

use core::sync::atomic::{AtomicBool, Ordering};

use super::frame::TrapFrame;
use crate::arch::cpu;
use crate::serial::{write_hex_raw, write_newline_raw, write_str_raw};

static THROTTLED_ONCE: AtomicBool = AtomicBool::new(false);

/// Breakpoint (#BP). Offered to the debug hook first; an unclaimed
/// breakpoint logs and resumes at the instruction after the `int3`.
pub extern "C" fn trap_breakpoint(tf: &mut TrapFrame) {
    match super::debug::dispatch(tf) {
        Some(super::debug::Outcome::KillThread) => crate::thread::exit_current(),
        Some(outcome) => super::debug::apply_flow(outcome, tf),
        None => crate::log_warn!("#BP at rip={:#018x}", tf.rip),
    }
}

/// Debug (#DB). Single-step and hardware-watchpoint traps, routed through
/// the debug hook like #BP. An unclaimed #DB drops the trap flag so a
/// stray single-step cannot storm.
pub extern "C" fn trap_debug(tf: &mut TrapFrame) {
    match super::debug::dispatch(tf) {
        Some(super::debug::Outcome::KillThread) => crate::thread::exit_current(),
        Some(outcome) => super::debug::apply_flow(outcome, tf),
        None => {
            tf.rflags &= !super::debug::TRAP_FLAG;
            crate::log_warn!("#DB at rip={:#018x} rflags={:#x}", tf.rip, tf.rflags);
        }
    }
}

/// Invalid opcode (#UD). The current thread is beyond help; kill it.
pub extern "C" fn trap_invalid_opcode(tf: &mut TrapFrame) {
    write_str_raw("\n[#UD] invalid opcode at rip=");
    write_hex_raw(tf.rip);
    write_newline_raw();
    crate::thread::exit_current();
}

/// Page fault (#PF). Dumps the faulting address and the page-table walk,
/// then halts: this layer has no resolution policy, and the walk output is
/// what the collaborator that does needs to see.
pub extern "C" fn trap_page_fault(tf: &mut TrapFrame) {
    let cr2 = cpu::read_cr2();

    write_str_raw("\n[#PF] cr2=");
    write_hex_raw(cr2);
    write_str_raw(" err=");
    write_hex_raw(tf.error);
    write_newline_raw();
    write_str_raw("      rip=");
    write_hex_raw(tf.rip);
    write_str_raw(" rsp=");
    write_hex_raw(tf.rsp);
    write_newline_raw();

    dump_walk(cr2);

    cpu::halt_loop();
}

/// Walk the four paging levels for `va` and dump each entry raw. Uses the
/// direct map if the embedder recorded one; silent otherwise.
fn dump_walk(va: u64) {
    let Some(boot) = crate::boot_info() else {
        return;
    };

    unsafe fn read64(hhdm: u64, phys: u64) -> u64 {
        unsafe { ((hhdm + phys) as *const u64).read_volatile() }
    }

    let hhdm = boot.hhdm_base;
    let pml4_idx = (va >> 39) & 0x1ff;
    let pdpt_idx = (va >> 30) & 0x1ff;
    let pd_idx = (va >> 21) & 0x1ff;
    let pt_idx = (va >> 12) & 0x1ff;

    let pml4 = cpu::read_cr3() & !0xfff;
    let pml4e = unsafe { read64(hhdm, pml4 + 8 * pml4_idx) };
    let pdpte = if pml4e & 1 != 0 {
        unsafe { read64(hhdm, (pml4e & 0x000F_FFFF_FFFF_F000) + 8 * pdpt_idx) }
    } else {
        0
    };
    let pde = if pdpte & 1 != 0 && (pdpte & (1 << 7)) == 0 {
        unsafe { read64(hhdm, (pdpte & 0x000F_FFFF_FFFF_F000) + 8 * pd_idx) }
    } else {
        0
    };
    let pte = if pde & 1 != 0 && (pde & (1 << 7)) == 0 {
        unsafe { read64(hhdm, (pde & 0x000F_FFFF_FFFF_F000) + 8 * pt_idx) }
    } else {
        0
    };

    write_str_raw("      pml4e=");
    write_hex_raw(pml4e);
    write_str_raw(" pdpte=");
    write_hex_raw(pdpte);
    write_str_raw(" pde=");
    write_hex_raw(pde);
    write_str_raw(" pte=");
    write_hex_raw(pte);
    write_newline_raw();
}

/// General protection fault (#GP).
pub extern "C" fn trap_general_protection(tf: &mut TrapFrame) {
    write_str_raw("\n[#GP] err=");
    write_hex_raw(tf.error);
    write_newline_raw();
    write_str_raw("      rip=");
    write_hex_raw(tf.rip);
    write_str_raw(" rsp=");
    write_hex_raw(tf.rsp);
    write_str_raw(" rflags=");
    write_hex_raw(tf.rflags);
    write_newline_raw();
    write_str_raw("      cs=");
    write_hex_raw(tf.cs);
    write_str_raw(" ss=");
    write_hex_raw(tf.ss);
    write_newline_raw();

    cpu::halt_loop();
}

/// Double fault (#DF). Runs on the IST1 stack; the gate halts if we return.
pub extern "C" fn trap_double_fault(tf: &mut TrapFrame) {
    write_str_raw("\n[FATAL] DOUBLE FAULT at rip=");
    write_hex_raw(tf.rip);
    write_str_raw(" rsp=");
    write_hex_raw(tf.rsp);
    write_newline_raw();

    cpu::halt_loop();
}

/// Machine check (#MC). Nothing to salvage.
pub extern "C" fn trap_machine_check(tf: &mut TrapFrame) {
    write_str_raw("\n[FATAL] MACHINE CHECK at rip=");
    write_hex_raw(tf.rip);
    write_newline_raw();

    cpu::halt_loop();
}

/// Any installed exception vector without a dedicated handler.
pub extern "C" fn trap_unexpected(tf: &mut TrapFrame) {
    if !THROTTLED_ONCE.swap(true, Ordering::Relaxed) {
        write_str_raw("\n[INT] unexpected vec=");
        write_hex_raw(tf.vector);
        write_str_raw(" err=");
        write_hex_raw(tf.error);
        write_str_raw(" rip=");
        write_hex_raw(tf.rip);
        write_newline_raw();
    }
    cpu::halt_loop();
}

/// LAPIC timer tick. EOI first so a slow scheduling decision cannot hold
/// off the next tick edge, then hand the frame to the scheduler, which may
/// retarget the frame's rsp slot at another thread (switch-on-return).
pub extern "C" fn trap_timer(tf: &mut TrapFrame) {
    crate::apic::eoi();
    crate::logger::tick();
    crate::thread::timer_tick(tf);
}

/// Reschedule IPI. Exists to kick a halted CPU out of `hlt`; the idle loop
/// does the actual work after `iretq`.
pub extern "C" fn trap_resched_ipi(_tf: &mut TrapFrame) {
    crate::apic::eoi();
}

/// LAPIC spurious vector (minimal gate, no frame).
pub extern "C" fn trap_spurious() {
    crate::apic::eoi();
}
