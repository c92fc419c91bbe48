//! Interrupt handling
//!
//! Gate stubs build a `TrapFrame` per event and dispatch to typed handlers;
//! the IDT points every installed vector at its gate. The double-fault
//! entry runs on IST1 (see `gdt`) so a corrupt kernel stack cannot turn a
//! #DF into a triple fault.

pub mod debug;
pub mod frame;
pub mod gates;
pub mod handlers;
mod pic;

pub use frame::{TrapFrame, TRAP_FRAME_SIZE};
pub use gates::{entry_for_vector, has_error_code, trap_frame_resume};

use lazy_static::lazy_static;
use x86_64::structures::idt::InterruptDescriptorTable;
use x86_64::VirtAddr;

/// LAPIC timer vector (first free slot past the legacy PIC range)
pub const TIMER_VECTOR: u8 = 48;
/// Reschedule IPI vector (wakes APs out of `hlt`)
pub const RESCHED_VECTOR: u8 = 0xFE;
/// LAPIC spurious vector
pub const SPURIOUS_VECTOR: u8 = 0xFF;

lazy_static! {
    /// Interrupt Descriptor Table, shared by every CPU.
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        let gate = |v: u8| VirtAddr::new(gates::entry_for_vector(v).unwrap());

        unsafe {
            idt.divide_error.set_handler_addr(gate(0));
            idt.debug.set_handler_addr(gate(1));
            idt.non_maskable_interrupt.set_handler_addr(gate(2));
            idt.breakpoint.set_handler_addr(gate(3));
            idt.overflow.set_handler_addr(gate(4));
            idt.bound_range_exceeded.set_handler_addr(gate(5));
            idt.invalid_opcode.set_handler_addr(gate(6));
            idt.device_not_available.set_handler_addr(gate(7));
            idt.double_fault
                .set_handler_addr(gate(8))
                .set_stack_index(crate::gdt::DOUBLE_FAULT_IST_INDEX);
            idt[9].set_handler_addr(gate(9));
            idt.invalid_tss.set_handler_addr(gate(10));
            idt.segment_not_present.set_handler_addr(gate(11));
            idt.stack_segment_fault.set_handler_addr(gate(12));
            idt.general_protection_fault.set_handler_addr(gate(13));
            idt.page_fault.set_handler_addr(gate(14));
            idt.x87_floating_point.set_handler_addr(gate(16));
            idt.alignment_check.set_handler_addr(gate(17));
            idt.machine_check.set_handler_addr(gate(18));
            idt.simd_floating_point.set_handler_addr(gate(19));
            idt.virtualization.set_handler_addr(gate(20));

            idt[TIMER_VECTOR as usize].set_handler_addr(gate(TIMER_VECTOR));
            idt[RESCHED_VECTOR as usize].set_handler_addr(gate(RESCHED_VECTOR));
            idt[SPURIOUS_VECTOR as usize].set_handler_addr(gate(SPURIOUS_VECTOR));
        }

        idt
    };
}

/// Initialize interrupt handling on the BSP: load the IDT, remap and mask
/// the legacy PICs. Interrupts stay disabled; the embedder enables them
/// once the LAPIC timer is armed.
pub fn init() {
    IDT.load();
    unsafe {
        pic::remap_and_mask();
    }
    crate::log_debug!("IDT loaded, legacy PIC masked");
}

/// Load the shared IDT on an Application Processor.
pub fn load_on_ap() {
    IDT.load();
}

/// Run a closure with interrupts disabled.
pub fn without_interrupts<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    x86_64::instructions::interrupts::without_interrupts(f)
}

/// Enable interrupts on this CPU.
#[inline]
pub fn enable() {
    x86_64::instructions::interrupts::enable();
}

/// Disable interrupts on this CPU.
#[inline]
pub fn disable() {
    x86_64::instructions::interrupts::disable();
}
