//! VireoOS x86_64 CPU core
//!
//! The pieces of the kernel that sit directly on the architectural contract:
//! interrupt/exception entry and exit, kernel-thread context switching, and
//! the trampoline that walks a secondary CPU from real mode into long mode.
//!
//! Everything above this layer (scheduler policy, page-fault resolution,
//! timer accounting, allocation) is an external collaborator. The embedding
//! kernel initializes the core in this order:
//! 1. Serial port (for early debug output)
//! 2. GDT/TSS (double-fault IST stack must exist before the IDT is live)
//! 3. IDT + legacy PIC mask-out
//! 4. LAPIC (EOI/IPI/timer)
//! 5. Thread subsystem
//! 6. SMP bring-up (needs ACPI enumeration and a filled `BootInfo`)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// Architecture layer (port I/O, MSRs, UART)
pub mod arch;

// Ambient services
#[macro_use]
pub mod serial;
#[macro_use]
pub mod logger;

// Descriptor tables
pub mod gdt;

// Trap gates and handlers
pub mod interrupts;

// Kernel threads and the context-switch primitive
pub mod thread;

// Local APIC (EOI, IPIs, preemption timer)
pub mod apic;

// ACPI tables (CPU enumeration for SMP)
pub mod acpi;

// Secondary-CPU bring-up
pub mod smp;

/// Values the embedding kernel hands down from its boot protocol.
///
/// `hhdm_base` is the higher-half direct-map offset (virt = phys + hhdm_base
/// for all physical memory the core touches). `rsdp_addr` is the physical
/// address of the ACPI RSDP, or 0 to fall back to the BIOS-range scan.
#[derive(Debug, Clone, Copy)]
pub struct BootInfo {
    pub hhdm_base: u64,
    pub rsdp_addr: u64,
}

impl BootInfo {
    /// Translate a physical address through the direct map.
    #[inline]
    pub fn phys_to_virt(&self, phys: u64) -> u64 {
        self.hhdm_base + phys
    }

    /// Translate a direct-mapped virtual address back to physical.
    #[inline]
    pub fn virt_to_phys(&self, virt: u64) -> u64 {
        virt - self.hhdm_base
    }
}

static BOOT_INFO: spin::Once<BootInfo> = spin::Once::new();

/// Record the embedder's boot values. Call once, before `acpi::init` or
/// `smp::bringup::start_aps`; the fault handlers also read this for their
/// page-walk dumps.
pub fn record_boot_info(info: BootInfo) {
    BOOT_INFO.call_once(|| info);
}

/// The recorded boot values, if the embedder has provided them yet.
pub fn boot_info() -> Option<BootInfo> {
    BOOT_INFO.get().copied()
}
