//! SMP — multi-core support
//!
//! Per-CPU bookkeeping, the AP kernel entry, and (in `bringup`) the BSP
//! driver that walks secondary CPUs through the trampoline.

pub mod bringup;
pub mod trampoline;

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::cpu;

/// Maximum supported CPUs
pub const MAX_CPUS: usize = 64;

/// Number of CPUs that finished bring-up (BSP included)
static READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// Per-CPU ready flags
static CPU_READY: [AtomicBool; MAX_CPUS] = {
    const INIT: AtomicBool = AtomicBool::new(false);
    [INIT; MAX_CPUS]
};

/// LAPIC ID for each CPU slot; written by the BSP before the slot's CPU
/// runs, read by `current_cpu_id`
static CPU_APIC_IDS: [AtomicU32; MAX_CPUS] = {
    const INIT: AtomicU32 = AtomicU32::new(u32::MAX);
    [INIT; MAX_CPUS]
};

static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Map this CPU's APIC ID to its slot. Falls back to the BSP slot for an
/// unregistered CPU, which can only happen before `init`.
pub fn current_cpu_id() -> u32 {
    let apic_id = cpu::cpuid_apic_id();
    for i in 0..cpu_count() as usize {
        if CPU_APIC_IDS[i].load(Ordering::Relaxed) == apic_id {
            return i as u32;
        }
    }
    0
}

/// Total CPUs the MADT promised (BSP included)
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Relaxed)
}

/// CPUs that completed bring-up
pub fn ready_cpu_count() -> u32 {
    READY_COUNT.load(Ordering::Acquire)
}

pub fn is_cpu_ready(cpu_id: u32) -> bool {
    (cpu_id as usize) < MAX_CPUS && CPU_READY[cpu_id as usize].load(Ordering::Relaxed)
}

/// Reserve slot `cpu_id` for the CPU with `apic_id`
fn register_cpu(cpu_id: u32, apic_id: u32) {
    CPU_APIC_IDS[cpu_id as usize].store(apic_id, Ordering::SeqCst);
}

fn mark_ready(cpu_id: u32) {
    CPU_READY[cpu_id as usize].store(true, Ordering::Release);
    READY_COUNT.fetch_add(1, Ordering::Release);
}

/// Initialize SMP state on the BSP: parse ACPI, bring the LAPIC up, claim
/// slot 0. Must run before `thread::init` so `current_cpu_id` resolves.
pub fn init(boot: &crate::BootInfo) {
    crate::acpi::init(boot);

    if let Some(info) = crate::acpi::get_info() {
        crate::apic::init(boot, info.madt.lapic_addr);
        let enabled = info.madt.cpus.iter().filter(|c| c.enabled).count();
        CPU_COUNT.store(enabled.min(MAX_CPUS) as u32, Ordering::SeqCst);
    } else {
        // Single CPU, LAPIC at the architectural default
        crate::apic::init(boot, 0xFEE0_0000);
    }

    register_cpu(0, crate::apic::lapic_id());
    mark_ready(0);

    crate::log!(
        "SMP: BSP apic_id={}, {} cpu(s) reported",
        crate::apic::lapic_id(),
        cpu_count()
    );
}

/// Kernel entry for a secondary CPU, jumped to by the trampoline with a
/// fresh stack and paging live. Never returns; ends in the idle loop.
pub extern "C" fn ap_entry() -> ! {
    let apic_id = cpu::cpuid_apic_id();
    let cpu_id = current_cpu_id();

    // Own descriptor tables first: until these load, a stray interrupt or
    // fault on this core would walk the trampoline's scratch GDT
    crate::gdt::init_ap(cpu_id);
    crate::interrupts::load_on_ap();
    crate::apic::enable_lapic();

    // Scheduler identity for this core
    crate::thread::init_ap(cpu_id);

    // Per-CPU preemption timer
    crate::apic::start_timer(bringup::TIMER_INTERVAL_MS);

    mark_ready(cpu_id);
    crate::serial_println!("[SMP] AP {} online (apic_id={})", cpu_id, apic_id);

    idle_loop()
}

/// Idle: run whatever becomes ready, halt between interrupts. The
/// sti-then-hlt pair is atomic against a wakeup IPI landing in between.
pub fn idle_loop() -> ! {
    loop {
        crate::thread::yield_now();
        cpu::enable_and_halt();
    }
}
