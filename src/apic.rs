//! APIC — Local APIC driver
//!
//! The LAPIC is the core's interrupt fabric: EOI for every gate, the
//! periodic timer that drives preemption, fixed IPIs to kick halted CPUs,
//! and the INIT/SIPI sequence that wakes APs into the trampoline.
//!
//! Registers are memory-mapped at the physical address the MADT reports,
//! reached through the direct map. xAPIC MMIO mode only; the parent
//! chipset-quirk layers (x2APIC, I/O APIC routing) are collaborators.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::arch::cpu::{inb, outb};

// ═══════════════════════════════════════════════════════════════════════
// Local APIC register offsets (bytes)
// ═══════════════════════════════════════════════════════════════════════

const LAPIC_ID: u32 = 0x020;        // Local APIC ID
const LAPIC_TPR: u32 = 0x080;       // Task Priority Register
const LAPIC_EOI: u32 = 0x0B0;       // End Of Interrupt
const LAPIC_SVR: u32 = 0x0F0;       // Spurious Interrupt Vector Register
const LAPIC_ICR_LO: u32 = 0x300;    // Interrupt Command Register (low)
const LAPIC_ICR_HI: u32 = 0x310;    // Interrupt Command Register (high)
const LAPIC_TIMER_LVT: u32 = 0x320; // Timer LVT entry
const LAPIC_TIMER_ICR: u32 = 0x380; // Timer Initial Count Register
const LAPIC_TIMER_CCR: u32 = 0x390; // Timer Current Count Register
const LAPIC_TIMER_DCR: u32 = 0x3E0; // Timer Divide Configuration Register

// SVR bits
const SVR_APIC_ENABLED: u32 = 1 << 8;

// ICR bits
const ICR_DELIVERY_PENDING: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_TRIGGER_LEVEL: u32 = 1 << 15;
const ICR_DELIVERY_INIT: u32 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u32 = 0b110 << 8;

// Timer LVT bits
const TIMER_PERIODIC: u32 = 1 << 17;
const TIMER_MASKED: u32 = 1 << 16;

// Divide configuration: divide by 16
const TIMER_DIV_16: u32 = 0x03;

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

static LAPIC_BASE_VIRT: AtomicU64 = AtomicU64::new(0);
static APIC_ENABLED: AtomicBool = AtomicBool::new(false);

/// Timer ticks per millisecond, PIT-calibrated on the BSP
static TICKS_PER_MS: AtomicU64 = AtomicU64::new(0);

/// Read a LAPIC register
#[inline]
unsafe fn lapic_read(offset: u32) -> u32 {
    let base = LAPIC_BASE_VIRT.load(Ordering::Relaxed);
    core::ptr::read_volatile((base + offset as u64) as *const u32)
}

/// Write a LAPIC register
#[inline]
unsafe fn lapic_write(offset: u32, value: u32) {
    let base = LAPIC_BASE_VIRT.load(Ordering::Relaxed);
    core::ptr::write_volatile((base + offset as u64) as *mut u32, value);
}

/// Initialize the LAPIC on the BSP. `lapic_phys` comes from the MADT;
/// the register window is reached through the direct map.
pub fn init(boot: &crate::BootInfo, lapic_phys: u64) {
    LAPIC_BASE_VIRT.store(boot.phys_to_virt(lapic_phys), Ordering::SeqCst);
    enable_lapic();
    APIC_ENABLED.store(true, Ordering::SeqCst);

    let tpm = calibrate_timer();
    TICKS_PER_MS.store(tpm, Ordering::SeqCst);

    crate::log!("LAPIC at {:#x}, id {}", lapic_phys, lapic_id());
}

/// Enable the LAPIC on the calling CPU (BSP or AP).
pub fn enable_lapic() {
    unsafe {
        // Spurious vector register: software-enable + spurious vector
        let svr = lapic_read(LAPIC_SVR);
        lapic_write(
            LAPIC_SVR,
            svr | SVR_APIC_ENABLED | crate::interrupts::SPURIOUS_VECTOR as u32,
        );

        // Accept all priorities
        lapic_write(LAPIC_TPR, 0);
    }
}

/// Send End-Of-Interrupt
pub fn eoi() {
    if APIC_ENABLED.load(Ordering::Relaxed) {
        unsafe {
            lapic_write(LAPIC_EOI, 0);
        }
    }
}

/// This CPU's LAPIC ID
pub fn lapic_id() -> u32 {
    unsafe { lapic_read(LAPIC_ID) >> 24 }
}

// ═══════════════════════════════════════════════════════════════════════
// IPIs
// ═══════════════════════════════════════════════════════════════════════

/// Spin until the previous ICR command is delivered
fn icr_wait() {
    unsafe {
        while lapic_read(LAPIC_ICR_LO) & ICR_DELIVERY_PENDING != 0 {
            core::hint::spin_loop();
        }
    }
}

/// Send a fixed IPI to a specific CPU (by APIC ID)
pub fn send_ipi(target_apic_id: u32, vector: u8) {
    unsafe {
        // HI must be written before LO in xAPIC MMIO mode
        lapic_write(LAPIC_ICR_HI, target_apic_id << 24);
        lapic_write(LAPIC_ICR_LO, vector as u32);
    }
    icr_wait();
}

/// Broadcast a fixed IPI to every CPU but this one. Used to kick halted
/// cores when new work becomes runnable.
pub fn send_ipi_all_others(vector: u8) {
    if !APIC_ENABLED.load(Ordering::Relaxed) {
        return;
    }
    unsafe {
        lapic_write(LAPIC_ICR_HI, 0);
        // destination shorthand 0b11 = all excluding self
        lapic_write(LAPIC_ICR_LO, (0b11 << 18) | vector as u32);
    }
    icr_wait();
}

/// Send the INIT IPI (assert then deassert) that resets an AP into
/// wait-for-SIPI state.
pub unsafe fn send_init(target_apic_id: u32) {
    unsafe {
        lapic_write(LAPIC_ICR_HI, target_apic_id << 24);
        lapic_write(LAPIC_ICR_LO, ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL | ICR_LEVEL_ASSERT);
        icr_wait();

        lapic_write(LAPIC_ICR_HI, target_apic_id << 24);
        lapic_write(LAPIC_ICR_LO, ICR_DELIVERY_INIT | ICR_TRIGGER_LEVEL);
        icr_wait();
    }
}

/// Send a startup IPI. The low 8 bits carry the physical page number the
/// AP starts executing at (`vector * 0x1000`).
pub unsafe fn send_startup(target_apic_id: u32, vector: u8) {
    unsafe {
        lapic_write(LAPIC_ICR_HI, target_apic_id << 24);
        lapic_write(LAPIC_ICR_LO, ICR_DELIVERY_STARTUP | vector as u32);
        icr_wait();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Timer
// ═══════════════════════════════════════════════════════════════════════

/// Calibrate the LAPIC timer against the PIT. Returns ticks per ms.
fn calibrate_timer() -> u64 {
    unsafe {
        // Divide by 16, one-shot, masked
        lapic_write(LAPIC_TIMER_DCR, TIMER_DIV_16);
        lapic_write(LAPIC_TIMER_LVT, TIMER_MASKED);

        // Large initial count, then a known 10ms wait
        lapic_write(LAPIC_TIMER_ICR, 0xFFFF_FFFF);
        pit_delay_ms(10);

        let remaining = lapic_read(LAPIC_TIMER_CCR);
        let elapsed = 0xFFFF_FFFFu64 - remaining as u64;

        lapic_write(LAPIC_TIMER_LVT, TIMER_MASKED);
        lapic_write(LAPIC_TIMER_ICR, 0);

        let tpm = elapsed / 10;
        crate::log_debug!("LAPIC timer: {} ticks/ms", tpm);
        tpm
    }
}

/// Start the periodic timer on the calling CPU. `interval_ms` between
/// interrupts on `interrupts::TIMER_VECTOR`.
pub fn start_timer(interval_ms: u64) {
    let tpm = TICKS_PER_MS.load(Ordering::Relaxed);
    if tpm == 0 {
        crate::log_warn!("LAPIC timer not calibrated, not starting");
        return;
    }

    let count = tpm * interval_ms;
    unsafe {
        lapic_write(LAPIC_TIMER_DCR, TIMER_DIV_16);
        lapic_write(
            LAPIC_TIMER_LVT,
            TIMER_PERIODIC | crate::interrupts::TIMER_VECTOR as u32,
        );
        lapic_write(LAPIC_TIMER_ICR, count as u32);
    }
}

/// Stop the timer on the calling CPU.
pub fn stop_timer() {
    unsafe {
        lapic_write(LAPIC_TIMER_LVT, TIMER_MASKED);
        lapic_write(LAPIC_TIMER_ICR, 0);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// PIT one-shot delay
// ═══════════════════════════════════════════════════════════════════════

/// Delay using PIT channel 2 in one-shot mode, gated through port 0x61.
/// Used for timer calibration and the post-INIT settle time during AP
/// bring-up, both before any calibrated clock exists.
pub fn pit_delay_ms(millis: u64) {
    const PIT_FREQ: u64 = 1_193_182;
    const PIT_CHANNEL2: u16 = 0x42;
    const PIT_COMMAND: u16 = 0x43;
    // PIT max count = 65535 → max ~54.9ms per shot
    const MAX_MS_PER_SHOT: u64 = 50;

    let mut remaining = millis;
    while remaining > 0 {
        let chunk = remaining.min(MAX_MS_PER_SHOT);
        let pit_count = (PIT_FREQ * chunk / 1000) as u16;
        if pit_count == 0 {
            break;
        }

        unsafe {
            // Save port 0x61, disable the gate to reset the counter
            let val = inb(0x61);
            outb(0x61, val & !0x01);

            // Channel 2, lobyte/hibyte, mode 0 (one-shot), binary
            outb(PIT_COMMAND, 0b1011_0000);
            outb(PIT_CHANNEL2, (pit_count & 0xFF) as u8);
            outb(PIT_CHANNEL2, (pit_count >> 8) as u8);

            // Enable the gate to start counting
            outb(0x61, (val & !0x20) | 0x01);

            // Bit 5 of port 0x61 goes high when the counter hits 0
            while inb(0x61) & 0x20 == 0 {
                core::hint::spin_loop();
            }

            outb(0x61, val);
        }
        remaining -= chunk;
    }
}

/// Microsecond-scale spin for the SIPI spacing, TSC-based.
pub fn spin_delay_us(microseconds: u64) {
    // Assume ~2GHz; the SIPI protocol only needs order-of-magnitude timing
    let cycles = microseconds * 2000;
    let start = crate::arch::cpu::read_tsc();
    while crate::arch::cpu::read_tsc().wrapping_sub(start) < cycles {
        core::hint::spin_loop();
    }
}
