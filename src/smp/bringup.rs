//! AP bring-up driver (BSP side)
//!
//! One AP at a time: copy the trampoline to a low page, patch its two
//! `ApBoot`-pointer slots, fire INIT/SIPI/SIPI, and poll `ready_flag`
//! until the AP reports from long mode or the timeout says it never will.
//!
//! Requires, beyond `smp::init`: the trampoline page and the `ApBoot`
//! blocks identity-mapped in the BSP's page tables (the AP runs on the
//! BSP's CR3), and the kernel heap reachable through the direct map so
//! leaked boxes translate to physical addresses by subtracting the HHDM
//! base.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{compiler_fence, Ordering};

use super::trampoline::{self, ApBoot};

/// Physical page the trampoline is copied to: page-aligned, below 1 MiB,
/// clear of the BIOS data area and the EBDA
const TRAMP_PHYS: u64 = 0x8000;

/// Per-AP kernel stack size
const AP_STACK_SIZE: usize = 16 * 1024;

/// Preemption timer period, every CPU
pub const TIMER_INTERVAL_MS: u64 = 10;

/// Spins while polling `ready_flag` before giving a CPU up for dead
const READY_TIMEOUT_SPINS: u64 = 1_000_000;

/// Bring every enabled AP online. Returns the number of CPUs running
/// afterwards, the BSP included.
pub fn start_aps(boot: &crate::BootInfo) -> u32 {
    let Some(info) = crate::acpi::get_info() else {
        crate::log!("SMP: no ACPI topology, staying single-core");
        return 1;
    };

    let (blob, p32_off, p64_off) = trampoline::blob();
    if blob.len() > 4096 {
        crate::log_error!("SMP: trampoline too large ({} bytes)", blob.len());
        return 1;
    }

    // Stage the image in its low page
    let tramp_virt = boot.phys_to_virt(TRAMP_PHYS);
    unsafe {
        ptr::copy_nonoverlapping(blob.as_ptr(), tramp_virt as *mut u8, blob.len());
    }
    let sipi_vector = (TRAMP_PHYS >> 12) as u8;

    // APs share the BSP's page tables
    let cr3 = crate::arch::cpu::read_cr3();
    let entry64 = super::ap_entry as u64;
    let bsp_apic = crate::apic::lapic_id();

    let mut next_cpu_id = 1u32;
    for madt_cpu in info.madt.cpus.iter().filter(|c| c.enabled) {
        if madt_cpu.apic_id == bsp_apic {
            continue;
        }
        if next_cpu_id as usize >= super::MAX_CPUS {
            crate::log_warn!("SMP: more CPUs than slots, stopping at {}", next_cpu_id);
            break;
        }
        let cpu_id = next_cpu_id;
        next_cpu_id += 1;

        // Per-AP stack, kept forever
        let stack: Vec<u8> = alloc::vec![0u8; AP_STACK_SIZE];
        let stack_top = (stack.as_ptr() as u64 + AP_STACK_SIZE as u64) & !0xF;
        core::mem::forget(stack);

        // Per-AP handoff block, also kept: the AP reads it after we return
        let ab: &'static mut ApBoot = Box::leak(Box::new(ApBoot::new(
            cr3,
            stack_top,
            entry64,
            boot.hhdm_base,
        )));
        let ab_phys = boot.virt_to_phys(ab as *mut ApBoot as u64);

        // Patch the image with this AP's block
        unsafe {
            ((tramp_virt + p32_off as u64) as *mut u32).write_volatile(ab_phys as u32);
            ((tramp_virt + p64_off as u64) as *mut u64).write_volatile(ab_phys);
        }
        compiler_fence(Ordering::SeqCst);

        // The AP resolves its slot by APIC ID; the mapping must exist
        // before the AP can run
        super::register_cpu(cpu_id, madt_cpu.apic_id);

        crate::log!(
            "SMP: waking cpu {} (apic_id={}) via vector {:#04x}",
            cpu_id,
            madt_cpu.apic_id,
            sipi_vector
        );

        // INIT, settle, SIPI twice per the protocol
        unsafe {
            crate::apic::send_init(madt_cpu.apic_id);
            crate::apic::pit_delay_ms(10);
            crate::apic::send_startup(madt_cpu.apic_id, sipi_vector);
            crate::apic::spin_delay_us(200);
            crate::apic::send_startup(madt_cpu.apic_id, sipi_vector);
        }

        if !wait_ready(&ab.ready_flag) {
            crate::log_warn!(
                "SMP: cpu {} (apic_id={}) never signalled ready, abandoning it",
                cpu_id,
                madt_cpu.apic_id
            );
        }
    }

    let online = super::ready_cpu_count();
    crate::log!("SMP: {} cpu(s) online", online);
    online
}

/// Poll the AP's `ready_flag` until it flips or the spin count runs out.
fn wait_ready(flag: *const u32) -> bool {
    for _ in 0..READY_TIMEOUT_SPINS {
        if unsafe { ptr::read_volatile(flag) } != 0 {
            return true;
        }
        core::hint::spin_loop();
    }
    false
}
