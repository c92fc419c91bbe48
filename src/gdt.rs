//! GDT — Global Descriptor Table
//!
//! Flat kernel-only segmentation plus a 64-bit TSS per CPU. The TSS exists
//! for one reason at this layer: the double-fault gate must run on a known
//! good stack (IST1), so a corrupt kernel stack cannot escalate a #DF into a
//! triple fault.
//!
//! GDT layout:
//! - 0x00: Null descriptor
//! - 0x08: Kernel code (Ring 0)
//! - 0x10: Kernel data (Ring 0)
//! - 0x18: TSS (16 bytes)

use core::mem::size_of;

/// Segment selector for kernel code
pub const KERNEL_CODE_SELECTOR: u16 = 0x08;
/// Segment selector for kernel data
pub const KERNEL_DATA_SELECTOR: u16 = 0x10;
/// TSS selector
pub const TSS_SELECTOR: u16 = 0x18;

/// IST slot used by the double-fault gate (IST1)
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

/// Per-CPU table capacity
const MAX_CPUS: usize = 64;

/// Size of each exception/kernel stack handed to the TSS
const STACK_SIZE: usize = 16 * 1024;

/// GDT entry (64-bit mode)
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct GdtEntry {
    limit_low: u16,
    base_low: u16,
    base_middle: u8,
    access: u8,
    granularity: u8,
    base_high: u8,
}

impl GdtEntry {
    pub const fn null() -> Self {
        Self {
            limit_low: 0,
            base_low: 0,
            base_middle: 0,
            access: 0,
            granularity: 0,
            base_high: 0,
        }
    }

    /// Kernel code segment descriptor (long mode)
    pub const fn kernel_code() -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_middle: 0,
            access: 0x9A,      // Present + DPL 0 + Code + Readable
            granularity: 0xAF, // Long mode + 4K granularity + limit high
            base_high: 0,
        }
    }

    /// Kernel data segment descriptor
    pub const fn kernel_data() -> Self {
        Self {
            limit_low: 0xFFFF,
            base_low: 0,
            base_middle: 0,
            access: 0x92,      // Present + DPL 0 + Data + Writable
            granularity: 0xCF, // 4K granularity + limit high
            base_high: 0,
        }
    }
}

/// TSS entry in the GDT (16 bytes for a 64-bit TSS)
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct TssEntry {
    length: u16,
    base_low: u16,
    base_middle: u8,
    flags1: u8,
    flags2: u8,
    base_high: u8,
    base_upper: u32,
    reserved: u32,
}

impl TssEntry {
    pub const fn null() -> Self {
        Self {
            length: 0,
            base_low: 0,
            base_middle: 0,
            flags1: 0,
            flags2: 0,
            base_high: 0,
            base_upper: 0,
            reserved: 0,
        }
    }

    /// TSS descriptor for the segment at `tss_addr`
    pub fn new(tss_addr: u64) -> Self {
        let base = tss_addr;
        let limit = (size_of::<TaskStateSegment>() - 1) as u16;

        Self {
            length: limit,
            base_low: base as u16,
            base_middle: (base >> 16) as u8,
            flags1: 0x89, // Present + 64-bit TSS (available)
            flags2: 0x00,
            base_high: (base >> 24) as u8,
            base_upper: (base >> 32) as u32,
            reserved: 0,
        }
    }
}

/// Task State Segment (64-bit)
#[derive(Clone, Copy, Debug)]
#[repr(C, packed)]
pub struct TaskStateSegment {
    reserved1: u32,
    /// Stack pointers for privilege levels 0-2
    pub rsp: [u64; 3],
    reserved2: u64,
    /// Interrupt Stack Table pointers
    pub ist: [u64; 7],
    reserved3: u64,
    reserved4: u16,
    /// I/O map base address
    pub iomap_base: u16,
}

impl TaskStateSegment {
    pub const fn new() -> Self {
        Self {
            reserved1: 0,
            rsp: [0; 3],
            reserved2: 0,
            ist: [0; 7],
            reserved3: 0,
            reserved4: 0,
            iomap_base: size_of::<TaskStateSegment>() as u16,
        }
    }
}

/// Complete GDT: null, kernel_code, kernel_data, tss
#[repr(C, packed)]
pub struct Gdt {
    pub null: GdtEntry,
    pub kernel_code: GdtEntry,
    pub kernel_data: GdtEntry,
    pub tss: TssEntry,
}

impl Gdt {
    pub const fn new() -> Self {
        Self {
            null: GdtEntry::null(),
            kernel_code: GdtEntry::kernel_code(),
            kernel_data: GdtEntry::kernel_data(),
            tss: TssEntry::null(),
        }
    }
}

/// GDT pointer structure for `lgdt`
#[repr(C, packed)]
pub struct GdtPtr {
    pub limit: u16,
    pub base: u64,
}

// Per-CPU GDT and TSS. Slot 0 is the BSP; each AP needs its own TSS so the
// double-fault IST stack is private to that core.
static mut PER_CPU_GDT: [Gdt; MAX_CPUS] = {
    const INIT: Gdt = Gdt::new();
    [INIT; MAX_CPUS]
};
static mut PER_CPU_TSS: [TaskStateSegment; MAX_CPUS] = {
    const INIT: TaskStateSegment = TaskStateSegment::new();
    [INIT; MAX_CPUS]
};

/// Allocate a kernel stack (returns the top of the stack)
fn alloc_kernel_stack() -> u64 {
    use alloc::vec::Vec;

    let stack: Vec<u8> = alloc::vec![0u8; STACK_SIZE];
    let stack_top = stack.as_ptr() as u64 + STACK_SIZE as u64;

    // Leak the stack so it persists
    core::mem::forget(stack);

    stack_top
}

/// Build and load the GDT/TSS for one CPU slot
unsafe fn load_for_cpu(idx: usize) {
    unsafe {
        // Dedicated stack for the double-fault gate
        let ist1_stack = alloc_kernel_stack();
        PER_CPU_TSS[idx].ist[DOUBLE_FAULT_IST_INDEX as usize] = ist1_stack;

        // Point this slot's GDT at its TSS
        PER_CPU_GDT[idx] = Gdt::new();
        let tss_addr = core::ptr::addr_of!(PER_CPU_TSS[idx]) as u64;
        PER_CPU_GDT[idx].tss = TssEntry::new(tss_addr);

        let gdt_ptr = GdtPtr {
            limit: (size_of::<Gdt>() - 1) as u16,
            base: core::ptr::addr_of!(PER_CPU_GDT[idx]) as u64,
        };

        // Load GDT
        core::arch::asm!(
            "lgdt [{}]",
            in(reg) &gdt_ptr,
            options(readonly, nostack, preserves_flags)
        );

        // Reload code segment (far return)
        core::arch::asm!(
            "push {sel}",
            "lea {tmp}, [rip + 2f]",
            "push {tmp}",
            "retfq",
            "2:",
            sel = in(reg) KERNEL_CODE_SELECTOR as u64,
            tmp = lateout(reg) _,
            options(preserves_flags)
        );

        // Reload data segments
        core::arch::asm!(
            "mov ds, {0:x}",
            "mov es, {0:x}",
            "mov ss, {0:x}",
            in(reg) KERNEL_DATA_SELECTOR,
            options(nostack, preserves_flags)
        );

        // Load TSS
        core::arch::asm!(
            "ltr {0:x}",
            in(reg) TSS_SELECTOR,
            options(nostack, preserves_flags)
        );
    }
}

/// Initialize GDT/TSS on the BSP
pub fn init() {
    unsafe {
        load_for_cpu(0);
    }
    crate::log_debug!("GDT/TSS loaded, #DF IST stack installed");
}

/// Initialize GDT/TSS for an Application Processor
pub fn init_ap(cpu_id: u32) {
    let idx = cpu_id as usize;
    if idx == 0 || idx >= MAX_CPUS {
        return;
    }
    unsafe {
        load_for_cpu(idx);
    }
    crate::serial_println!("[GDT] AP {} GDT/TSS loaded", cpu_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gdt_selectors_match_layout() {
        assert_eq!(core::mem::offset_of!(Gdt, kernel_code), KERNEL_CODE_SELECTOR as usize);
        assert_eq!(core::mem::offset_of!(Gdt, kernel_data), KERNEL_DATA_SELECTOR as usize);
        assert_eq!(core::mem::offset_of!(Gdt, tss), TSS_SELECTOR as usize);
    }

    #[test]
    fn tss_is_packed_to_architectural_size() {
        // 64-bit TSS is 104 bytes
        assert_eq!(size_of::<TaskStateSegment>(), 104);
    }

    #[test]
    fn tss_descriptor_splits_base() {
        let entry = TssEntry::new(0x1234_5678_9ABC_DEF0);
        assert_eq!({ entry.base_low }, 0xDEF0);
        assert_eq!(entry.base_middle, 0xBC);
        assert_eq!(entry.base_high, 0x9A);
        assert_eq!({ entry.base_upper }, 0x1234_5678);
    }
}
