//! AP bring-up trampoline
//!
//! The image a secondary CPU executes after its startup IPI, walking it
//! from 16-bit real mode through 32-bit protected mode into long mode and
//! out to the kernel entry named in the `ApBoot` handoff block.
//!
//! The BSP copies the image to a firmware-chosen low physical page, so
//! nothing in the 16/32-bit stages may assume a load address: the 16-bit
//! stage finds itself with the call/pop idiom and patches the scratch GDT
//! descriptor and the protected-mode far jump in place. The only external
//! fixups are the two `ApBoot`-pointer slots (`_ap_tramp_apboot_ptr32`,
//! `_ap_tramp_apboot_ptr64`), which the BSP writes before the IPI; both
//! live in the text image so no data section exists.
//!
//! Preconditions (bring-up side): the trampoline page and the `ApBoot`
//! block are identity-mapped in the page tables `ApBoot.cr3` names, and
//! the image sits below 1 MiB (SIPI addressing).

use core::arch::global_asm;

/// Shared BSP/AP handoff block, one per bring-up.
///
/// Field offsets are load-bearing: the trampoline reads them as raw
/// displacements (`[ptr + 0x08]`, `[ptr + 0x20]`, `[ptr + 0x28]`) and the
/// tests pin them. The two reserved qwords carry nothing today; APs load
/// the kernel GDT/IDT from `entry64` instead.
#[repr(C, align(16))]
pub struct ApBoot {
    /// AP writes 1 here once it reaches 64-bit mode
    pub ready_flag: u32, // 0x00
    _pad: u32,           // 0x04
    /// Physical page-table root the AP loads into CR3
    pub cr3: u64,        // 0x08
    /// Reserved (parent layout)
    pub gdt_ptr: u64,    // 0x10
    /// Reserved (parent layout)
    pub idt_ptr: u64,    // 0x18
    /// Virtual top of this AP's kernel stack
    pub stack_top: u64,  // 0x20
    /// Virtual address of the AP's kernel entry
    pub entry64: u64,    // 0x28
    /// Higher-half direct-map base, for the entry's later use
    pub hhdm: u64,       // 0x30
}

impl ApBoot {
    pub fn new(cr3: u64, stack_top: u64, entry64: u64, hhdm: u64) -> Self {
        Self {
            ready_flag: 0,
            _pad: 0,
            cr3,
            gdt_ptr: 0,
            idt_ptr: 0,
            stack_top,
            entry64,
            hhdm,
        }
    }
}

global_asm!(
    r#"
.section .text.ap_trampoline, "ax"
.balign 4096

// ─────────────────────────── 16-bit stage ───────────────────────────
// Entered by SIPI: CS = page >> 4, IP = 0, everything else undefined.

.code16
.global _ap_tramp_start
_ap_tramp_start:
    .equ TIP_PROBE_OFF, tramp_ip_probe - _ap_tramp_start
    .equ TRAMP_GDT_OFF, tramp_gdt - _ap_tramp_start
    .equ TRAMP_GDT_DESC_OFF, tramp_gdt_desc - _ap_tramp_start
    .equ TRAMP_PM_ENTRY_OFF, tramp_pm_entry - _ap_tramp_start
    .equ TRAMP_PM_TARGET_OFF, tramp_pm_target - _ap_tramp_start
    .equ AP_TRAMP_APBOOT_PTR32_OFF, _ap_tramp_apboot_ptr32 - _ap_tramp_start
    .equ TRAMP_LM_ENTRY_OFF, tramp_lm_entry - _ap_tramp_start
    cli
    cld

    // ds := cs so image-relative displacements address the image
    mov ax, cs
    mov ds, ax

    // call/pop: si := our offset within the segment, normalized to the
    // image start. Zero when entered straight from a SIPI, but the image
    // must not assume that.
    call tramp_ip_probe
tramp_ip_probe:
    pop si
    sub si, TIP_PROBE_OFF

    // ebx := linear image base = (cs << 4) + si
    movzx ebx, ax
    shl ebx, 4
    movzx eax, si
    add ebx, eax

    // Fill the scratch GDT descriptor base, then the far-jump target,
    // with linear addresses inside the image
    mov eax, ebx
    add eax, TRAMP_GDT_OFF
    mov dword ptr [si + TRAMP_GDT_DESC_OFF + 2], eax

    mov eax, ebx
    add eax, TRAMP_PM_ENTRY_OFF
    mov dword ptr [si + TRAMP_PM_TARGET_OFF], eax

    lgdt [si + TRAMP_GDT_DESC_OFF]

    // Protection enable
    mov eax, cr0
    or eax, 1
    mov cr0, eax

    // jmp far dword through the patched target, selector 0x08
    .byte 0x66, 0xEA
tramp_pm_target:
    .long 0
    .word 0x08

// ─────────────────────────── 32-bit stage ───────────────────────────

.code32
tramp_pm_entry:
    // Flat data selectors
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    // Scratch stack at the top of the trampoline page
    lea esp, [ebx + 0xFF0]

    // PAE
    mov eax, cr4
    or eax, 1 << 5
    mov cr4, eax

    // Handoff block (physical), via the 32-bit patch slot
    mov esi, dword ptr [ebx + AP_TRAMP_APBOOT_PTR32_OFF]

    // Page-table root from the handoff block
    mov eax, dword ptr [esi + 0x08]
    mov cr3, eax

    // Long-mode enable
    mov ecx, 0xC0000080
    rdmsr
    or eax, 1 << 8
    wrmsr

    // Paging on: the CPU is now in compatibility mode
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    // Far-return into the 64-bit code descriptor
    mov eax, ebx
    add eax, TRAMP_LM_ENTRY_OFF
    push 0x18
    push eax
    retf

// ─────────────────────────── 64-bit stage ───────────────────────────

.code64
tramp_lm_entry:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax

    // Handoff block again, through the 64-bit patch slot
    mov rbx, qword ptr [rip + _ap_tramp_apboot_ptr64]

    mov rsp, [rbx + 0x20]          // stack_top
    mov rax, [rbx + 0x28]          // entry64

    // Tell the BSP this AP made it to long mode
    mov dword ptr [rbx + 0x00], 1

    xor ebp, ebp
    jmp rax

// ─────────────────────────── patch slots / GDT ──────────────────────

.balign 8
.global _ap_tramp_apboot_ptr64
_ap_tramp_apboot_ptr64:
    .quad 0
.global _ap_tramp_apboot_ptr32
_ap_tramp_apboot_ptr32:
    .long 0

.balign 8
tramp_gdt:
    .quad 0
    .quad 0x00CF9A000000FFFF       // 0x08: 32-bit code, flat
    .quad 0x00CF92000000FFFF       // 0x10: data, flat
    .quad 0x00AF9A000000FFFF       // 0x18: 64-bit code
tramp_gdt_end:
tramp_gdt_desc:
    .word tramp_gdt_end - tramp_gdt - 1
    .long 0                        // base patched by the 16-bit stage

.global _ap_tramp_end
_ap_tramp_end:
"#
);

unsafe extern "C" {
    static _ap_tramp_start: u8;
    static _ap_tramp_end: u8;
    static _ap_tramp_apboot_ptr32: u8;
    static _ap_tramp_apboot_ptr64: u8;
}

/// The trampoline image and the byte offsets of its two `ApBoot`-pointer
/// patch slots: `(bytes, ptr32_offset, ptr64_offset)`.
pub fn blob() -> (&'static [u8], usize, usize) {
    unsafe {
        let start = core::ptr::addr_of!(_ap_tramp_start) as usize;
        let end = core::ptr::addr_of!(_ap_tramp_end) as usize;
        let p32 = core::ptr::addr_of!(_ap_tramp_apboot_ptr32) as usize - start;
        let p64 = core::ptr::addr_of!(_ap_tramp_apboot_ptr64) as usize - start;
        (
            core::slice::from_raw_parts(start as *const u8, end - start),
            p32,
            p64,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    #[test]
    fn apboot_offsets_are_fixed() {
        assert_eq!(offset_of!(ApBoot, ready_flag), 0x00);
        assert_eq!(offset_of!(ApBoot, cr3), 0x08);
        assert_eq!(offset_of!(ApBoot, gdt_ptr), 0x10);
        assert_eq!(offset_of!(ApBoot, idt_ptr), 0x18);
        assert_eq!(offset_of!(ApBoot, stack_top), 0x20);
        assert_eq!(offset_of!(ApBoot, entry64), 0x28);
        assert_eq!(offset_of!(ApBoot, hhdm), 0x30);
        assert_eq!(size_of::<ApBoot>(), 0x40);
    }

    #[test]
    fn image_fits_one_page() {
        let (bytes, _, _) = blob();
        assert!(!bytes.is_empty());
        assert!(bytes.len() <= 4096, "trampoline is {} bytes", bytes.len());
    }

    #[test]
    fn image_opens_with_cli_cld() {
        let (bytes, _, _) = blob();
        assert_eq!(bytes[0], 0xFA); // cli
        assert_eq!(bytes[1], 0xFC); // cld
    }

    #[test]
    fn patch_slots_sit_inside_the_image() {
        let (bytes, p32, p64) = blob();
        assert!(p32 + 4 <= bytes.len());
        assert!(p64 + 8 <= bytes.len());
        // slots are distinct and non-overlapping
        assert!(p32 >= p64 + 8 || p64 >= p32 + 4);
        // unpatched slots read as zero
        assert_eq!(&bytes[p32..p32 + 4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[p64..p64 + 8], &[0u8; 8]);
    }

    #[test]
    fn embedded_gdt_carries_the_three_flat_descriptors() {
        let (bytes, _, _) = blob();
        for desc in [0x00CF9A000000FFFFu64, 0x00CF92000000FFFF, 0x00AF9A000000FFFF] {
            let needle = desc.to_le_bytes();
            assert!(
                bytes.windows(8).any(|w| w == needle),
                "descriptor {:#018x} missing",
                desc
            );
        }
    }
}
