//! ACPI support
//!
//! Only what SMP bring-up consumes: locate the RSDP, walk the RSDT/XSDT,
//! and parse the MADT into a CPU list plus the LAPIC address. The wider
//! table set (FADT, MCFG, HPET) belongs to the surrounding kernel.

pub mod madt;
pub mod tables;

use core::ptr;

use spin::Once;

use tables::{checksum_ok, Rsdp, SdtHeader, Xsdp};

/// BIOS memory range scanned for the RSDP when the bootloader gives none
const RSDP_SEARCH_START: u64 = 0xE0000;
const RSDP_SEARCH_END: u64 = 0x100000;

/// ACPI information the core keeps
#[derive(Debug, Clone)]
pub struct AcpiInfo {
    /// ACPI revision (0 = 1.0, 2+ = 2.0+)
    pub revision: u8,
    /// CPUs and the LAPIC window from the MADT
    pub madt: madt::MadtInfo,
}

static ACPI_INFO: Once<AcpiInfo> = Once::new();

/// Parsed ACPI information (`init` must have succeeded)
pub fn get_info() -> Option<&'static AcpiInfo> {
    ACPI_INFO.get()
}

/// Locate and parse the tables. Returns false when no usable MADT exists,
/// in which case the machine is treated as single-CPU.
pub fn init(boot: &crate::BootInfo) -> bool {
    let Some((revision, rsdt_phys, xsdt_phys)) = find_rsdp(boot) else {
        crate::log_warn!("ACPI: no RSDP found");
        return false;
    };

    let madt_phys = if xsdt_phys != 0 {
        find_table(boot, xsdt_phys, b"XSDT", 8, b"APIC")
            .or_else(|| find_table(boot, rsdt_phys, b"RSDT", 4, b"APIC"))
    } else {
        find_table(boot, rsdt_phys, b"RSDT", 4, b"APIC")
    };
    let Some(madt_phys) = madt_phys else {
        crate::log_warn!("ACPI: MADT not found");
        return false;
    };

    let table = boot.phys_to_virt(madt_phys) as *const u8;
    let header = unsafe { ptr::read_unaligned(table as *const SdtHeader) };
    let len = header.length as usize;
    let body = unsafe { core::slice::from_raw_parts(table, len) };
    if !checksum_ok(body) {
        crate::log_warn!("ACPI: MADT checksum mismatch");
        return false;
    }

    let Some(info) = (unsafe { madt::parse(table, len) }) else {
        crate::log_warn!("ACPI: MADT lists no CPUs");
        return false;
    };

    for (i, cpu) in info.cpus.iter().enumerate() {
        crate::log_debug!(
            "ACPI: cpu#{:02} apic_id={} enabled={}",
            i,
            cpu.apic_id,
            cpu.enabled
        );
    }

    ACPI_INFO.call_once(|| AcpiInfo {
        revision,
        madt: info,
    });
    true
}

/// Find the RSDP: bootloader-provided address first, BIOS scan second.
/// Returns (revision, rsdt_phys, xsdt_phys).
fn find_rsdp(boot: &crate::BootInfo) -> Option<(u8, u64, u64)> {
    if boot.rsdp_addr != 0 {
        if let Some(found) = validate_rsdp_at(boot, boot.rsdp_addr) {
            return Some(found);
        }
        crate::log_warn!("ACPI: bootloader RSDP invalid, scanning BIOS range");
    }

    for phys in (RSDP_SEARCH_START..RSDP_SEARCH_END).step_by(16) {
        if let Some(found) = validate_rsdp_at(boot, phys) {
            return Some(found);
        }
    }
    None
}

fn validate_rsdp_at(boot: &crate::BootInfo, phys: u64) -> Option<(u8, u64, u64)> {
    let virt = boot.phys_to_virt(phys) as *const u8;
    let v1_len = core::mem::size_of::<Rsdp>();
    let bytes = unsafe { core::slice::from_raw_parts(virt, v1_len) };

    if &bytes[0..8] != b"RSD PTR " {
        return None;
    }
    if !checksum_ok(&bytes[..20]) {
        return None;
    }

    let v1 = unsafe { ptr::read_unaligned(virt as *const Rsdp) };
    if v1.revision < 2 {
        return Some((v1.revision, v1.rsdt_address as u64, 0));
    }

    let v2_len = core::mem::size_of::<Xsdp>();
    let bytes2 = unsafe { core::slice::from_raw_parts(virt, v2_len) };
    let v2 = unsafe { ptr::read_unaligned(virt as *const Xsdp) };
    let total = (v2.length as usize).min(v2_len).max(20);
    if !checksum_ok(&bytes2[..total]) {
        return None;
    }

    Some((v1.revision, v1.rsdt_address as u64, v2.xsdt_address))
}

/// Walk an RSDT (4-byte entries) or XSDT (8-byte entries) for `sig`.
fn find_table(
    boot: &crate::BootInfo,
    root_phys: u64,
    root_sig: &[u8; 4],
    entry_size: usize,
    sig: &[u8; 4],
) -> Option<u64> {
    if root_phys == 0 {
        return None;
    }

    let root = boot.phys_to_virt(root_phys) as *const u8;
    let header = unsafe { ptr::read_unaligned(root as *const SdtHeader) };
    let root_found = header.signature;
    if root_found != *root_sig {
        return None;
    }

    let total_len = header.length as usize;
    let header_len = core::mem::size_of::<SdtHeader>();
    if total_len < header_len {
        return None;
    }
    let entries = (total_len - header_len) / entry_size;

    for i in 0..entries {
        let at = unsafe { root.add(header_len + i * entry_size) };
        let entry_phys = if entry_size == 8 {
            u64::from_le_bytes(unsafe { ptr::read_unaligned(at as *const [u8; 8]) })
        } else {
            u32::from_le_bytes(unsafe { ptr::read_unaligned(at as *const [u8; 4]) }) as u64
        };
        if entry_phys == 0 {
            continue;
        }

        let hdr = unsafe {
            ptr::read_unaligned(boot.phys_to_virt(entry_phys) as *const SdtHeader)
        };
        let found = hdr.signature;
        if found == *sig {
            return Some(entry_phys);
        }
    }
    None
}
