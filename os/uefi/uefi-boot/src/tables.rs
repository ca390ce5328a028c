//! # Firmware Description Tables
//!
//! Scans the UEFI configuration table for the ACPI root pointer, the SMBIOS
//! entry point and the MultiProcessor Specification floating pointer. GUIDs are
//! compared over their full 128 bits.

use core::ffi::c_void;
use core::ptr::NonNull;
use log::debug;
use uefi::table::cfg::{ACPI_GUID, ACPI2_GUID, ConfigTableEntry, SMBIOS_GUID, SMBIOS3_GUID};
use uefi::{Guid, guid};

/// `MPS_TABLE_GUID` from the UEFI specification.
pub const MPS_GUID: Guid = guid!("eb9d2d2f-2d88-11d3-9a16-0090273fc14d");

/// Firmware tables found in the configuration table. Missing ones stay `None`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FirmwareTables {
    /// RSDP (ACPI 2.0+ if present, else ACPI 1.0).
    pub acpi: Option<NonNull<c_void>>,
    /// SMBIOS entry point (2.x if present, else 3.x).
    pub smbios: Option<NonNull<c_void>>,
    /// MPS floating pointer structure.
    pub mps: Option<NonNull<c_void>>,
}

impl FirmwareTables {
    #[must_use]
    pub fn locate(entries: &[ConfigTableEntry]) -> Self {
        let tables = Self {
            acpi: find(entries, &ACPI2_GUID).or_else(|| find(entries, &ACPI_GUID)),
            smbios: find(entries, &SMBIOS_GUID).or_else(|| find(entries, &SMBIOS3_GUID)),
            mps: find(entries, &MPS_GUID),
        };

        debug!(
            "Firmware tables: acpi={:?}, smbios={:?}, mps={:?} ({} entries scanned)",
            tables.acpi,
            tables.smbios,
            tables.mps,
            entries.len()
        );
        tables
    }
}

fn find(entries: &[ConfigTableEntry], guid: &Guid) -> Option<NonNull<c_void>> {
    entries
        .iter()
        .find(|entry| entry.guid == *guid)
        .and_then(|entry| NonNull::new(entry.address.cast_mut()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(guid: Guid, address: usize) -> ConfigTableEntry {
        ConfigTableEntry {
            guid,
            address: address as *const c_void,
        }
    }

    fn addr(ptr: Option<NonNull<c_void>>) -> Option<usize> {
        ptr.map(|p| p.as_ptr() as usize)
    }

    #[test]
    fn acpi_only() {
        let entries = [
            entry(guid!("05ad34ba-6f02-4214-952e-4da0398e2bb9"), 0x1111),
            entry(ACPI2_GUID, 0xE_0000),
        ];
        let tables = FirmwareTables::locate(&entries);
        assert_eq!(addr(tables.acpi), Some(0xE_0000));
        assert_eq!(tables.smbios, None);
        assert_eq!(tables.mps, None);
    }

    #[test]
    fn all_three_tables() {
        let entries = [
            entry(MPS_GUID, 0x3000),
            entry(SMBIOS_GUID, 0x2000),
            entry(ACPI2_GUID, 0x1000),
        ];
        let tables = FirmwareTables::locate(&entries);
        assert_eq!(addr(tables.acpi), Some(0x1000));
        assert_eq!(addr(tables.smbios), Some(0x2000));
        assert_eq!(addr(tables.mps), Some(0x3000));
    }

    #[test]
    fn prefers_acpi2_over_acpi1() {
        let entries = [entry(ACPI_GUID, 0x1000), entry(ACPI2_GUID, 0x2000)];
        assert_eq!(addr(FirmwareTables::locate(&entries).acpi), Some(0x2000));

        let entries = [entry(ACPI_GUID, 0x1000)];
        assert_eq!(addr(FirmwareTables::locate(&entries).acpi), Some(0x1000));
    }

    #[test]
    fn falls_back_to_smbios3() {
        let entries = [entry(SMBIOS3_GUID, 0x4000)];
        assert_eq!(addr(FirmwareTables::locate(&entries).smbios), Some(0x4000));
    }

    #[test]
    fn requires_full_width_guid_match() {
        // Differs from the SMBIOS GUID only in the last node byte.
        let near_miss = guid!("eb9d2d31-2d88-11d3-9a16-0090273fc14e");
        let entries = [entry(near_miss, 0x5000)];
        assert_eq!(FirmwareTables::locate(&entries), FirmwareTables::default());
    }

    #[test]
    fn empty_list_finds_nothing() {
        assert_eq!(FirmwareTables::locate(&[]), FirmwareTables::default());
    }
}
