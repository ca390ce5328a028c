//! # ELF Segment Loader
//!
//! Places a validated [`KernelImage`] into physical memory in two passes:
//!
//! 1. **Segments.** Every `PT_LOAD` entry with file content is copied verbatim
//!    from its file offset to its `p_paddr`.
//! 2. **Sections.** Every allocated section is resolved to its enclosing
//!    loadable segment; `SHT_NOBITS` ranges are zeroed and `SHT_PROGBITS`
//!    ranges are copied again from their own file offsets.
//!
//! The section pass must run after the segment pass: it overrides whatever the
//! coarse segment copy left in the same physical ranges.

use crate::elf::ElfError;
use crate::elf::parser::{KernelImage, SectionKind, SegmentKind};
use crate::mem;
use core::cmp::Ordering;

/// Destination of the load. Addresses are physical.
pub trait PhysicalMemory {
    /// Copy `src` to the physical range starting at `phys`.
    fn copy_to(&mut self, phys: u64, src: &[u8]) -> Result<(), ElfError>;

    /// Set `len` bytes starting at `phys` to `value`.
    fn fill(&mut self, phys: u64, value: u8, len: u64) -> Result<(), ElfError>;

    /// Whether the physical range starting at `phys` holds exactly `expected`.
    fn matches(&self, phys: u64, expected: &[u8]) -> bool;
}

/// Physical memory accessed through the firmware's identity mapping.
#[derive(Debug)]
pub struct IdentityMemory {
    _private: (),
}

impl IdentityMemory {
    /// # Safety
    /// Physical addresses must be identity-mapped and every range written
    /// through this value must be owned by the caller (after `ExitBootServices`,
    /// or reserved from the firmware beforehand).
    #[must_use]
    pub const unsafe fn new() -> Self {
        Self { _private: () }
    }

    fn range(phys: u64, len: u64) -> Result<(usize, usize), ElfError> {
        let err = ElfError::AddressOutOfBounds { start: phys, len };
        let start = usize::try_from(phys).map_err(|_| err.clone())?;
        let len = usize::try_from(len).map_err(|_| err.clone())?;
        start.checked_add(len).ok_or(err)?;
        Ok((start, len))
    }
}

impl PhysicalMemory for IdentityMemory {
    fn copy_to(&mut self, phys: u64, src: &[u8]) -> Result<(), ElfError> {
        let (start, len) = Self::range(phys, src.len() as u64)?;
        unsafe {
            mem::copy(start as *mut u8, src.as_ptr(), len);
        }
        Ok(())
    }

    fn fill(&mut self, phys: u64, value: u8, len: u64) -> Result<(), ElfError> {
        let (start, len) = Self::range(phys, len)?;
        unsafe {
            mem::fill(start as *mut u8, value, len);
        }
        Ok(())
    }

    fn matches(&self, phys: u64, expected: &[u8]) -> bool {
        let Ok((start, len)) = Self::range(phys, expected.len() as u64) else {
            return false;
        };
        unsafe { mem::compare(start as *const u8, expected.as_ptr(), len) == Ordering::Equal }
    }
}

/// What a load actually did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadReport {
    /// `PT_LOAD` segments copied in the segment pass.
    pub segments_copied: usize,
    /// `SHT_PROGBITS` sections copied in the section pass.
    pub sections_copied: usize,
    /// `SHT_NOBITS` sections zeroed in the section pass.
    pub sections_zeroed: usize,
    /// Allocated sections without an enclosing loadable segment; left untouched.
    pub sections_unresolved: usize,
}

impl KernelImage<'_> {
    /// Loads the image into `memory`: segment pass, then section pass.
    pub fn load<M: PhysicalMemory>(&self, memory: &mut M) -> Result<LoadReport, ElfError> {
        let mut report = LoadReport::default();
        self.load_segments(memory, &mut report)?;
        self.load_sections(memory, &mut report)?;
        Ok(report)
    }

    fn load_segments<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        report: &mut LoadReport,
    ) -> Result<(), ElfError> {
        for segment in self.segments() {
            if segment.kind != SegmentKind::Load || segment.file_size == 0 {
                continue;
            }

            let src = self.file_bytes(segment.offset, segment.file_size)?;
            memory.copy_to(segment.paddr, src)?;
            report.segments_copied += 1;
        }
        Ok(())
    }

    fn load_sections<M: PhysicalMemory>(
        &self,
        memory: &mut M,
        report: &mut LoadReport,
    ) -> Result<(), ElfError> {
        for placement in self.dry_run() {
            let section = placement.section;
            let Some(target) = placement.target else {
                report.sections_unresolved += 1;
                continue;
            };

            match section.kind {
                SectionKind::NoBits => {
                    memory.fill(target, 0, section.size)?;
                    report.sections_zeroed += 1;
                }
                SectionKind::ProgBits => {
                    let src = self.file_bytes(section.offset, section.size)?;
                    memory.copy_to(target, src)?;
                    report.sections_copied += 1;
                }
                SectionKind::Null | SectionKind::Other(_) => {}
            }
        }
        Ok(())
    }

    /// Checks that every placed `SHT_PROGBITS` section reads back from
    /// `memory` as it appears in the file. Returns the number of mismatches.
    pub fn verify<M: PhysicalMemory>(&self, memory: &M) -> usize {
        self.dry_run()
            .filter(|p| p.section.kind == SectionKind::ProgBits)
            .filter_map(|p| Some((p.target?, p.section)))
            .filter(|(target, section)| {
                self.file_bytes(section.offset, section.size)
                    .map_or(true, |src| !memory.matches(*target, src))
            })
            .count()
    }

    fn file_bytes(&self, offset: u64, len: u64) -> Result<&[u8], ElfError> {
        let start = usize::try_from(offset).map_err(|_| ElfError::PointerArithmetic)?;
        let len = usize::try_from(len).map_err(|_| ElfError::PointerArithmetic)?;
        let end = start.checked_add(len).ok_or(ElfError::PointerArithmetic)?;
        self.bytes()
            .get(start..end)
            .ok_or(ElfError::PointerArithmetic)
    }
}
