//! # ELF file handling

pub mod loader;
pub mod parser;

pub use loader::{IdentityMemory, LoadReport, PhysicalMemory};
pub use parser::{
    KernelImage, Section, SectionFlags, SectionKind, SectionPlacement, Segment, SegmentFlags,
    SegmentKind,
};

use uefi::Status;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElfError {
    #[error("The image is too short to hold an ELF64 header")]
    Truncated,
    #[error("The image does not start with the ELF magic bytes")]
    BadMagic,
    #[error("The image is not a 64-bit little-endian ELF file")]
    UnsupportedClass,
    #[error("The image type {0:#x} is not ET_EXEC")]
    NotExecutable(u16),
    #[error("The {0} header table lies outside the image")]
    TableOutOfBounds(&'static str),
    #[error("The {table} header entries are {found} bytes, expected at least {expected}")]
    EntrySize {
        table: &'static str,
        found: u16,
        expected: usize,
    },
    #[error("The file bytes of segment {0} lie outside the image")]
    SegmentOutOfBounds(usize),
    #[error("The file bytes of section {0} lie outside the image")]
    SectionOutOfBounds(usize),
    #[error("The entry address {0:#x} cannot be called on this target")]
    BadEntry(u64),
    #[error("A pointer arithmetic operation failed due to an underflow or overflow")]
    PointerArithmetic,
    #[error("The physical range {start:#x}+{len:#x} is not addressable")]
    AddressOutOfBounds { start: u64, len: u64 },
}

impl From<ElfError> for Status {
    fn from(value: ElfError) -> Self {
        match value {
            ElfError::NotExecutable(_) | ElfError::BadMagic | ElfError::UnsupportedClass => {
                Self::UNSUPPORTED
            }
            ElfError::BadEntry(_) => Self::LOAD_ERROR,
            ElfError::Truncated
            | ElfError::TableOutOfBounds(_)
            | ElfError::EntrySize { .. }
            | ElfError::SegmentOutOfBounds(_)
            | ElfError::SectionOutOfBounds(_) => Self::VOLUME_CORRUPTED,
            ElfError::PointerArithmetic | ElfError::AddressOutOfBounds { .. } => {
                Self::BAD_BUFFER_SIZE
            }
        }
    }
}
