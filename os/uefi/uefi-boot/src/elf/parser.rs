//! # ELF Header Parsing
//!
//! Read-only views over an ELF64 image held in memory. The header, the
//! program header table and the section header table are decoded record by
//! record with `read_unaligned`, and only after the record has been checked to
//! lie inside the buffer. Everything the loader later copies out of the image
//! is range-checked once, in [`KernelImage::parse`].

use crate::elf::ElfError;
use crate::entry::EntryAddress;
use core::mem::size_of;
use core::ptr::read_unaligned;

// Minimal ELF64 definitions
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code, clippy::struct_field_names)]
struct Elf64Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_addr: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

const ET_EXEC: u16 = 2;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const EV_CURRENT: u8 = 1;

const PT_LOAD: u32 = 1;
const SHT_NULL: u32 = 0;
const SHT_PROGBITS: u32 = 1;
const SHT_NOBITS: u32 = 8;

/// Bitfield wrapper for `Elf64_Phdr.p_flags` (32-bit)
///
/// Layout (LSB→MSB):
/// - bit 0: execute
/// - bit 1: write
/// - bit 2: read
#[bitfield_struct::bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct SegmentFlags {
    #[bits(1)]
    pub execute: bool,
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub read: bool,
    #[bits(29)]
    __: u32,
}

/// Bitfield wrapper for `Elf64_Shdr.sh_flags` (64-bit)
///
/// Only the low three flags matter to the loader; `alloc` marks sections
/// that occupy address space at runtime.
#[bitfield_struct::bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct SectionFlags {
    #[bits(1)]
    pub write: bool,
    #[bits(1)]
    pub alloc: bool,
    #[bits(1)]
    pub exec_instr: bool,
    #[bits(61)]
    __: u64,
}

/// `readelf` style, e.g. `R E`.
impl core::fmt::Display for SegmentFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { ' ' };
        write!(
            f,
            "{}{}{}",
            flag(self.read(), 'R'),
            flag(self.write(), 'W'),
            flag(self.execute(), 'E')
        )
    }
}

/// `readelf` style, e.g. `WA` or `AX`.
impl core::fmt::Display for SectionFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for (set, c) in [
            (self.write(), 'W'),
            (self.alloc(), 'A'),
            (self.exec_instr(), 'X'),
        ] {
            if set {
                write!(f, "{c}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Other(u32),
}

impl From<u32> for SegmentKind {
    fn from(value: u32) -> Self {
        match value {
            PT_LOAD => Self::Load,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Null,
    /// Content stored in the file (`SHT_PROGBITS`).
    ProgBits,
    /// Zero-initialized, no file content (`SHT_NOBITS`).
    NoBits,
    Other(u32),
}

impl From<u32> for SectionKind {
    fn from(value: u32) -> Self {
        match value {
            SHT_NULL => Self::Null,
            SHT_PROGBITS => Self::ProgBits,
            SHT_NOBITS => Self::NoBits,
            other => Self::Other(other),
        }
    }
}

/// One program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub kind: SegmentKind,
    pub flags: SegmentFlags,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl Segment {
    /// Whether `addr` lies in `[vaddr, vaddr + mem_size)`.
    #[must_use]
    pub const fn contains(&self, addr: u64) -> bool {
        match self.vaddr.checked_add(self.mem_size) {
            Some(end) => self.vaddr <= addr && addr < end,
            None => self.vaddr <= addr,
        }
    }

    /// Physical address of `addr`, which must lie inside this segment.
    #[must_use]
    pub const fn translate(&self, addr: u64) -> Option<u64> {
        if !self.contains(addr) {
            return None;
        }
        self.paddr.checked_add(addr - self.vaddr)
    }

    const fn is_loadable(&self) -> bool {
        matches!(self.kind, SegmentKind::Load)
    }
}

/// One section header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    pub index: usize,
    pub kind: SectionKind,
    pub flags: SectionFlags,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

impl Section {
    /// Whether the loader writes this section at all.
    #[must_use]
    pub const fn is_placed(&self) -> bool {
        self.index != 0
            && self.flags.alloc()
            && self.size != 0
            && matches!(self.kind, SectionKind::ProgBits | SectionKind::NoBits)
    }
}

/// Where the loader intends to put a section, as reported by [`KernelImage::dry_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionPlacement {
    pub section: Section,
    /// `None` when no loadable segment encloses the section.
    pub target: Option<u64>,
}

/// Location of a fixed-size record table inside the image.
#[derive(Debug, Clone, Copy)]
struct Table {
    offset: usize,
    entry_size: usize,
    count: usize,
}

impl Table {
    fn new<T>(
        bytes: &[u8],
        name: &'static str,
        offset: u64,
        entry_size: u16,
        count: u16,
    ) -> Result<Self, ElfError> {
        if count == 0 {
            return Ok(Self {
                offset: 0,
                entry_size: size_of::<T>(),
                count: 0,
            });
        }

        if usize::from(entry_size) < size_of::<T>() {
            return Err(ElfError::EntrySize {
                table: name,
                found: entry_size,
                expected: size_of::<T>(),
            });
        }

        let offset = usize::try_from(offset).map_err(|_| ElfError::TableOutOfBounds(name))?;
        let entry_size = usize::from(entry_size);
        let count = usize::from(count);

        // Compute end of the table and check overflow/bounds
        let table_size = entry_size
            .checked_mul(count)
            .ok_or(ElfError::TableOutOfBounds(name))?;
        let end = offset
            .checked_add(table_size)
            .ok_or(ElfError::TableOutOfBounds(name))?;
        if end > bytes.len() {
            return Err(ElfError::TableOutOfBounds(name));
        }

        Ok(Self {
            offset,
            entry_size,
            count,
        })
    }

    fn get<T: Copy>(&self, bytes: &[u8], index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }
        let start = self.offset.checked_add(index.checked_mul(self.entry_size)?)?;
        read_record(bytes, start)
    }
}

fn read_record<T: Copy>(bytes: &[u8], offset: usize) -> Option<T> {
    let end = offset.checked_add(size_of::<T>())?;
    if end > bytes.len() {
        return None;
    }

    // SAFETY: `offset..end` is within `bytes`; read_unaligned avoids alignment assumptions.
    Some(unsafe { read_unaligned(bytes.as_ptr().add(offset).cast::<T>()) })
}

fn file_range_in(bytes: &[u8], offset: u64, len: u64) -> bool {
    offset
        .checked_add(len)
        .and_then(|end| usize::try_from(end).ok())
        .is_some_and(|end| end <= bytes.len())
}

/// A validated, in-memory ELF64 executable.
#[derive(Debug, Clone, Copy)]
pub struct KernelImage<'a> {
    bytes: &'a [u8],
    entry: EntryAddress,
    machine: u16,
    segments: Table,
    sections: Table,
}

impl<'a> KernelImage<'a> {
    const EI_MAGIC_BYTES: [u8; 4] = [0x7F, b'E', b'L', b'F'];

    /// Validates a 64-bit little-endian ELF executable.
    ///
    /// Beyond the header itself, both header tables must lie inside `bytes`,
    /// as must the file bytes of every `PT_LOAD` segment and of every
    /// allocated `SHT_PROGBITS` section.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, ElfError> {
        let ehdr: Elf64Ehdr = read_record(bytes, 0).ok_or(ElfError::Truncated)?;

        // Validate magic 0x7F 'E''L''F'
        if ehdr.e_ident[0..4] != Self::EI_MAGIC_BYTES {
            return Err(ElfError::BadMagic);
        }
        if ehdr.e_ident[4] != ELFCLASS64
            || ehdr.e_ident[5] != ELFDATA2LSB
            || ehdr.e_ident[6] != EV_CURRENT
        {
            return Err(ElfError::UnsupportedClass);
        }

        if ehdr.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable(ehdr.e_type));
        }

        let segments = Table::new::<Elf64Phdr>(
            bytes,
            "program",
            ehdr.e_phoff,
            ehdr.e_phentsize,
            ehdr.e_phnum,
        )?;
        let sections = Table::new::<Elf64Shdr>(
            bytes,
            "section",
            ehdr.e_shoff,
            ehdr.e_shentsize,
            ehdr.e_shnum,
        )?;

        if ehdr.e_entry == 0 {
            return Err(ElfError::BadEntry(ehdr.e_entry));
        }
        let entry = EntryAddress::try_from(ehdr.e_entry)?;

        let image = Self {
            bytes,
            entry,
            machine: ehdr.e_machine,
            segments,
            sections,
        };

        for segment in image.segments() {
            if segment.is_loadable()
                && segment.file_size != 0
                && !file_range_in(bytes, segment.offset, segment.file_size)
            {
                return Err(ElfError::SegmentOutOfBounds(segment.index));
            }
        }

        for section in image.sections() {
            if section.is_placed()
                && section.kind == SectionKind::ProgBits
                && !file_range_in(bytes, section.offset, section.size)
            {
                return Err(ElfError::SectionOutOfBounds(section.index));
            }
        }

        Ok(image)
    }

    /// The raw image bytes.
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[must_use]
    pub const fn entry(&self) -> EntryAddress {
        self.entry
    }

    /// `e_machine`, for diagnostics only.
    #[must_use]
    pub const fn machine(&self) -> u16 {
        self.machine
    }

    #[must_use]
    pub const fn segment_count(&self) -> usize {
        self.segments.count
    }

    #[must_use]
    pub const fn section_count(&self) -> usize {
        self.sections.count
    }

    /// All program headers in table order.
    pub fn segments(&self) -> impl Iterator<Item = Segment> + '_ {
        (0..self.segments.count).filter_map(move |index| {
            let ph: Elf64Phdr = self.segments.get(self.bytes, index)?;
            Some(Segment {
                index,
                kind: SegmentKind::from(ph.p_type),
                flags: SegmentFlags::from_bits(ph.p_flags),
                offset: ph.p_offset,
                vaddr: ph.p_vaddr,
                paddr: ph.p_paddr,
                file_size: ph.p_filesz,
                mem_size: ph.p_memsz,
                align: ph.p_align,
            })
        })
    }

    /// All section headers in table order, including the null section at index 0.
    pub fn sections(&self) -> impl Iterator<Item = Section> + '_ {
        (0..self.sections.count).filter_map(move |index| {
            let sh: Elf64Shdr = self.sections.get(self.bytes, index)?;
            Some(Section {
                index,
                kind: SectionKind::from(sh.sh_type),
                flags: SectionFlags::from_bits(sh.sh_flags),
                addr: sh.sh_addr,
                offset: sh.sh_offset,
                size: sh.sh_size,
            })
        })
    }

    /// The first `PT_LOAD` segment whose virtual range contains `addr`.
    #[must_use]
    pub fn enclosing_segment(&self, addr: u64) -> Option<Segment> {
        self.segments()
            .find(|segment| segment.is_loadable() && segment.contains(addr))
    }

    /// Physical placement address of `section`, or `None` if no loadable
    /// segment encloses it.
    #[must_use]
    pub fn placement(&self, section: &Section) -> Option<u64> {
        self.enclosing_segment(section.addr)?
            .translate(section.addr)
    }

    /// Resolves every placed section without touching memory.
    pub fn dry_run(&self) -> impl Iterator<Item = SectionPlacement> + '_ {
        self.sections()
            .filter(Section::is_placed)
            .map(move |section| SectionPlacement {
                section,
                target: self.placement(&section),
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Builds small ELF64 images for tests.

    use super::{ET_EXEC, Elf64Ehdr, Elf64Phdr, Elf64Shdr, PT_LOAD, SHT_NOBITS, SHT_PROGBITS};
    use core::mem::size_of;

    pub const SHF_WRITE: u64 = 0x1;
    pub const SHF_ALLOC: u64 = 0x2;

    pub struct ImageBuilder {
        pub e_type: u16,
        pub entry: u64,
        segments: Vec<Elf64Phdr>,
        sections: Vec<Elf64Shdr>,
        payload: Vec<u8>,
    }

    impl ImageBuilder {
        /// Offset at which the payload starts in the built image.
        pub const PAYLOAD_OFFSET: u64 = 0x100;

        pub fn new(entry: u64) -> Self {
            Self {
                e_type: ET_EXEC,
                entry,
                segments: Vec::new(),
                sections: vec![shdr(0, 0, 0, 0, 0)],
                payload: Vec::new(),
            }
        }

        /// Appends bytes to the payload and returns their file offset.
        pub fn data(&mut self, bytes: &[u8]) -> u64 {
            let offset = Self::PAYLOAD_OFFSET + self.payload.len() as u64;
            self.payload.extend_from_slice(bytes);
            offset
        }

        pub fn load(
            mut self,
            offset: u64,
            vaddr: u64,
            paddr: u64,
            file_size: u64,
            mem_size: u64,
        ) -> Self {
            self.segments.push(Elf64Phdr {
                p_type: PT_LOAD,
                p_flags: 0x5,
                p_offset: offset,
                p_vaddr: vaddr,
                p_paddr: paddr,
                p_filesz: file_size,
                p_memsz: mem_size,
                p_align: 0x1000,
            });
            self
        }

        pub fn segment(mut self, p_type: u32, vaddr: u64, mem_size: u64) -> Self {
            self.segments.push(Elf64Phdr {
                p_type,
                p_flags: 0x4,
                p_offset: 0,
                p_vaddr: vaddr,
                p_paddr: vaddr,
                p_filesz: 0,
                p_memsz: mem_size,
                p_align: 8,
            });
            self
        }

        pub fn progbits(mut self, addr: u64, offset: u64, size: u64) -> Self {
            self.sections
                .push(shdr(SHT_PROGBITS, SHF_ALLOC, addr, offset, size));
            self
        }

        pub fn nobits(mut self, addr: u64, size: u64) -> Self {
            self.sections
                .push(shdr(SHT_NOBITS, SHF_ALLOC | SHF_WRITE, addr, 0, size));
            self
        }

        pub fn section(mut self, sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64) -> Self {
            self.sections.push(shdr(sh_type, flags, addr, offset, size));
            self
        }

        pub fn build(&self) -> Vec<u8> {
            let phoff = size_of::<Elf64Ehdr>();
            let shoff = Self::PAYLOAD_OFFSET as usize + self.payload.len();

            let mut ident = [0u8; 16];
            ident[..4].copy_from_slice(&[0x7F, b'E', b'L', b'F']);
            ident[4] = 2;
            ident[5] = 1;
            ident[6] = 1;

            let ehdr = Elf64Ehdr {
                e_ident: ident,
                e_type: self.e_type,
                e_machine: 62,
                e_version: 1,
                e_entry: self.entry,
                e_phoff: if self.segments.is_empty() { 0 } else { phoff as u64 },
                e_shoff: shoff as u64,
                e_flags: 0,
                e_ehsize: size_of::<Elf64Ehdr>() as u16,
                e_phentsize: size_of::<Elf64Phdr>() as u16,
                e_phnum: self.segments.len() as u16,
                e_shentsize: size_of::<Elf64Shdr>() as u16,
                e_shnum: self.sections.len() as u16,
                e_shstrndx: 0,
            };

            assert!(phoff + self.segments.len() * size_of::<Elf64Phdr>() <= Self::PAYLOAD_OFFSET as usize);

            let mut out = vec![0u8; shoff + self.sections.len() * size_of::<Elf64Shdr>()];
            write(&mut out, 0, &ehdr);
            for (i, ph) in self.segments.iter().enumerate() {
                write(&mut out, phoff + i * size_of::<Elf64Phdr>(), ph);
            }
            let start = Self::PAYLOAD_OFFSET as usize;
            out[start..start + self.payload.len()].copy_from_slice(&self.payload);
            for (i, sh) in self.sections.iter().enumerate() {
                write(&mut out, shoff + i * size_of::<Elf64Shdr>(), sh);
            }
            out
        }
    }

    const fn shdr(sh_type: u32, flags: u64, addr: u64, offset: u64, size: u64) -> Elf64Shdr {
        Elf64Shdr {
            sh_name: 0,
            sh_type,
            sh_flags: flags,
            sh_addr: addr,
            sh_offset: offset,
            sh_size: size,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
        }
    }

    fn write<T: Copy>(out: &mut [u8], offset: usize, value: &T) {
        assert!(offset + size_of::<T>() <= out.len());
        unsafe {
            core::ptr::write_unaligned(out.as_mut_ptr().add(offset).cast::<T>(), *value);
        }
    }
}
