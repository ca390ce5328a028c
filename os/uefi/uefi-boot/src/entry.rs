//! # Kernel Entry
//!
//! The last step of the boot: retire boot services, finish the hand-off block,
//! place the kernel and call it. [`enter_kernel`] only ever returns an error;
//! on success control never comes back.

use crate::elf::{ElfError, KernelImage, PhysicalMemory};
use crate::handoff::{HandoffBuilder, HandoffSlot};
use crate::mmap::{BootPlatform, ExitProtocol, RetirementError};
use kernel_info::boot::{HandoffBlock, KernelEntryFn};
use log::{debug, warn};
use uefi::Status;

/// The kernel entry point as a native-width address.
///
/// On 32-bit targets the 64-bit `e_entry` is narrowed; values that do not fit
/// are rejected at parse time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryAddress(usize);

impl EntryAddress {
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl TryFrom<u64> for EntryAddress {
    type Error = ElfError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .map(Self)
            .map_err(|_| ElfError::BadEntry(value))
    }
}

impl core::fmt::Display for EntryAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Something that can be called with the hand-off block.
///
/// `invoke` returning at all means the kernel came back, which is fatal.
pub trait KernelEntry {
    fn invoke(self, handoff: &'static mut HandoffBlock);
}

/// The real kernel entry at an address taken from the ELF header.
#[derive(Debug)]
pub struct FirmwareEntry {
    entry: KernelEntryFn,
}

impl FirmwareEntry {
    /// # Safety
    /// `address` must be the entry point of kernel code that is (or will be,
    /// by the time [`KernelEntry::invoke`] runs) present at that address and
    /// follows the [`KernelEntryFn`] ABI.
    #[must_use]
    pub unsafe fn new(address: EntryAddress) -> Self {
        Self {
            entry: unsafe { core::mem::transmute::<usize, KernelEntryFn>(address.0) },
        }
    }
}

impl KernelEntry for FirmwareEntry {
    fn invoke(self, handoff: &'static mut HandoffBlock) {
        let block: *mut HandoffBlock = handoff;
        unsafe { (self.entry)(block) }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BootError {
    #[error("Boot services could not be retired")]
    Retirement(#[from] RetirementError),
    #[error("The kernel image could not be placed")]
    Load(#[from] ElfError),
    #[error("The kernel entry point returned")]
    EntryReturned,
}

impl From<BootError> for Status {
    fn from(value: BootError) -> Self {
        match value {
            BootError::Retirement(e) => e.into(),
            BootError::Load(e) => e.into(),
            BootError::EntryReturned => Self::ABORTED,
        }
    }
}

/// Retires boot services, finishes the hand-off block, loads the kernel and
/// calls its entry point.
///
/// The entry is invoked only if the memory-map protocol reached
/// [`Retired`](crate::mmap::RetirementState::Retired). If this function returns
/// and the protocol is retired, boot services are gone: the caller must not
/// touch them and may only halt.
pub fn enter_kernel<P, M, E>(
    protocol: &mut ExitProtocol,
    platform: &mut P,
    image: &KernelImage<'_>,
    memory: &mut M,
    builder: HandoffBuilder,
    slot: HandoffSlot,
    entry: E,
) -> BootError
where
    P: BootPlatform,
    M: PhysicalMemory,
    E: KernelEntry,
{
    let snapshot = match protocol.run(platform) {
        Ok(snapshot) => snapshot,
        Err(e) => return e.into(),
    };

    debug!(
        "Final memory map: {} descriptors of {} bytes (version {}) at {:#x}",
        snapshot.len(),
        snapshot.desc_size(),
        snapshot.desc_version(),
        snapshot.base()
    );
    let handoff = slot.store(builder.finalize(snapshot));

    let report = match image.load(memory) {
        Ok(report) => report,
        Err(e) => return e.into(),
    };
    debug!(
        "Placed {} segments, {} sections copied, {} zeroed, {} unresolved",
        report.segments_copied,
        report.sections_copied,
        report.sections_zeroed,
        report.sections_unresolved
    );

    if cfg!(debug_assertions) {
        let mismatches = image.verify(memory);
        if mismatches != 0 {
            warn!("{mismatches} sections do not read back as written");
        }
    }

    entry.invoke(handoff);
    BootError::EntryReturned
}
