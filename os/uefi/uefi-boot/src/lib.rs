//! # Loader Core
//!
//! The parts of the UEFI loader that do not talk to firmware directly. Every
//! firmware interaction goes through a small trait so that the loading and
//! hand-off logic can run on the host under `cargo test`.
//!
//! ## Boot Sequence
//!
//! ```text
//! display geometry + firmware tables   (tables, handoff)
//!         ↓
//! kernel.elf staged in scratch buffer  (elf::parser, dry run)
//!         ↓
//! memory map snapshot + ExitBootServices (mmap)
//!         ↓
//! hand-off block finalized             (handoff)
//!         ↓
//! segment pass, then section pass      (elf::loader)
//!         ↓
//! kernel entry(handoff)                (entry)
//! ```
//!
//! ## Modules
//!
//! * [`mem`]: byte-wise copy/compare/fill over raw ranges.
//! * [`elf`]: bounds-checked ELF64 views and the two-pass loader.
//! * [`tables`]: ACPI, SMBIOS and MPS lookup in the configuration table.
//! * [`mmap`]: the bounded memory-map / `ExitBootServices` protocol.
//! * [`handoff`]: the builder for the kernel hand-off block.
//! * [`entry`]: control transfer to the kernel.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod elf;
pub mod entry;
pub mod handoff;
pub mod mem;
pub mod mmap;
pub mod tables;

pub use entry::{BootError, EntryAddress, FirmwareEntry, KernelEntry, enter_kernel};
pub use handoff::{FramebufferGeometry, HandoffBuilder, HandoffError, HandoffField, HandoffSlot};
pub use mmap::{BootPlatform, ExitProtocol, MemoryMapSnapshot, RetirementError, RetirementState};
pub use tables::FirmwareTables;
