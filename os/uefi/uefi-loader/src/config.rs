//! # Loader Configuration
//!
//! Everything here is fixed at compile time; there is no configuration file.

use log::LevelFilter;
use uefi::{CStr16, cstr16};

/// Location of the kernel on the volume the loader was started from.
pub const KERNEL_PATH: &CStr16 = cstr16!("\\System\\kernel.elf");

/// Size of the scratch buffer the kernel file is read into.
/// Larger kernels are rejected.
pub const KERNEL_BUFFER_CAPACITY: usize = 16 * 1024 * 1024;

/// The Graphics Output Protocol mode switched to before hand-off.
pub const GOP_MODE: u32 = 0;

#[cfg(debug_assertions)]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Debug;

#[cfg(not(debug_assertions))]
pub const LOG_LEVEL: LevelFilter = LevelFilter::Info;

const _: () = {
    assert!(KERNEL_BUFFER_CAPACITY.is_multiple_of(uefi_boot::mmap::PAGE_SIZE));
};
