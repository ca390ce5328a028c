//! # Kernel File Access

use crate::config::KERNEL_BUFFER_CAPACITY;
use log::{debug, info};
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::proto::media::file::{File, FileAttribute, FileMode, RegularFile};
use uefi::{CStr16, Status};
use uefi_boot::mmap::PAGE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("The loader's volume has no usable file system: {0:?}")]
    FileSystem(Status),
    #[error("Failed to open the kernel file: {0:?}")]
    Open(Status),
    #[error("The kernel path names a directory")]
    NotAFile,
    #[error("Failed to query the kernel file size: {0:?}")]
    Size(Status),
    #[error("The kernel is {size} bytes, more than the {capacity} byte buffer")]
    TooLarge { size: u64, capacity: usize },
    #[error("Failed to allocate the kernel buffer: {0:?}")]
    Allocation(Status),
    #[error("Failed to read the kernel file: {0:?}")]
    Read(Status),
    #[error("Short read: {read} of {size} bytes")]
    ShortRead { read: usize, size: usize },
}

impl From<FileError> for Status {
    fn from(value: FileError) -> Self {
        match value {
            FileError::FileSystem(status)
            | FileError::Open(status)
            | FileError::Size(status)
            | FileError::Allocation(status)
            | FileError::Read(status) => status,
            FileError::NotAFile => Self::UNSUPPORTED,
            FileError::TooLarge { .. } => Self::BUFFER_TOO_SMALL,
            FileError::ShortRead { .. } => Self::END_OF_FILE,
        }
    }
}

/// Reads `path` from the volume the loader itself was loaded from.
///
/// The bytes land in a fixed-size `EfiLoaderData` buffer that is never freed,
/// so the returned slice stays valid after boot services are gone.
pub fn read_kernel(path: &CStr16) -> Result<&'static [u8], FileError> {
    let mut sfs = boot::get_image_file_system(boot::image_handle())
        .map_err(|e| FileError::FileSystem(e.status()))?;
    let mut volume = sfs
        .open_volume()
        .map_err(|e| FileError::FileSystem(e.status()))?;

    let mut file = volume
        .open(path, FileMode::Read, FileAttribute::empty())
        .map_err(|e| FileError::Open(e.status()))?
        .into_regular_file()
        .ok_or(FileError::NotAFile)?;

    let size = file_size(&mut file)?;
    if size > KERNEL_BUFFER_CAPACITY as u64 {
        return Err(FileError::TooLarge {
            size,
            capacity: KERNEL_BUFFER_CAPACITY,
        });
    }
    let size = usize::try_from(size).map_err(|_| FileError::Size(Status::BAD_BUFFER_SIZE))?;

    let buffer = scratch_buffer()?;
    let read = file
        .read(&mut buffer[..size])
        .map_err(|e| FileError::Read(e.status()))?;
    if read != size {
        return Err(FileError::ShortRead { read, size });
    }

    info!("Read {path} ({size} bytes)");
    Ok(&buffer[..size])
}

fn file_size(file: &mut RegularFile) -> Result<u64, FileError> {
    file.set_position(RegularFile::END_OF_FILE)
        .map_err(|e| FileError::Size(e.status()))?;
    let size = file
        .get_position()
        .map_err(|e| FileError::Size(e.status()))?;
    file.set_position(0)
        .map_err(|e| FileError::Size(e.status()))?;
    Ok(size)
}

fn scratch_buffer() -> Result<&'static mut [u8], FileError> {
    let pages = KERNEL_BUFFER_CAPACITY / PAGE_SIZE;
    let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)
        .map_err(|e| FileError::Allocation(e.status()))?;
    debug!("Kernel buffer: {pages} pages at {:#x}", base.as_ptr() as usize);

    // SAFETY: a fresh allocation of exactly this size, never freed.
    Ok(unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), KERNEL_BUFFER_CAPACITY) })
}
