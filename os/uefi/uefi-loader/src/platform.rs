//! # Boot Services Backend
//!
//! Implements [`BootPlatform`] on top of the firmware. `GetMemoryMap` and
//! `ExitBootServices` are called through the raw boot services table so the
//! retry protocol sees every status code and owns every buffer itself.

use core::ffi::c_void;
use core::ptr::NonNull;
use uefi::boot::{self, AllocateType, MemoryType};
use uefi::mem::memory_map::MemoryDescriptor;
use uefi::{Handle, Status};
use uefi_boot::mmap::{BootPlatform, MapBuffer, MapKey, MapLayout, MapQueryError};

/// `(system table, boot services, runtime services)`, each null when unknown.
pub type ServiceTables = (
    Option<NonNull<c_void>>,
    Option<NonNull<c_void>>,
    Option<NonNull<c_void>>,
);

/// Raw addresses of the UEFI tables for the hand-off block.
pub fn service_tables() -> ServiceTables {
    let Some(st) = uefi::table::system_table_raw() else {
        return (None, None, None);
    };
    // SAFETY: the system table stays valid for the lifetime of the image.
    let (boot, runtime) = unsafe {
        let st = st.as_ptr();
        ((*st).boot_services, (*st).runtime_services)
    };
    (
        Some(st.cast()),
        NonNull::new(boot.cast()),
        NonNull::new(runtime.cast()),
    )
}

/// Resolves the raw boot services table, or bails out with `$err`.
macro_rules! boot_services {
    ($err:expr) => {{
        let Some(st) = uefi::table::system_table_raw() else {
            return Err($err);
        };
        // SAFETY: see `service_tables`.
        let bs = unsafe { (*st.as_ptr()).boot_services };
        if bs.is_null() {
            return Err($err);
        }
        bs
    }};
}

pub struct UefiBootPlatform {
    image: Handle,
}

impl UefiBootPlatform {
    /// `None` if the firmware tables are not available.
    pub fn new() -> Option<Self> {
        let (system, boot, _) = service_tables();
        system.and(boot)?;
        Some(Self {
            image: boot::image_handle(),
        })
    }
}

impl BootPlatform for UefiBootPlatform {
    fn memory_map(
        &mut self,
        buffer: Option<&MapBuffer>,
    ) -> Result<(MapLayout, MapKey), MapQueryError> {
        let (mut size, map) = buffer.map_or((0, core::ptr::null_mut()), |b| {
            (b.len(), b.base() as usize as *mut MemoryDescriptor)
        });
        let mut key = 0usize;
        let mut desc_size = 0usize;
        let mut desc_version = 0u32;

        let bs = boot_services!(MapQueryError::Failed(Status::UNSUPPORTED));
        // SAFETY: `map` is null with a zero size, or a live allocation of `size` bytes.
        let status = unsafe {
            ((*bs).get_memory_map)(
                &raw mut size,
                map,
                &raw mut key,
                &raw mut desc_size,
                &raw mut desc_version,
            )
        };

        match status {
            Status::SUCCESS => Ok((
                MapLayout {
                    map_size: size,
                    desc_size,
                    desc_version,
                },
                MapKey::new(key),
            )),
            Status::BUFFER_TOO_SMALL => Err(MapQueryError::BufferTooSmall { required: size }),
            status => Err(MapQueryError::Failed(status)),
        }
    }

    fn allocate_pages(&mut self, pages: usize) -> Result<MapBuffer, Status> {
        let base = boot::allocate_pages(AllocateType::AnyPages, MemoryType::LOADER_DATA, pages)
            .map_err(|e| e.status())?;
        Ok(MapBuffer::new(base.as_ptr() as u64, pages))
    }

    fn free_pages(&mut self, buffer: MapBuffer) -> Result<(), Status> {
        let pages = buffer.pages();
        let Some(base) = NonNull::new(buffer.base() as usize as *mut u8) else {
            return Err(Status::INVALID_PARAMETER);
        };
        // SAFETY: `base` came from `allocate_pages` with this page count.
        unsafe { boot::free_pages(base, pages) }.map_err(|e| e.status())
    }

    fn exit_boot_services(&mut self, key: MapKey) -> Result<(), Status> {
        let bs = boot_services!(Status::UNSUPPORTED);
        // SAFETY: the key was produced by the query immediately before.
        let status = unsafe { ((*bs).exit_boot_services)(self.image.as_ptr(), key.into_raw()) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }
}
