//! # Boot Diagnostics
//!
//! Logging only. Nothing here is required for the boot to succeed.

use log::{debug, info, warn};
use uefi::boot::{self, OpenProtocolAttributes, OpenProtocolParams};
use uefi::proto::device_path::DevicePath;
use uefi::proto::device_path::text::{AllowShortcuts, DisplayOnly};
use uefi::proto::loaded_image::LoadedImage;

/// Logs where the loader image sits in memory and where it was loaded from.
pub fn log_loaded_image() {
    let image = match boot::open_protocol_exclusive::<LoadedImage>(boot::image_handle()) {
        Ok(image) => image,
        Err(e) => {
            warn!("Loaded image protocol unavailable: {:?}", e.status());
            return;
        }
    };

    let (base, size) = image.info();
    info!("Loader image at {:#x}, {size} bytes", base as usize);

    match image.file_path() {
        Some(path) => log_device_path("Loader file", path),
        None => debug!("Loader file path unknown"),
    }

    let Some(device) = image.device() else {
        debug!("Loader device unknown");
        return;
    };

    // SAFETY: the protocol is only read while the handle is live.
    let device_path = unsafe {
        boot::open_protocol::<DevicePath>(
            OpenProtocolParams {
                handle: device,
                agent: boot::image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    };
    match device_path {
        Ok(path) => match path.get() {
            Some(path) => log_device_path("Loader device", path),
            None => debug!("Loader device has an empty device path"),
        },
        Err(e) => debug!("Loader device has no device path: {:?}", e.status()),
    }
}

fn log_device_path(what: &str, path: &DevicePath) {
    match path.to_string(DisplayOnly(false), AllowShortcuts(false)) {
        Ok(text) => info!("{what}: {}", &*text),
        Err(e) => debug!("{what}: no text form ({e:?})"),
    }
}

/// Logs every memory descriptor. The map is stale as soon as it is printed.
#[cfg(debug_assertions)]
pub fn dump_memory_map() {
    use uefi::boot::MemoryType;
    use uefi::mem::memory_map::MemoryMap;

    let map = match boot::memory_map(MemoryType::LOADER_DATA) {
        Ok(map) => map,
        Err(e) => {
            warn!("Memory map unavailable: {:?}", e.status());
            return;
        }
    };

    debug!(
        "Memory map: {} descriptors of {} bytes",
        map.len(),
        map.meta().desc_size
    );
    for (i, desc) in map.entries().enumerate() {
        debug!(
            "  {i:3}: {:#016x} {:>8} pages {:?} {:?}",
            desc.phys_start, desc.page_count, desc.ty, desc.att
        );
    }
}
