//! # Display Discovery
//!
//! Logs the EDID protocols the firmware exposes, lists the Graphics Output
//! Protocol modes, switches to [`GOP_MODE`] and reports the resulting linear
//! framebuffer.

use crate::config::GOP_MODE;
use log::{debug, info, warn};
use uefi::boot::{self, OpenProtocolAttributes, OpenProtocolParams, ScopedProtocol, SearchType};
use uefi::proto::console::gop::{BltPixel, GraphicsOutput, PixelFormat};
use uefi::{Guid, guid};
use uefi_boot::FramebufferGeometry;

const EDID_ACTIVE_GUID: Guid = guid!("bd8c1056-9f36-44ec-92a8-a6337f817986");
const EDID_DISCOVERED_GUID: Guid = guid!("1c0c34f6-d380-41fa-a049-8ad06c1a66aa");
const EDID_OVERRIDE_GUID: Guid = guid!("48ecb431-fb72-45c0-a922-f458fe040bd5");

/// Logs which EDID protocols are installed and on how many handles.
pub fn probe_edid() {
    for (name, guid) in [
        ("active", &EDID_ACTIVE_GUID),
        ("discovered", &EDID_DISCOVERED_GUID),
        ("override", &EDID_OVERRIDE_GUID),
    ] {
        match boot::locate_handle_buffer(SearchType::ByProtocol(guid)) {
            Ok(handles) => info!("EDID {name}: {} handles", handles.len()),
            Err(e) => debug!("EDID {name}: not available ({:?})", e.status()),
        }
    }
}

/// Returns the framebuffer of [`GOP_MODE`], or `None` when there is no
/// usable linear framebuffer.
pub fn init_framebuffer() -> Option<FramebufferGeometry> {
    let mut gop = match open_gop() {
        Ok(gop) => gop,
        Err(e) => {
            warn!("No Graphics Output Protocol: {:?}", e.status());
            return None;
        }
    };

    for mode in gop.modes() {
        let info = mode.info();
        let (w, h) = info.resolution();
        debug!(
            "GOP mode {}: {w}x{h}, stride {}, {:?}",
            mode.index(),
            info.stride(),
            info.pixel_format()
        );
    }

    match gop.modes().find(|mode| mode.index() == GOP_MODE) {
        Some(mode) => {
            if let Err(e) = gop.set_mode(&mode) {
                warn!("Failed to set GOP mode {GOP_MODE}: {:?}", e.status());
            }
        }
        None => warn!("GOP mode {GOP_MODE} does not exist; keeping the current mode"),
    }

    let info = gop.current_mode_info();
    if info.pixel_format() == PixelFormat::BltOnly {
        warn!("GOP mode has no linear framebuffer");
        return None;
    }

    let (xres, yres) = info.resolution();
    let mut fb = gop.frame_buffer();
    let geometry = FramebufferGeometry {
        base: fb.as_mut_ptr() as u64,
        size: fb.size() as u64,
        pixel_size: size_of::<BltPixel>() as u64,
        stride: info.stride() as u64,
        xres: xres as u64,
        yres: yres as u64,
    };

    if geometry.base == 0 || geometry.size == 0 {
        warn!("GOP reports an empty framebuffer");
        return None;
    }

    info!(
        "Framebuffer: {}x{} @ {:#x}, {} bytes, stride {}",
        geometry.xres, geometry.yres, geometry.base, geometry.size, geometry.stride
    );
    Some(geometry)
}

/// The firmware keeps drawing to its console, so GOP is opened without
/// exclusive access.
fn open_gop() -> uefi::Result<ScopedProtocol<GraphicsOutput>> {
    let handle = boot::get_handle_for_protocol::<GraphicsOutput>()?;
    // SAFETY: the mode is only changed before boot services are exited.
    unsafe {
        boot::open_protocol::<GraphicsOutput>(
            OpenProtocolParams {
                handle,
                agent: boot::image_handle(),
                controller: None,
            },
            OpenProtocolAttributes::GetProtocol,
        )
    }
}
