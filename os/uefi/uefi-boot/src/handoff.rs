//! # Hand-off Block Builder
//!
//! Collects what the loader learns along the way and produces the final
//! [`HandoffBlock`] once the memory map is known. The builder is a plain value
//! moved from step to step; nothing global is written before the block is
//! stored in its [`HandoffSlot`].

use crate::mmap::MemoryMapSnapshot;
use crate::tables::FirmwareTables;
use core::ffi::c_void;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use kernel_info::boot::HandoffBlock;
use uefi::Status;

/// Linear framebuffer as reported by the Graphics Output Protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferGeometry {
    pub base: u64,
    /// Bytes.
    pub size: u64,
    /// Bytes per pixel.
    pub pixel_size: u64,
    /// Pixels per scanline.
    pub stride: u64,
    pub xres: u64,
    pub yres: u64,
}

/// A field group of the [`HandoffBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffField {
    Framebuffer,
    FirmwareTables,
    SystemTables,
}

impl HandoffField {
    const fn bit(self) -> u8 {
        match self {
            Self::Framebuffer => 1 << 0,
            Self::FirmwareTables => 1 << 1,
            Self::SystemTables => 1 << 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HandoffError {
    #[error("Hand-off field {0:?} was already assigned")]
    AlreadyAssigned(HandoffField),
}

impl From<HandoffError> for Status {
    fn from(value: HandoffError) -> Self {
        match value {
            HandoffError::AlreadyAssigned(_) => Self::INVALID_PARAMETER,
        }
    }
}

/// Accumulates hand-off data until the memory map is final.
///
/// Each field group is assigned at most once; a second assignment is refused
/// with [`HandoffError::AlreadyAssigned`]. The builder is consumed by
/// [`finalize`](Self::finalize), so one builder yields exactly one block.
#[derive(Debug, Default)]
pub struct HandoffBuilder {
    framebuffer: Option<FramebufferGeometry>,
    tables: FirmwareTables,
    system_table: Option<NonNull<c_void>>,
    boot_services: Option<NonNull<c_void>>,
    runtime_services: Option<NonNull<c_void>>,
    assigned: u8,
}

impl HandoffBuilder {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            framebuffer: None,
            tables: FirmwareTables {
                acpi: None,
                smbios: None,
                mps: None,
            },
            system_table: None,
            boot_services: None,
            runtime_services: None,
            assigned: 0,
        }
    }

    /// Whether `field` has been assigned, even if to `None`.
    #[must_use]
    pub const fn is_assigned(&self, field: HandoffField) -> bool {
        self.assigned & field.bit() != 0
    }

    fn claim(&mut self, field: HandoffField) -> Result<(), HandoffError> {
        if self.is_assigned(field) {
            return Err(HandoffError::AlreadyAssigned(field));
        }
        self.assigned |= field.bit();
        Ok(())
    }

    /// `None` leaves all video fields zero.
    pub fn with_framebuffer(
        mut self,
        framebuffer: Option<FramebufferGeometry>,
    ) -> Result<Self, HandoffError> {
        self.claim(HandoffField::Framebuffer)?;
        self.framebuffer = framebuffer;
        Ok(self)
    }

    pub fn with_firmware_tables(mut self, tables: FirmwareTables) -> Result<Self, HandoffError> {
        self.claim(HandoffField::FirmwareTables)?;
        self.tables = tables;
        Ok(self)
    }

    pub fn with_system_tables(
        mut self,
        system: Option<NonNull<c_void>>,
        boot: Option<NonNull<c_void>>,
        runtime: Option<NonNull<c_void>>,
    ) -> Result<Self, HandoffError> {
        self.claim(HandoffField::SystemTables)?;
        self.system_table = system;
        self.boot_services = boot;
        self.runtime_services = runtime;
        Ok(self)
    }

    /// Produces the block. The snapshot's buffer now belongs to the kernel.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn finalize(self, memory_map: MemoryMapSnapshot) -> HandoffBlock {
        let fb = self.framebuffer.unwrap_or(FramebufferGeometry {
            base: 0,
            size: 0,
            pixel_size: 0,
            stride: 0,
            xres: 0,
            yres: 0,
        });

        HandoffBlock {
            memory_map: memory_map.base() as usize as *mut c_void,
            memory_map_size: memory_map.map_size() as u64,
            memory_map_desc_size: memory_map.desc_size() as u64,
            videofb: fb.base,
            videofb_size: fb.size,
            pixel_size: fb.pixel_size,
            pixels_per_scanline: fb.stride,
            xres: fb.xres,
            yres: fb.yres,
            rsdp: raw(self.tables.acpi),
            system_table: raw(self.system_table),
            boot_services: raw(self.boot_services),
            runtime_services: raw(self.runtime_services),
            smbios: raw(self.tables.smbios),
            mps: raw(self.tables.mps),
        }
    }
}

fn raw(ptr: Option<NonNull<c_void>>) -> *mut c_void {
    ptr.map_or(core::ptr::null_mut(), NonNull::as_ptr)
}

/// Storage for the hand-off block, reserved while allocation is still possible.
pub struct HandoffSlot {
    slot: &'static mut MaybeUninit<HandoffBlock>,
}

impl HandoffSlot {
    #[must_use]
    pub const fn new(slot: &'static mut MaybeUninit<HandoffBlock>) -> Self {
        Self { slot }
    }

    /// Moves the block into the slot and hands out the only reference to it.
    pub fn store(self, block: HandoffBlock) -> &'static mut HandoffBlock {
        self.slot.write(block)
    }
}

impl core::fmt::Debug for HandoffSlot {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandoffSlot")
            .field("at", &core::ptr::from_ref(self.slot))
            .finish()
    }
}
