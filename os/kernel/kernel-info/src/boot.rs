//! # Kernel Boot Hand-off

use core::ffi::c_void;

/// Kernel function pointer.
///
/// # ABI
/// The entry uses the firmware calling convention (`efiapi`), since it is
/// called straight out of a UEFI application. It receives the hand-off block
/// and is not expected to return.
pub type KernelEntryFn = unsafe extern "efiapi" fn(*mut HandoffBlock);

/// Everything the kernel learns from the loader.
///
/// Keep this `#[repr(C)]` and keep the field order: the kernel reads it by
/// offset. Pointers are null when the loader could not find the item.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffBlock {
    /// Raw UEFI memory map (array of `EFI_MEMORY_DESCRIPTOR` records).
    pub memory_map: *mut c_void,

    /// Size of the memory map in **bytes**.
    pub memory_map_size: u64,

    /// Stride between descriptors. Not necessarily `size_of::<EFI_MEMORY_DESCRIPTOR>()`.
    pub memory_map_desc_size: u64,

    /// Linear framebuffer base address, or 0.
    pub videofb: u64,

    /// Framebuffer size in bytes.
    pub videofb_size: u64,

    /// Bytes per pixel.
    pub pixel_size: u64,

    /// Pixels per scanline (stride). May be larger than `xres`.
    pub pixels_per_scanline: u64,

    /// Visible width in pixels.
    pub xres: u64,

    /// Visible height in pixels.
    pub yres: u64,

    /// ACPI Root System Description Pointer.
    pub rsdp: *mut c_void,

    /// The UEFI system table.
    pub system_table: *mut c_void,

    /// The UEFI boot services table. Unusable once the kernel runs.
    pub boot_services: *mut c_void,

    /// The UEFI runtime services table.
    pub runtime_services: *mut c_void,

    /// SMBIOS entry point structure.
    pub smbios: *mut c_void,

    /// MultiProcessor Specification floating pointer.
    pub mps: *mut c_void,
}

impl HandoffBlock {
    /// A block with every pointer null and every size zero.
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            memory_map: core::ptr::null_mut(),
            memory_map_size: 0,
            memory_map_desc_size: 0,
            videofb: 0,
            videofb_size: 0,
            pixel_size: 0,
            pixels_per_scanline: 0,
            xres: 0,
            yres: 0,
            rsdp: core::ptr::null_mut(),
            system_table: core::ptr::null_mut(),
            boot_services: core::ptr::null_mut(),
            runtime_services: core::ptr::null_mut(),
            smbios: core::ptr::null_mut(),
            mps: core::ptr::null_mut(),
        }
    }

    /// Number of memory descriptors in the map.
    #[must_use]
    pub const fn memory_descriptor_count(&self) -> u64 {
        if self.memory_map_desc_size == 0 {
            return 0;
        }
        self.memory_map_size / self.memory_map_desc_size
    }

    /// Whether the loader found a usable linear framebuffer.
    #[must_use]
    pub const fn has_framebuffer(&self) -> bool {
        self.videofb != 0 && self.videofb_size != 0
    }
}

impl Default for HandoffBlock {
    fn default() -> Self {
        Self::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::{offset_of, size_of};

    const PTR: usize = size_of::<*mut c_void>();

    #[test]
    fn field_order_is_fixed() {
        let u64s = [
            offset_of!(HandoffBlock, memory_map_size),
            offset_of!(HandoffBlock, memory_map_desc_size),
            offset_of!(HandoffBlock, videofb),
            offset_of!(HandoffBlock, videofb_size),
            offset_of!(HandoffBlock, pixel_size),
            offset_of!(HandoffBlock, pixels_per_scanline),
            offset_of!(HandoffBlock, xres),
            offset_of!(HandoffBlock, yres),
        ];
        let ptrs = [
            offset_of!(HandoffBlock, rsdp),
            offset_of!(HandoffBlock, system_table),
            offset_of!(HandoffBlock, boot_services),
            offset_of!(HandoffBlock, runtime_services),
            offset_of!(HandoffBlock, smbios),
            offset_of!(HandoffBlock, mps),
        ];

        assert_eq!(offset_of!(HandoffBlock, memory_map), 0);
        assert!(u64s.windows(2).all(|w| w[1] == w[0] + 8));
        assert!(u64s[0] >= PTR);
        assert_eq!(ptrs[0], u64s[7] + 8);
        assert!(ptrs.windows(2).all(|w| w[1] == w[0] + PTR));
        assert_eq!(size_of::<HandoffBlock>(), ptrs[5] + PTR);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn layout_on_64_bit() {
        assert_eq!(offset_of!(HandoffBlock, memory_map_size), 8);
        assert_eq!(offset_of!(HandoffBlock, yres), 64);
        assert_eq!(offset_of!(HandoffBlock, rsdp), 72);
        assert_eq!(offset_of!(HandoffBlock, mps), 112);
        assert_eq!(size_of::<HandoffBlock>(), 120);
    }

    #[test]
    fn zeroed_is_empty() {
        let block = HandoffBlock::zeroed();
        assert!(block.memory_map.is_null());
        assert!(block.mps.is_null());
        assert_eq!(block.memory_descriptor_count(), 0);
        assert!(!block.has_framebuffer());
        assert_eq!(block, HandoffBlock::default());
    }

    #[test]
    fn descriptor_count_uses_the_stride() {
        let block = HandoffBlock {
            memory_map_size: 48 * 10,
            memory_map_desc_size: 48,
            ..HandoffBlock::zeroed()
        };
        assert_eq!(block.memory_descriptor_count(), 10);
    }
}
