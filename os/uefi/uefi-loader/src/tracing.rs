//! # Trace output
//!
//! After `ExitBootServices` the QEMU debug port is the only way out.

use kernel_info::boot::HandoffBlock;
use kernel_qemu::qemu_trace;
use uefi_boot::{EntryAddress, KernelEntry};

/// Traces the hand-off block, then calls the wrapped entry.
pub struct TracedEntry<E> {
    pub entry: E,
    pub address: EntryAddress,
}

impl<E: KernelEntry> KernelEntry for TracedEntry<E> {
    fn invoke(self, handoff: &'static mut HandoffBlock) {
        trace_handoff(handoff);
        qemu_trace!("Jumping to kernel at {}\n", self.address);
        self.entry.invoke(handoff);
    }
}

pub fn trace_handoff(block: &HandoffBlock) {
    qemu_trace!("Hand-off block in UEFI Loader:\n");
    qemu_trace!("   HB ptr = {:018x}\n", core::ptr::from_ref(block) as usize);
    qemu_trace!(" MMAP ptr = {:018x}", block.memory_map as usize);
    qemu_trace!(", MMAP size = {}", block.memory_map_size);
    qemu_trace!(", MMAP desc size = {}", block.memory_map_desc_size);
    qemu_trace!(", descriptors = {}\n", block.memory_descriptor_count());
    qemu_trace!("   FB ptr = {:018x}", block.videofb);
    qemu_trace!(", FB size = {}", block.videofb_size);
    qemu_trace!(", FB {}x{}", block.xres, block.yres);
    qemu_trace!(", stride = {}", block.pixels_per_scanline);
    qemu_trace!(", pixel size = {}\n", block.pixel_size);
    qemu_trace!("     RSDP = {:018x}", block.rsdp as usize);
    qemu_trace!(", SMBIOS = {:018x}", block.smbios as usize);
    qemu_trace!(", MPS = {:018x}\n", block.mps as usize);
    qemu_trace!("   System = {:018x}", block.system_table as usize);
    qemu_trace!(", Boot = {:018x}", block.boot_services as usize);
    qemu_trace!(", Runtime = {:018x}\n", block.runtime_services as usize);
}
