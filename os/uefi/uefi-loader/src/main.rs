//! # UEFI Kernel Loader
//!
//! Loads `\System\kernel.elf` from the boot volume, retires the firmware's
//! boot services and jumps to the kernel with a single [`HandoffBlock`]
//! describing the machine.
//!
//! ## Boot Sequence
//!
//! ```text
//! UEFI Firmware
//!         ↓
//! ┌─────────────────────────────────────────────┐
//! │              UEFI Loader                    │
//! ├─────────────────────────────────────────────┤
//! │  1. Environment Setup                       │
//! │     • logger (QEMU debug port + console)    │
//! │     • loaded image diagnostics              │
//! │  2. Discovery                               │
//! │     • EDID probe, GOP mode, framebuffer     │
//! │     • ACPI / SMBIOS / MPS tables            │
//! │  3. Kernel Image                            │
//! │     • read into the 16 MiB scratch buffer   │
//! │     • validate ELF64, dry-run placement     │
//! │  4. Retirement                              │
//! │     • memory map snapshot + key             │
//! │     • ExitBootServices (bounded retries)    │
//! │  5. Hand-off                                │
//! │     • finalize the hand-off block           │
//! │     • place PT_LOAD segments, then sections │
//! │     • call e_entry(&HandoffBlock)           │
//! └─────────────────────────────────────────────┘
//!         ↓
//! Kernel
//! ```
//!
//! No page tables are built: segments are copied to their physical load
//! addresses under the firmware's identity mapping, and the kernel is entered
//! at its ELF entry address unchanged.
//!
//! ## Failure Handling
//!
//! Any failure is fatal. Before retirement it is logged to the console and the
//! QEMU debug port; afterwards only the debug port remains. Either way the
//! loader then halts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![no_main]
#![allow(unsafe_code)]
extern crate alloc;

mod config;
mod diagnostics;
mod display;
mod file_system;
mod logger;
mod memory;
mod platform;
mod tracing;

use crate::config::{KERNEL_PATH, LOG_LEVEL};
use crate::logger::UefiLogger;
use crate::platform::UefiBootPlatform;
use crate::tracing::TracedEntry;
use kernel_info::boot::HandoffBlock;
use log::{debug, error, info, warn};
use uefi::prelude::*;
use uefi_boot::elf::{IdentityMemory, KernelImage};
use uefi_boot::{
    ExitProtocol, FirmwareEntry, FirmwareTables, HandoffBuilder, HandoffSlot, enter_kernel,
};

#[entry]
fn efi_main() -> Status {
    if uefi::helpers::init().is_err() {
        return Status::UNSUPPORTED;
    }

    let Ok(logger) = UefiLogger::init(LOG_LEVEL) else {
        return Status::ABORTED;
    };

    info!("UEFI Loader reporting to QEMU");
    diagnostics::log_loaded_image();

    display::probe_edid();
    let framebuffer = display::init_framebuffer();
    let tables = uefi::system::with_config_table(FirmwareTables::locate);
    let (system, boot, runtime) = platform::service_tables();

    info!("Loading {KERNEL_PATH} ...");
    let bytes = match file_system::read_kernel(KERNEL_PATH) {
        Ok(bytes) => bytes,
        Err(e) => fatal(&e),
    };

    let image = match KernelImage::parse(bytes) {
        Ok(image) => image,
        Err(e) => fatal(&e),
    };
    info!(
        "Kernel: entry={}, machine={:#x}, {} program headers, {} section headers",
        image.entry(),
        image.machine(),
        image.segment_count(),
        image.section_count()
    );
    for segment in image.segments() {
        debug!(
            "Segment {} ({:?}, [{}], align {:#x}): {:#x} -> {:#x}, {} of {} bytes from file",
            segment.index,
            segment.kind,
            segment.flags,
            segment.align,
            segment.vaddr,
            segment.paddr,
            segment.file_size,
            segment.mem_size
        );
    }
    for placement in image.dry_run() {
        let section = placement.section;
        match placement.target {
            Some(target) => debug!(
                "Section {} ({:?} {}, {} bytes): {:#x} -> {target:#x}",
                section.index, section.kind, section.flags, section.size, section.addr
            ),
            None => warn!(
                "Section {} at {:#x} lies outside every loadable segment; it will not be placed",
                section.index, section.addr
            ),
        }
    }

    let builder = match HandoffBuilder::new()
        .with_framebuffer(framebuffer)
        .and_then(|b| b.with_firmware_tables(tables))
        .and_then(|b| b.with_system_tables(system, boot, runtime))
    {
        Ok(builder) => builder,
        Err(e) => fatal(&e),
    };

    let Some(slot) = memory::reserve::<HandoffBlock>() else {
        fatal(&"no memory for the hand-off block");
    };
    let slot = HandoffSlot::new(slot);

    let Some(mut platform) = UefiBootPlatform::new() else {
        fatal(&"boot services table unavailable");
    };

    // SAFETY: the address is the validated ELF entry point; the kernel is
    // placed there before the call.
    let entry = TracedEntry {
        entry: unsafe { FirmwareEntry::new(image.entry()) },
        address: image.entry(),
    };
    // SAFETY: boot services identity-map all of physical memory.
    let mut memory = unsafe { IdentityMemory::new() };

    #[cfg(debug_assertions)]
    diagnostics::dump_memory_map();

    info!("Exiting boot services ...");
    logger.exit_boot_services();

    let mut protocol = ExitProtocol::new();
    let err = enter_kernel(
        &mut protocol,
        &mut platform,
        &image,
        &mut memory,
        builder,
        slot,
        entry,
    );

    // Only the debug port is left once the protocol got past the first exit attempt.
    error!(
        "Boot failed in state {:?} after {} attempts: {err}",
        protocol.state(),
        protocol.attempts()
    );
    halt()
}

/// Logs a fatal error and halts.
fn fatal(error: &dyn core::fmt::Display) -> ! {
    error!("{error}");
    halt()
}

fn halt() -> ! {
    loop {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
        #[cfg(target_arch = "aarch64")]
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
        }
        #[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
        core::hint::spin_loop();
    }
}
