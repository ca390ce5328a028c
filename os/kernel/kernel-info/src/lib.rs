//! # Loader to Kernel Interface
//!
//! The ABI shared between the UEFI loader and the kernel it starts. Both sides
//! depend on this crate so the hand-off layout cannot drift.
//!
//! ## Boot Protocol
//!
//! ```text
//!   loader                                 kernel
//!   ──────                                 ──────
//!   ExitBootServices
//!   fill HandoffBlock  ──── *mut ────►     entry(block)
//!   place segments
//!   jump to e_entry
//! ```
//!
//! The entry point has the [`KernelEntryFn`](boot::KernelEntryFn) signature:
//!
//! ```rust
//! # use kernel_info::boot::HandoffBlock;
//! pub type KernelEntryFn = unsafe extern "efiapi" fn(*mut HandoffBlock);
//! ```
//!
//! * **Calling Convention**: the firmware's (`efiapi`)
//! * **Parameter**: one pointer to the [`HandoffBlock`](boot::HandoffBlock)
//! * **No Return**: the loader treats a return as fatal
//!
//! ## Hand-off Block
//!
//! [`HandoffBlock`](boot::HandoffBlock) is `#[repr(C)]` with a fixed field
//! order. It carries the final UEFI memory map, the linear framebuffer
//! geometry, the ACPI RSDP, the SMBIOS and MPS entry points, and the UEFI
//! system, boot services and runtime services tables. Anything the loader did
//! not find is null or zero.
//!
//! The memory map buffer and the block itself live in `EfiLoaderData` memory
//! and belong to the kernel after the hand-off.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
