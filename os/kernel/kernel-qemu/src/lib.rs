//! # QEMU Debug Console
//!
//! Byte output to QEMU's `isa-debugcon` device. The loader uses it as the one
//! log sink that keeps working after `ExitBootServices`, when the UEFI console
//! is gone.
//!
//! ```text
//! qemu_trace!("...")  ─►  DebugPort (fmt::Write)  ─►  out 0x402, al  ─►  -debugcon
//! ```
//!
//! Capture the output on the host with:
//!
//! ```bash
//! qemu-system-x86_64 ... -debugcon file:debug.log -global isa-debugcon.iobase=0x402
//! ```
//!
//! ## Features
//!
//! * `enabled` (default): writes reach the port. Without it [`qemu_trace!`]
//!   still type-checks its arguments but compiles to nothing.
//!
//! Port I/O exists only on x86. On other architectures the sink discards
//! everything.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's default debug console port.
    pub const QEMU_DEBUG_PORT: u16 = 0x402;

    /// A write-only I/O port.
    #[derive(Debug, Clone, Copy)]
    pub struct DebugPort {
        port: u16,
    }

    impl DebugPort {
        #[must_use]
        pub const fn new(port: u16) -> Self {
            Self { port }
        }

        #[allow(clippy::inline_always)]
        #[inline(always)]
        pub fn put(self, byte: u8) {
            unsafe { outb(self.port, byte) }
        }
    }

    impl Default for DebugPort {
        fn default() -> Self {
            Self::new(QEMU_DEBUG_PORT)
        }
    }

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
            "out dx, al",
            in("dx") port,
            in("al") val,
            options(nomem, nostack, preserves_flags)
            );
        }
    }

    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    #[inline]
    const unsafe fn outb(_port: u16, _val: u8) {}

    impl Write for DebugPort {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                self.put(b);
            }
            Ok(())
        }
    }

    #[doc(hidden)]
    #[inline]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best effort; the port cannot report failure.
        let _ = DebugPort::default().write_fmt(args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always, clippy::missing_const_for_fn)]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// `format!`-style output to the QEMU debug console. Never allocates.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
