use core::sync::atomic::{AtomicBool, Ordering};
use kernel_qemu::qemu_trace;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

static LOGGER: UefiLogger = UefiLogger::new();

/// Logs to the QEMU debug port and, while boot services exist, the UEFI console.
pub struct UefiLogger {
    boot_services_available: AtomicBool,
}

impl UefiLogger {
    #[must_use]
    const fn new() -> Self {
        Self {
            boot_services_available: AtomicBool::new(true),
        }
    }

    /// Call this once during early init.
    pub fn init(max_level: LevelFilter) -> Result<&'static Self, SetLoggerError> {
        log::set_logger(&LOGGER)?;
        log::set_max_level(max_level);
        Ok(&LOGGER)
    }

    /// Stops mirroring to the console. Must be called before the first
    /// `ExitBootServices` attempt: even a failed attempt may have torn down
    /// the console.
    pub fn exit_boot_services(&self) {
        self.boot_services_available.store(false, Ordering::Release);
    }
}

impl Log for UefiLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Format: "[LEVEL] target: message\n"
        qemu_trace!(
            "[{}] {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        );

        if self.boot_services_available.load(Ordering::Acquire) {
            uefi::println!(
                "[{}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        // no-op for qemu debug port
    }
}
