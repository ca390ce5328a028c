//! # Memory Map Acquisition and Boot Services Exit
//!
//! `ExitBootServices` needs the key of a memory map snapshot that is still
//! current. Every allocation or free, including the one that creates the
//! buffer for the snapshot, changes the map and invalidates older keys. The
//! protocol therefore runs as a bounded retry loop:
//!
//! ```text
//! Idle ─► Sizing ─► Allocated ─► Snapshotted ─► Retired
//!  ▲                    │              │
//!  └────────────────────┴──────────────┘  (stale key / query failure)
//!
//! after MAX_RETIREMENT_ATTEMPTS attempts: Failed
//! ```
//!
//! Nothing is logged between taking a snapshot and the exit call that uses it.

use log::{debug, trace, warn};
use uefi::Status;

/// UEFI page granularity.
pub const PAGE_SIZE: usize = 4096;

/// How many snapshot/exit attempts are made before giving up.
pub const MAX_RETIREMENT_ATTEMPTS: usize = 10;

/// A page allocation holding (or about to hold) a memory map.
///
/// Not `Clone`: the buffer is released by moving it into
/// [`BootPlatform::free_pages`], after which it cannot be read.
#[derive(Debug, PartialEq, Eq)]
pub struct MapBuffer {
    base: u64,
    pages: usize,
}

impl MapBuffer {
    #[must_use]
    pub const fn new(base: u64, pages: usize) -> Self {
        Self { base, pages }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    /// Capacity in bytes, saturating at `usize::MAX`.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages.saturating_mul(PAGE_SIZE)
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }
}

/// One-shot token identifying one memory map snapshot.
///
/// Consumed by [`BootPlatform::exit_boot_services`].
#[derive(Debug, PartialEq, Eq)]
pub struct MapKey(usize);

impl MapKey {
    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn into_raw(self) -> usize {
        self.0
    }
}

/// Shape of a memory map as reported by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapLayout {
    /// Bytes of descriptors actually written.
    pub map_size: usize,
    /// Stride between descriptors; may be larger than `EFI_MEMORY_DESCRIPTOR`.
    pub desc_size: usize,
    pub desc_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapQueryError {
    /// The buffer (or the absence of one) cannot hold the map.
    BufferTooSmall { required: usize },
    Failed(Status),
}

/// The firmware services the exit protocol needs.
pub trait BootPlatform {
    /// `GetMemoryMap`. `None` queries the required size with a zero-capacity buffer.
    fn memory_map(&mut self, buffer: Option<&MapBuffer>) -> Result<(MapLayout, MapKey), MapQueryError>;

    /// `AllocatePages(AllocateAnyPages, EfiLoaderData, pages)`.
    fn allocate_pages(&mut self, pages: usize) -> Result<MapBuffer, Status>;

    /// `FreePages`.
    fn free_pages(&mut self, buffer: MapBuffer) -> Result<(), Status>;

    /// `ExitBootServices`. Irrevocable on success.
    fn exit_boot_services(&mut self, key: MapKey) -> Result<(), Status>;
}

/// The final memory map, valid after boot services are gone. Owned by the kernel.
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryMapSnapshot {
    buffer: MapBuffer,
    layout: MapLayout,
}

impl MemoryMapSnapshot {
    #[must_use]
    pub const fn base(&self) -> u64 {
        self.buffer.base
    }

    #[must_use]
    pub const fn map_size(&self) -> usize {
        self.layout.map_size
    }

    #[must_use]
    pub const fn desc_size(&self) -> usize {
        self.layout.desc_size
    }

    #[must_use]
    pub const fn desc_version(&self) -> u32 {
        self.layout.desc_version
    }

    /// Number of descriptors in the map.
    #[must_use]
    pub const fn len(&self) -> usize {
        if self.layout.desc_size == 0 {
            return 0;
        }
        self.layout.map_size / self.layout.desc_size
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetirementState {
    Idle,
    Sizing,
    Allocated,
    Snapshotted,
    Retired,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RetirementError {
    #[error("Boot services could not be exited after {attempts} attempts")]
    AttemptsExhausted { attempts: usize },
    #[error("Allocating {pages} pages for the memory map failed: {status:?}")]
    Allocation { pages: usize, status: Status },
}

impl From<RetirementError> for Status {
    fn from(value: RetirementError) -> Self {
        match value {
            RetirementError::AttemptsExhausted { .. } => Self::ABORTED,
            RetirementError::Allocation { status, .. } => status,
        }
    }
}

/// Drives memory map acquisition up to `ExitBootServices`.
#[derive(Debug)]
pub struct ExitProtocol {
    state: RetirementState,
    attempts: usize,
    max_attempts: usize,
}

impl Default for ExitProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitProtocol {
    #[must_use]
    pub const fn new() -> Self {
        Self::with_max_attempts(MAX_RETIREMENT_ATTEMPTS)
    }

    #[must_use]
    pub const fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            state: RetirementState::Idle,
            attempts: 0,
            max_attempts,
        }
    }

    #[must_use]
    pub const fn state(&self) -> RetirementState {
        self.state
    }

    /// Attempts started so far.
    #[must_use]
    pub const fn attempts(&self) -> usize {
        self.attempts
    }

    /// Runs the protocol to `Retired` or `Failed`.
    ///
    /// On success boot services are gone and the returned snapshot describes
    /// the final memory map, including its own buffer.
    pub fn run<P: BootPlatform>(
        &mut self,
        platform: &mut P,
    ) -> Result<MemoryMapSnapshot, RetirementError> {
        let mut previous: Option<MapBuffer> = None;
        let mut pages = 0usize;

        while self.attempts < self.max_attempts {
            self.attempts += 1;
            self.state = RetirementState::Idle;

            if let Some(buffer) = previous.take() {
                release(platform, buffer);
            }

            self.state = RetirementState::Sizing;
            let required = match platform.memory_map(None) {
                Err(MapQueryError::BufferTooSmall { required }) => required,
                Err(MapQueryError::Failed(status)) => {
                    warn!("GetMemoryMap size query failed: {status:?}");
                    continue;
                }
                Ok(_) => {
                    warn!("GetMemoryMap succeeded without a buffer");
                    continue;
                }
            };

            // One extra page: the allocation itself may split a descriptor.
            let Some(grown) = buffer_pages(required, pages) else {
                warn!("GetMemoryMap reports an unaddressable size of {required} bytes");
                continue;
            };
            pages = grown;
            trace!(
                "Memory map attempt {}: {required} bytes required, allocating {pages} pages",
                self.attempts
            );

            let buffer = match platform.allocate_pages(pages) {
                Ok(buffer) => buffer,
                Err(status) => {
                    self.state = RetirementState::Failed;
                    return Err(RetirementError::Allocation { pages, status });
                }
            };
            self.state = RetirementState::Allocated;

            let (layout, key) = match platform.memory_map(Some(&buffer)) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!("GetMemoryMap into {pages} pages failed: {e:?}");
                    previous = Some(buffer);
                    continue;
                }
            };
            self.state = RetirementState::Snapshotted;

            // No logging, allocation or free until the key is spent.
            if platform.exit_boot_services(key).is_ok() {
                self.state = RetirementState::Retired;
                return Ok(MemoryMapSnapshot { buffer, layout });
            }

            debug!("ExitBootServices rejected the map key; retrying");
            previous = Some(buffer);
        }

        if let Some(buffer) = previous.take() {
            release(platform, buffer);
        }

        self.state = RetirementState::Failed;
        Err(RetirementError::AttemptsExhausted {
            attempts: self.attempts,
        })
    }
}

/// Pages for a map of `required` bytes: one page of slack, and always more
/// than the previous attempt. `None` if the buffer would not be addressable.
fn buffer_pages(required: usize, previous: usize) -> Option<usize> {
    let pages = required
        .div_ceil(PAGE_SIZE)
        .checked_add(1)?
        .max(previous.checked_add(1)?);
    pages.checked_mul(PAGE_SIZE)?;
    Some(pages)
}

fn release<P: BootPlatform>(platform: &mut P, buffer: MapBuffer) {
    let pages = buffer.pages();
    if let Err(status) = platform.free_pages(buffer) {
        warn!("Failed to free {pages} memory map pages: {status:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Size,
        Fill { base: u64, pages: usize },
        Alloc(usize),
        Free(u64),
        Exit(usize),
    }

    /// Firmware model: the map grows by one descriptor per live allocation
    /// and the key changes on every allocate/free.
    struct FakeFirmware {
        calls: Vec<Call>,
        descriptors: usize,
        key: usize,
        next_base: u64,
        growth_per_query: usize,
        stale_exits: usize,
        fail_alloc: bool,
        failed_size_queries: usize,
        reported_size: Option<usize>,
    }

    const DESC: usize = 48;

    impl FakeFirmware {
        fn new(descriptors: usize) -> Self {
            Self {
                calls: Vec::new(),
                descriptors,
                key: 100,
                next_base: 0x10_0000,
                growth_per_query: 0,
                stale_exits: 0,
                fail_alloc: false,
                failed_size_queries: 0,
                reported_size: None,
            }
        }

        fn map_size(&self) -> usize {
            self.descriptors * DESC
        }
    }

    impl BootPlatform for FakeFirmware {
        fn memory_map(
            &mut self,
            buffer: Option<&MapBuffer>,
        ) -> Result<(MapLayout, MapKey), MapQueryError> {
            self.descriptors += self.growth_per_query;
            match buffer {
                None => {
                    self.calls.push(Call::Size);
                    if self.failed_size_queries > 0 {
                        self.failed_size_queries -= 1;
                        return Err(MapQueryError::Failed(Status::DEVICE_ERROR));
                    }
                    Err(MapQueryError::BufferTooSmall {
                        required: self.reported_size.unwrap_or(self.map_size()),
                    })
                }
                Some(buffer) => {
                    self.calls.push(Call::Fill {
                        base: buffer.base(),
                        pages: buffer.pages(),
                    });
                    if buffer.len() < self.map_size() {
                        return Err(MapQueryError::BufferTooSmall {
                            required: self.map_size(),
                        });
                    }
                    Ok((
                        MapLayout {
                            map_size: self.map_size(),
                            desc_size: DESC,
                            desc_version: 1,
                        },
                        MapKey::new(self.key),
                    ))
                }
            }
        }

        fn allocate_pages(&mut self, pages: usize) -> Result<MapBuffer, Status> {
            self.calls.push(Call::Alloc(pages));
            if self.fail_alloc {
                return Err(Status::OUT_OF_RESOURCES);
            }
            self.descriptors += 1;
            self.key += 1;
            let base = self.next_base;
            self.next_base += (pages * PAGE_SIZE) as u64;
            Ok(MapBuffer::new(base, pages))
        }

        fn free_pages(&mut self, buffer: MapBuffer) -> Result<(), Status> {
            self.calls.push(Call::Free(buffer.base()));
            self.descriptors -= 1;
            self.key += 1;
            Ok(())
        }

        fn exit_boot_services(&mut self, key: MapKey) -> Result<(), Status> {
            let key = key.into_raw();
            self.calls.push(Call::Exit(key));
            if self.stale_exits > 0 {
                self.stale_exits -= 1;
                // Something else allocated behind our back.
                self.key += 1;
                return Err(Status::INVALID_PARAMETER);
            }
            if key == self.key {
                Ok(())
            } else {
                Err(Status::INVALID_PARAMETER)
            }
        }
    }

    #[test]
    fn retires_on_first_attempt() {
        let mut fw = FakeFirmware::new(40);
        let mut protocol = ExitProtocol::new();
        let snapshot = protocol.run(&mut fw).unwrap();

        assert_eq!(protocol.state(), RetirementState::Retired);
        assert_eq!(protocol.attempts(), 1);
        // 40 * 48 = 1920 bytes -> 1 page, plus one page of slack.
        assert_eq!(
            fw.calls,
            [
                Call::Size,
                Call::Alloc(2),
                Call::Fill {
                    base: 0x10_0000,
                    pages: 2
                },
                Call::Exit(101),
            ]
        );
        assert_eq!(snapshot.base(), 0x10_0000);
        assert_eq!(snapshot.map_size(), 41 * DESC);
        assert_eq!(snapshot.desc_size(), DESC);
        assert_eq!(snapshot.len(), 41);
        assert_eq!(snapshot.desc_version(), 1);
    }

    #[test]
    fn stale_key_frees_the_previous_buffer_and_retries() {
        let mut fw = FakeFirmware::new(10);
        fw.stale_exits = 2;
        let mut protocol = ExitProtocol::new();
        let snapshot = protocol.run(&mut fw).unwrap();

        assert_eq!(protocol.attempts(), 3);
        assert_eq!(protocol.state(), RetirementState::Retired);

        let frees: Vec<_> = fw
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Free(base) => Some(*base),
                _ => None,
            })
            .collect();
        let allocs = fw
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Alloc(_)))
            .count();
        assert_eq!(allocs, 3);
        // Both earlier buffers were released, never the one that was kept.
        assert_eq!(frees.len(), 2);
        assert!(!frees.contains(&snapshot.base()));
        // Page count grows by at least one per attempt: 2, 3, 4.
        assert_eq!(snapshot.buffer.pages(), 4);
    }

    #[test]
    fn exit_only_sees_the_key_of_the_preceding_snapshot() {
        let mut fw = FakeFirmware::new(10);
        fw.stale_exits = 3;
        let mut protocol = ExitProtocol::new();
        protocol.run(&mut fw).unwrap();

        // Replay the call log: every Exit must be immediately preceded by the
        // Fill that produced its key, with no allocation or free in between.
        let mut key = 100usize;
        let mut last_fill_key = None;
        for call in &fw.calls {
            match *call {
                Call::Alloc(_) | Call::Free(_) => {
                    key += 1;
                    last_fill_key = None;
                }
                Call::Fill { .. } => last_fill_key = Some(key),
                Call::Exit(submitted) => {
                    assert_eq!(Some(submitted), last_fill_key);
                    last_fill_key = None;
                    key += 1; // stale exit in the fake bumps the key
                }
                Call::Size => {}
            }
        }
    }

    #[test]
    fn gives_up_after_ten_attempts_when_the_map_keeps_growing() {
        let mut fw = FakeFirmware::new(200);
        // Outgrow any slack between the size query and the fill.
        fw.growth_per_query = 200;
        let mut protocol = ExitProtocol::new();
        let err = protocol.run(&mut fw).unwrap_err();

        assert_eq!(
            err,
            RetirementError::AttemptsExhausted {
                attempts: MAX_RETIREMENT_ATTEMPTS
            }
        );
        assert_eq!(protocol.state(), RetirementState::Failed);
        assert_eq!(protocol.attempts(), MAX_RETIREMENT_ATTEMPTS);

        let allocs: Vec<_> = fw
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Alloc(pages) => Some(*pages),
                _ => None,
            })
            .collect();
        assert_eq!(allocs.len(), MAX_RETIREMENT_ATTEMPTS);
        assert!(allocs.windows(2).all(|w| w[0] < w[1]));

        // Never attempted to exit, and every buffer was handed back.
        assert!(!fw.calls.iter().any(|c| matches!(c, Call::Exit(_))));
        let frees = fw.calls.iter().filter(|c| matches!(c, Call::Free(_))).count();
        assert_eq!(frees, MAX_RETIREMENT_ATTEMPTS);
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let mut fw = FakeFirmware::new(10);
        fw.fail_alloc = true;
        let mut protocol = ExitProtocol::new();
        let err = protocol.run(&mut fw).unwrap_err();

        assert_eq!(
            err,
            RetirementError::Allocation {
                pages: 2,
                status: Status::OUT_OF_RESOURCES
            }
        );
        assert_eq!(protocol.state(), RetirementState::Failed);
        assert_eq!(protocol.attempts(), 1);
        assert_eq!(Status::from(err), Status::OUT_OF_RESOURCES);
    }

    #[test]
    fn custom_ceiling_is_honored() {
        let mut fw = FakeFirmware::new(10);
        fw.stale_exits = usize::MAX;
        let mut protocol = ExitProtocol::with_max_attempts(3);
        assert_eq!(
            protocol.run(&mut fw).unwrap_err(),
            RetirementError::AttemptsExhausted { attempts: 3 }
        );
    }

    #[test]
    fn failed_size_query_uses_up_one_attempt() {
        let mut fw = FakeFirmware::new(10);
        fw.failed_size_queries = 1;
        let mut protocol = ExitProtocol::new();
        let snapshot = protocol.run(&mut fw).unwrap();

        assert_eq!(protocol.attempts(), 2);
        assert_eq!(protocol.state(), RetirementState::Retired);
        // Nothing was allocated for the failed attempt.
        assert_eq!(fw.calls[..2], [Call::Size, Call::Size]);
        assert_eq!(snapshot.buffer.pages(), 2);
    }

    #[test]
    fn unaddressable_map_size_never_reaches_the_allocator() {
        let mut fw = FakeFirmware::new(10);
        fw.reported_size = Some(usize::MAX - 10);
        let mut protocol = ExitProtocol::with_max_attempts(3);

        assert_eq!(
            protocol.run(&mut fw).unwrap_err(),
            RetirementError::AttemptsExhausted { attempts: 3 }
        );
        assert_eq!(protocol.state(), RetirementState::Failed);
        assert!(fw.calls.iter().all(|c| *c == Call::Size));
    }

    #[test]
    fn buffer_pages_grow_and_stay_addressable() {
        assert_eq!(buffer_pages(1920, 0), Some(2));
        assert_eq!(buffer_pages(1920, 5), Some(6));
        assert_eq!(buffer_pages(usize::MAX, 0), None);
        assert_eq!(buffer_pages(0, usize::MAX / PAGE_SIZE), None);
        assert_eq!(MapBuffer::new(0, usize::MAX).len(), usize::MAX);
    }
}
