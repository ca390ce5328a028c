//! # Boot Services Pool Allocator
//!
//! Backs `alloc` with `AllocatePool(EfiLoaderData)`. Pool memory keeps its
//! type after `ExitBootServices`, so anything leaked from here (the hand-off
//! block in particular) stays valid for the kernel. Allocating after boot
//! services are gone panics inside `uefi`, so nothing may allocate past
//! `ExitBootServices`.

#![allow(unsafe_code)]

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};
use uefi::boot::{self, MemoryType};

/// `AllocatePool` returns 8-byte aligned memory.
const POOL_ALIGN: usize = 8;

const HEADER: usize = size_of::<usize>();

pub struct PoolAllocator;

#[global_allocator]
static GLOBAL_ALLOC: PoolAllocator = PoolAllocator;

impl PoolAllocator {
    fn pool(size: usize) -> *mut u8 {
        boot::allocate_pool(MemoryType::LOADER_DATA, size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Over-allocates and stores the pool pointer in the word preceding the
    /// aligned block.
    unsafe fn alloc_overaligned(layout: Layout) -> *mut u8 {
        let Some(total) = layout
            .size()
            .checked_add(layout.align())
            .and_then(|v| v.checked_add(HEADER))
        else {
            return ptr::null_mut();
        };

        let raw = Self::pool(total);
        if raw.is_null() {
            return raw;
        }

        let aligned = unsafe { raw.add(HEADER) };
        let aligned = unsafe { aligned.add(aligned.align_offset(layout.align())) };
        unsafe { aligned.cast::<*mut u8>().sub(1).write_unaligned(raw) };
        aligned
    }
}

unsafe impl GlobalAlloc for PoolAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= POOL_ALIGN {
            return Self::pool(layout.size().max(1));
        }
        unsafe { Self::alloc_overaligned(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let raw = if layout.align() <= POOL_ALIGN {
            ptr
        } else {
            unsafe { ptr.cast::<*mut u8>().sub(1).read_unaligned() }
        };

        if let Some(raw) = NonNull::new(raw) {
            // SAFETY: `raw` came from `allocate_pool`.
            let _ = unsafe { boot::free_pool(raw) };
        }
    }
}

/// Reserves storage that outlives boot services and is never freed.
///
/// Returns `None` when the pool is exhausted.
pub fn reserve<T>() -> Option<&'static mut MaybeUninit<T>> {
    let layout = Layout::new::<MaybeUninit<T>>();
    if layout.size() == 0 {
        return None;
    }
    let block = unsafe { alloc::alloc::alloc(layout) }.cast::<MaybeUninit<T>>();
    // SAFETY: fresh, suitably aligned allocation that is never freed.
    NonNull::new(block).map(|block| unsafe { &mut *block.as_ptr() })
}
