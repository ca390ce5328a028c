//! # Raw Memory Primitives
//!
//! Copy, compare and fill over raw byte ranges. The loader writes kernel bytes
//! to physical addresses that are not backed by any Rust allocation, so these
//! work on pointers rather than slices. A null pointer turns every operation
//! into a no-op.

use core::cmp::Ordering;

/// Copies `len` bytes from `src` to `dst` and returns `dst`.
///
/// Overlapping ranges are handled like `memmove`.
///
/// # Safety
/// Both ranges must be valid for `len` bytes unless the respective pointer is null.
pub unsafe fn copy(dst: *mut u8, src: *const u8, len: usize) -> *mut u8 {
    if dst.is_null() || src.is_null() || len == 0 {
        return dst;
    }

    unsafe {
        core::ptr::copy(src, dst, len);
    }
    dst
}

/// Lexicographically compares two byte ranges of `len` bytes.
///
/// A null range orders before any non-null range; two null ranges are equal.
///
/// # Safety
/// Non-null pointers must be valid for reads of `len` bytes.
#[must_use]
pub unsafe fn compare(a: *const u8, b: *const u8, len: usize) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => {}
    }

    for i in 0..len {
        let (x, y) = unsafe { (a.add(i).read(), b.add(i).read()) };
        match x.cmp(&y) {
            Ordering::Equal => {}
            other => return other,
        }
    }

    Ordering::Equal
}

/// Sets `len` bytes starting at `dst` to `value` and returns `dst`.
///
/// # Safety
/// `dst` must be valid for writes of `len` bytes unless it is null.
pub unsafe fn fill(dst: *mut u8, value: u8, len: usize) -> *mut u8 {
    if dst.is_null() {
        return dst;
    }

    unsafe {
        core::ptr::write_bytes(dst, value, len);
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr;

    #[test]
    fn copy_moves_bytes() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        let ret = unsafe { copy(dst.as_mut_ptr(), src.as_ptr(), src.len()) };
        assert_eq!(ret, dst.as_mut_ptr());
        assert_eq!(dst, src);
    }

    #[test]
    fn copy_handles_overlap() {
        let mut buf = [1u8, 2, 3, 4, 5, 0];
        let base = buf.as_mut_ptr();
        unsafe { copy(base.add(1), base, 5) };
        assert_eq!(buf, [1, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn null_pointers_are_ignored() {
        let mut dst = [7u8; 2];
        unsafe {
            copy(dst.as_mut_ptr(), ptr::null(), 2);
            assert!(copy(ptr::null_mut(), dst.as_ptr(), 2).is_null());
            assert!(fill(ptr::null_mut(), 0, 2).is_null());
        }
        assert_eq!(dst, [7, 7]);
    }

    #[test]
    fn compare_orders_ranges() {
        let a = [1u8, 2, 3];
        let b = [1u8, 2, 4];
        unsafe {
            assert_eq!(compare(a.as_ptr(), a.as_ptr(), 3), Ordering::Equal);
            assert_eq!(compare(a.as_ptr(), b.as_ptr(), 3), Ordering::Less);
            assert_eq!(compare(b.as_ptr(), a.as_ptr(), 3), Ordering::Greater);
            assert_eq!(compare(a.as_ptr(), b.as_ptr(), 2), Ordering::Equal);
            assert_eq!(compare(ptr::null(), ptr::null(), 3), Ordering::Equal);
            assert_eq!(compare(ptr::null(), a.as_ptr(), 3), Ordering::Less);
            assert_eq!(compare(a.as_ptr(), ptr::null(), 3), Ordering::Greater);
        }
    }

    #[test]
    fn fill_sets_every_byte() {
        let mut buf = [0xAAu8; 8];
        unsafe { fill(buf.as_mut_ptr().add(2), 0, 4) };
        assert_eq!(buf, [0xAA, 0xAA, 0, 0, 0, 0, 0xAA, 0xAA]);
    }
}
