// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level plumbing for getting memory from (and back to) the operating
//! system.
//!
//! The allocator engine consumes exactly three primitives: anonymous mappings
//! (`map`/`unmap`) for slab refills and large objects, and a page-aligned
//! program-break extension (`extend_break`) used once per bin at arena
//! construction. Everything here is a thin veneer over the corresponding
//! syscalls; policy (slab sizing, bookkeeping, reuse) lives upstream.
//!
//! All sizes crossing this boundary must be multiples of the system page
//! size. Failure to *obtain* memory is reported with `None` so the caller can
//! decide whether it is fatal; failure to *release* memory is always a bug
//! and panics.

use std::ptr::{self, NonNull};

use errno::errno;
use log::warn;

/// The system page size.
pub fn page_size() -> usize {
    sysconf::page::pagesize()
}

/// Request `size` bytes of fresh, zero-filled, page-aligned anonymous memory.
///
/// `size` must be a non-zero multiple of [`page_size`]. Returns `None` when
/// the system refuses the mapping (address space or memory exhaustion).
pub fn map(size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size > 0 && size % page_size() == 0);
    let region = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if region == libc::MAP_FAILED {
        warn!("mmap of {} bytes failed: {}", size, errno());
        return None;
    }
    NonNull::new(region as *mut u8)
}

/// Release a mapping previously returned by [`map`].
///
/// # Safety
///
/// `base` must be the exact pointer returned by a [`map`] call with this
/// `size`, not released before, and no live references into the region may
/// remain.
pub unsafe fn unmap(base: *mut u8, size: usize) {
    let ret = unsafe { libc::munmap(base as *mut libc::c_void, size) };
    // A failing munmap means our bookkeeping handed us a bogus region; there
    // is no way to limp on from that.
    assert_eq!(ret, 0, "munmap({:p}, {}) failed: {}", base, size, errno());
}

/// Extend the program break by at least `size` bytes and return a
/// page-aligned region of that size.
///
/// The break is not guaranteed to sit on a page boundary (and other users of
/// `sbrk` may move it between our calls), so we over-request by one page and
/// align within the result rather than trying to pre-pad exactly.
///
/// Memory obtained this way can never be returned to the system; it is meant
/// for allocator bootstrap state that lives for the life of the process.
pub fn extend_break(size: usize) -> Option<NonNull<u8>> {
    let page = page_size();
    debug_assert!(size > 0 && size % page == 0);
    let raw = unsafe { libc::sbrk((size + page) as libc::intptr_t) };
    if raw == usize::MAX as *mut libc::c_void {
        warn!("sbrk of {} bytes failed: {}", size + page, errno());
        return None;
    }
    let addr = raw as usize;
    let aligned = (addr + page - 1) & !(page - 1);
    NonNull::new(aligned as *mut u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr::{read_volatile, write_volatile};

    #[test]
    fn page_size_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }

    #[test]
    fn map_write_unmap() {
        let _ = env_logger::builder().is_test(true).try_init();
        let size = 4 * page_size();
        let base = map(size).expect("mapping four pages should succeed");
        assert_eq!(base.as_ptr() as usize % page_size(), 0);
        unsafe {
            // touch the first and last byte of the region
            write_volatile(base.as_ptr(), 0xAB);
            write_volatile(base.as_ptr().add(size - 1), 0xCD);
            assert_eq!(read_volatile(base.as_ptr()), 0xAB);
            unmap(base.as_ptr(), size);
        }
    }

    #[test]
    fn map_is_zero_filled() {
        let size = page_size();
        let base = map(size).expect("mapping one page should succeed");
        unsafe {
            for i in (0..size).step_by(512) {
                assert_eq!(read_volatile(base.as_ptr().add(i)), 0);
            }
            unmap(base.as_ptr(), size);
        }
    }

    #[test]
    fn extend_break_aligned_and_writable() {
        let size = 2 * page_size();
        let base = extend_break(size).expect("extending the break should succeed");
        assert_eq!(base.as_ptr() as usize % page_size(), 0);
        unsafe {
            write_volatile(base.as_ptr(), 1u8);
            write_volatile(base.as_ptr().add(size - 1), 2u8);
        }
    }

    #[test]
    fn extend_break_regions_disjoint() {
        let size = page_size();
        let a = extend_break(size).unwrap().as_ptr() as usize;
        let b = extend_break(size).unwrap().as_ptr() as usize;
        assert!(b >= a + size || a >= b + size);
    }
}
