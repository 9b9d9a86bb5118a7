// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The small size-class table and the request classifier.
//!
//! Requests at or below [`MAX_SMALL_SIZE`] round up to one of 28 discrete
//! size classes and are served from per-class slabs; anything larger rounds
//! up to a page multiple and is mapped directly. The table mixes a dense run
//! of 16-byte steps for tiny objects with sparser 64- and 256-byte steps
//! above, trading a little internal fragmentation for fewer classes to cache
//! per thread.

/// Size of an OS page. The engine assumes 4 KiB pages and verifies the
/// assumption against the live system at heap construction.
pub const PAGE_SIZE: usize = 4096;

/// Mask clearing the low (offset-within-page) bits of an address.
pub const PAGE_MASK: usize = !(PAGE_SIZE - 1);

/// Number of small size classes.
pub const NUM_SMALL_CLASSES: usize = 28;

/// The small size classes, strictly increasing, all multiples of 8.
pub const SMALL_SIZE_CLASSES: [usize; NUM_SMALL_CLASSES] = [
    8, 16, 32, 48, 64, 80, 96, 112, 128, 192, 256, 320, 384, 448, 512, 768, 1024, 1280, 1536,
    1792, 2048, 2304, 2560, 2816, 3072, 3328, 3584, 3840,
];

/// The largest size served from a size-class slab.
pub const MAX_SMALL_SIZE: usize = SMALL_SIZE_CLASSES[NUM_SMALL_CLASSES - 1];

/// The page containing `addr`.
#[inline]
pub fn page_of(addr: usize) -> usize {
    addr & PAGE_MASK
}

/// Round `n` up to the next page multiple.
#[inline]
pub fn round_up_page(n: usize) -> usize {
    (n + PAGE_SIZE - 1) & PAGE_MASK
}

/// Does a request for `n` bytes take the direct-mapped large path?
///
/// Sizes in `(MAX_SMALL_SIZE, PAGE_SIZE)` have no small class; they round up
/// to a whole page and are treated as large.
#[inline]
pub fn is_large(n: usize) -> bool {
    n > MAX_SMALL_SIZE
}

/// The index of the size class serving a small request of `n` bytes.
///
/// Exploits the piecewise-uniform structure of the table instead of a binary
/// search: divide into the run's step, then bump by one when `n` is not
/// exactly on a class boundary.
#[inline]
pub fn bin_idx(n: usize) -> usize {
    debug_assert!(n <= MAX_SMALL_SIZE);
    if n <= 8 {
        return 0;
    }
    if n <= 16 {
        return 1;
    }
    let idx = if n < 192 {
        1 + ((n - 16) >> 4) // 16-byte steps
    } else if n < 768 {
        9 + ((n - 192) >> 6) // 64-byte steps
    } else {
        15 + ((n - 768) >> 8) // 256-byte steps
    };
    idx + usize::from(SMALL_SIZE_CLASSES[idx] != n)
}

/// Round a request up to its allocated size: the size class for small
/// requests, the next page multiple for large ones.
#[inline]
pub fn round_up(n: usize) -> usize {
    if is_large(n) {
        round_up_page(n)
    } else {
        SMALL_SIZE_CLASSES[bin_idx(n)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn table_strictly_increasing() {
        for w in SMALL_SIZE_CLASSES.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert!(MAX_SMALL_SIZE < PAGE_SIZE);
    }

    #[test]
    fn classifier_boundaries() {
        assert_eq!(bin_idx(1), 0);
        assert_eq!(bin_idx(8), 0);
        assert_eq!(bin_idx(9), 1);
        assert_eq!(bin_idx(17), 2);
        assert_eq!(bin_idx(192), 9);
        assert_eq!(bin_idx(193), 10);
        assert_eq!(bin_idx(768), 15);
        assert_eq!(bin_idx(3840), 27);
    }

    #[test]
    fn classifier_fixed_points() {
        for (i, &size) in SMALL_SIZE_CLASSES.iter().enumerate() {
            assert_eq!(bin_idx(size), i);
            assert_eq!(round_up(size), size);
        }
    }

    #[test]
    fn large_rounding() {
        assert_eq!(round_up(4096), 4096);
        assert_eq!(round_up(4097), 8192);
        assert_eq!(round_up(30000), 32768);
        // the hole between the last class and the page boundary is large
        assert!(is_large(3841));
        assert_eq!(round_up(3841), PAGE_SIZE);
        assert_eq!(round_up(4095), PAGE_SIZE);
    }

    quickcheck! {
        fn round_up_covers_request(n: usize) -> bool {
            let n = n % PAGE_SIZE;
            round_up(n) >= n
        }

        fn round_up_idempotent(n: usize) -> bool {
            let n = n % PAGE_SIZE;
            round_up(round_up(n)) == round_up(n)
        }

        fn classifier_stable_under_rounding(n: usize) -> bool {
            let n = n % (MAX_SMALL_SIZE + 1);
            if is_large(n) {
                return true;
            }
            bin_idx(round_up(n)) == bin_idx(n)
        }

        fn class_serves_request(n: usize) -> bool {
            let n = n % (MAX_SMALL_SIZE + 1);
            if is_large(n) {
                return true;
            }
            SMALL_SIZE_CLASSES[bin_idx(n)] >= n
        }
    }
}
