// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Slab free-lists, one per (arena, size class) pair.
//!
//! A bin hands out chunks of exactly one size class and takes them back.
//! Rather than tracking every free object, it keeps a sorted map from chunk
//! address to the number of consecutive free chunks starting there, so a
//! freshly carved slab costs a single entry and adjacent frees collapse back
//! into runs. Allocation always takes the lowest address, which keeps reuse
//! dense at the front of each slab.
//!
//! Bins only ever see traffic that missed the owning thread's cache, so the
//! per-bin mutex is off the common path.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;

use log::debug;

use crate::arena::PageIndex;
use crate::error::AllocError;
use crate::size_classes::{round_up_page, PAGE_SIZE, SMALL_SIZE_CLASSES};

/// Target number of objects carved per slab for classes too big to get a
/// useful count out of a single page.
const MMAP_MIN_OBJECTS_TAKEN: usize = 32;

pub(crate) struct Bin {
    class: usize,
    state: Mutex<BinState>,
}

struct BinState {
    /// chunk address -> consecutive free chunks starting there
    free: BTreeMap<usize, usize>,
    /// slabs obtained from the OS, bootstrap included
    slabs: usize,
}

impl Bin {
    pub fn new(class: usize) -> Bin {
        debug_assert!(class < SMALL_SIZE_CLASSES.len());
        Bin {
            class,
            state: Mutex::new(BinState {
                free: BTreeMap::new(),
                slabs: 0,
            }),
        }
    }

    /// The object size this bin serves.
    #[inline]
    pub fn size(&self) -> usize {
        SMALL_SIZE_CLASSES[self.class]
    }

    /// Bytes per slab for this class: one page when that yields plenty of
    /// objects, otherwise the smallest page multiple holding
    /// `MMAP_MIN_OBJECTS_TAKEN` of them.
    pub fn slab_bytes(&self) -> usize {
        let size = self.size();
        if size < PAGE_SIZE / MMAP_MIN_OBJECTS_TAKEN {
            PAGE_SIZE
        } else {
            round_up_page(MMAP_MIN_OBJECTS_TAKEN * size)
        }
    }

    /// Prime the bin with a freshly obtained slab spanning `objects` chunks
    /// at `base`. Called once per bin at arena construction.
    pub fn seed(&self, base: usize, objects: usize) {
        debug_assert!(objects > 0);
        let mut state = self.state.lock().unwrap();
        state.free.insert(base, objects);
        state.slabs += 1;
    }

    /// Take the lowest-addressed free chunk, refilling from the OS when the
    /// free-list is empty. A fresh slab is registered in the owning arena's
    /// page index before any chunk of it escapes.
    pub fn allocate(&self, pages: &PageIndex) -> Result<NonNull<u8>, AllocError> {
        let size = self.size();
        let mut state = self.state.lock().unwrap();

        let lowest = state.free.iter().next().map(|(&addr, &run)| (addr, run));
        if let Some((addr, run)) = lowest {
            state.free.remove(&addr);
            if run > 1 {
                state.free.insert(addr + size, run - 1);
            }
            return Ok(NonNull::new(addr as *mut u8).expect("free chunks are never at null"));
        }

        let slab = self.slab_bytes();
        let base = mmap_source::map(slab).ok_or(AllocError::ExhaustedMemory { requested: slab })?;
        let addr = base.as_ptr() as usize;
        debug_assert_eq!(addr % PAGE_SIZE, 0);
        state.slabs += 1;
        debug!(
            "bin[{}] took a {} byte slab at {:#x} from the OS (slab #{})",
            size, slab, addr, state.slabs
        );
        pages.insert_slab(addr, self.class, slab / PAGE_SIZE);
        let objects = slab / size;
        state.free.insert(addr + size, objects - 1);
        Ok(base)
    }

    /// Return a chunk to the free-list, merging it with any run it touches.
    ///
    /// The right neighbour is a run starting exactly one chunk above; the
    /// left neighbour is whichever run ends exactly at `ptr`, found with a
    /// predecessor query so runs of any length absorb a chunk appended at
    /// their end.
    pub fn give_back(&self, ptr: *mut u8) {
        let size = self.size();
        let addr = ptr as usize;
        let mut state = self.state.lock().unwrap();

        let absorbed = state.free.remove(&(addr + size)).unwrap_or(0);
        let predecessor = state.free.range(..addr).next_back().map(|(&a, &run)| (a, run));
        match predecessor {
            Some((left, run)) if left + run * size == addr => {
                *state.free.get_mut(&left).unwrap() = run + 1 + absorbed;
            }
            neighbour => {
                if let Some((left, run)) = neighbour {
                    debug_assert!(left + run * size <= addr, "chunk {:#x} freed twice", addr);
                }
                state.free.insert(addr, 1 + absorbed);
            }
        }
    }

    /// Number of slabs this bin has obtained from the OS.
    #[cfg(test)]
    pub fn slabs_acquired(&self) -> usize {
        self.state.lock().unwrap().slabs
    }

    /// Snapshot of the free-list as (address, consecutive) pairs.
    #[cfg(test)]
    pub fn free_runs(&self) -> Vec<(usize, usize)> {
        self.state
            .lock()
            .unwrap()
            .free
            .iter()
            .map(|(&a, &n)| (a, n))
            .collect()
    }
}
