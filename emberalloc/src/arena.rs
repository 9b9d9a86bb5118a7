// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Arenas: the sub-heaps that shard global contention.
//!
//! An arena owns one bin per small size class and an index of every
//! OS-visible region it has handed out (slabs and large mappings alike),
//! keyed by page-aligned base address. Frees only carry a pointer, so the
//! index answers "which allocation owns this address?" with a predecessor
//! query: the record with the largest base at or below the pointer's page.
//!
//! Metadata is deliberately per-slab, not per-object: a slab spanning many
//! pages costs one record, and the record is never removed (the index is
//! bounded by the arena's high-water mark). Large mappings are recorded on
//! allocation and dropped when the mapping is returned to the OS.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::RwLock;

use log::{debug, info};

use crate::bin::Bin;
use crate::error::{die, AllocError};
use crate::size_classes::{bin_idx, page_of, NUM_SMALL_CLASSES, PAGE_SIZE};
use crate::thread_cache::ThreadDescriptor;

/// What a page range is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PageRecord {
    /// A slab carved into chunks of one size class, covering `pages`
    /// consecutive pages.
    Slab { class: usize, pages: usize },
    /// A directly mapped large object of exactly `len` bytes.
    Large { len: usize },
}

/// The used-page index: page-aligned base -> record, with predecessor
/// lookup. Read-shared on the free path, write-exclusive on insertion.
pub(crate) struct PageIndex {
    map: RwLock<BTreeMap<usize, PageRecord>>,
}

impl PageIndex {
    pub fn new() -> PageIndex {
        PageIndex {
            map: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn insert_slab(&self, base: usize, class: usize, pages: usize) {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        debug_assert!(pages >= 1);
        let mut map = self.map.write().unwrap();
        map.insert(base, PageRecord::Slab { class, pages });
    }

    pub fn insert_large(&self, base: usize, len: usize) {
        debug_assert_eq!(base % PAGE_SIZE, 0);
        let mut map = self.map.write().unwrap();
        map.insert(base, PageRecord::Large { len });
    }

    pub fn remove(&self, base: usize) {
        let mut map = self.map.write().unwrap();
        map.remove(&base);
    }

    /// The record with the largest base at or below `addr`'s page, if any.
    pub fn lookup(&self, addr: usize) -> Option<(usize, PageRecord)> {
        let map = self.map.read().unwrap();
        map.range(..=page_of(addr))
            .next_back()
            .map(|(&base, &record)| (base, record))
    }
}

/// A sub-heap: bins for the small classes plus the used-page index.
pub(crate) struct Arena {
    id: usize,
    bins: Box<[Bin]>,
    pages: PageIndex,
}

impl Arena {
    /// Build an arena with every bin primed by one slab from the
    /// program-break path, so small allocations never take the index write
    /// lock on the hot path.
    pub fn new(id: usize) -> Arena {
        let bins: Box<[Bin]> = (0..NUM_SMALL_CLASSES).map(Bin::new).collect();
        let arena = Arena {
            id,
            bins,
            pages: PageIndex::new(),
        };
        for (class, bin) in arena.bins.iter().enumerate() {
            let slab = bin.slab_bytes();
            let base = match mmap_source::extend_break(slab) {
                Some(base) => base.as_ptr() as usize,
                None => die!(
                    "seeding arena {}: the OS refused {} bytes for class {}",
                    arena.id,
                    slab,
                    bin.size()
                ),
            };
            arena.pages.insert_slab(base, class, slab / PAGE_SIZE);
            bin.seed(base, slab / bin.size());
        }
        info!("arena {} initialized with {} primed bins", id, NUM_SMALL_CLASSES);
        arena
    }

    #[inline]
    pub fn bin(&self, class: usize) -> &Bin {
        &self.bins[class]
    }

    #[cfg(test)]
    pub fn pages(&self) -> &PageIndex {
        &self.pages
    }

    /// Serve a request whose size has already been rounded by the
    /// classifier. Small requests go through the calling thread's cache
    /// first; large ones map fresh pages and record them.
    pub fn allocate(
        &self,
        size: usize,
        thread: &ThreadDescriptor,
    ) -> Result<NonNull<u8>, AllocError> {
        if size >= PAGE_SIZE {
            debug_assert_eq!(size % PAGE_SIZE, 0);
            let base =
                mmap_source::map(size).ok_or(AllocError::ExhaustedMemory { requested: size })?;
            self.pages.insert_large(base.as_ptr() as usize, size);
            debug!(
                "arena {}: mapped large object of {} bytes at {:p}",
                self.id, size, base
            );
            return Ok(base);
        }

        let class = bin_idx(size);
        if let Some(cached) = thread.pop_cache(class) {
            return Ok(cached);
        }
        self.bins[class].allocate(&self.pages)
    }

    /// Release a pointer into this arena. Large mappings go straight back to
    /// the OS; slab chunks land in the calling thread's cache.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on the calling thread and
    /// not released since. Pointers this arena does not own are detected and
    /// fatal.
    pub unsafe fn deallocate(&self, ptr: *mut u8, thread: &ThreadDescriptor) {
        let addr = ptr as usize;
        // the read lock is released before the chunk moves on to the cache
        // or a bin, keeping the lock order acyclic
        match self.pages.lookup(addr) {
            Some((base, PageRecord::Large { len })) if addr == base => {
                self.pages.remove(base);
                unsafe { mmap_source::unmap(ptr, len) };
                debug!(
                    "arena {}: unmapped large object of {} bytes at {:p}",
                    self.id, len, ptr
                );
            }
            Some((base, PageRecord::Slab { class, pages })) if addr < base + pages * PAGE_SIZE => {
                thread.push_cache(ptr, class, &self.bins[class]);
            }
            _ => die!(
                "invalid free of {:p} in arena {}: no allocation owns this \
                 address (freed on a foreign thread, or never allocated)",
                ptr,
                self.id
            ),
        }
    }
}
