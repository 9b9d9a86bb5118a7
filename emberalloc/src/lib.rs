// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An arena/slab dynamic memory allocator with decaying per-thread caches.
//!
//! `emberalloc` serves `allocate`/`deallocate` requests straight from
//! anonymous OS mappings, in the jemalloc/tcmalloc family: requests are
//! rounded to one of 28 small size classes (or to whole pages above that),
//! small classes are carved out of multi-object slabs, and global state is
//! sharded across a fixed set of arenas so threads on different arenas never
//! contend. The common small-object path, allocate and free on the same hot
//! thread, is served from a per-thread LIFO cache and takes no mutex at
//! all, only a per-class spin flag shared with that thread's purge timer.
//!
//! Caches do not hoard: every descriptor arms a repeating timer whose tick
//! returns a geometrically growing share of each idle class back to its bin,
//! so memory stranded on quiescent threads bleeds back within seconds.
//!
//! This is a *freestanding* allocator, not a drop-in global allocator: it is
//! used through a handle (or the process-wide instance below), and its own
//! metadata lives on the ordinary Rust heap.
//!
//! # Using the allocator
//!
//! ```rust,ignore
//! let heap = emberalloc::Heap::new();
//! let p = heap.allocate(48);
//! unsafe {
//!     std::ptr::write_bytes(p, 0xA5, 48);
//!     heap.deallocate(p);
//! }
//! ```
//!
//! Handles are cheap clones of one shared heap; the `allocate`/`deallocate`
//! free functions operate on a lazily created process-wide instance.
//!
//! # Caller contract
//!
//! `deallocate` must receive a pointer obtained from `allocate` on the *same
//! thread* and not yet freed. Frees of foreign or never-allocated pointers
//! are detected through the arena page index and abort with a diagnostic;
//! double frees of a live cache entry are undefined.

mod arena;
mod bin;
mod error;
mod size_classes;
mod sync;
mod thread_cache;
mod timer;

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, ThreadId};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, info};

use crate::arena::Arena;
use crate::error::die;
use crate::thread_cache::{ThreadDescriptor, DEFAULT_PURGE_PERIOD};

pub use crate::error::AllocError;
pub use crate::size_classes::{round_up, MAX_SMALL_SIZE, NUM_SMALL_CLASSES, PAGE_SIZE};

/// A builder-pattern-style builder for [`Heap`]s.
///
/// ```rust,ignore
/// // a heap with one arena purging its thread caches every 50ms
/// let heap = HeapBuilder::default()
///     .arenas(1)
///     .purge_period(Duration::from_millis(50))
///     .build();
/// ```
pub struct HeapBuilder {
    arenas: usize,
    purge_period: Duration,
}

impl Default for HeapBuilder {
    fn default() -> Self {
        HeapBuilder {
            // enough arenas that threads rarely share one
            arenas: 4 * num_cpus::get(),
            purge_period: DEFAULT_PURGE_PERIOD,
        }
    }
}

impl HeapBuilder {
    /// Number of arenas contention is sharded over.
    pub fn arenas(&mut self, arenas: usize) -> &mut Self {
        assert!(arenas > 0, "a heap needs at least one arena");
        self.arenas = arenas;
        self
    }

    /// Interval between thread-cache decay ticks.
    pub fn purge_period(&mut self, period: Duration) -> &mut Self {
        self.purge_period = period;
        self
    }

    /// Build a [`Heap`] from the current configuration. Every bin of every
    /// arena is primed with a slab, so this touches the OS.
    pub fn build(&self) -> Heap {
        assert_eq!(
            mmap_source::page_size(),
            PAGE_SIZE,
            "emberalloc assumes {} byte pages",
            PAGE_SIZE
        );
        let arenas: Arc<[Arena]> = (0..self.arenas).map(Arena::new).collect::<Vec<_>>().into();
        info!(
            "heap created with {} arenas, purge period {:?}",
            self.arenas, self.purge_period
        );
        Heap {
            inner: Arc::new(HeapInner {
                arenas,
                threads: RwLock::new(HashMap::new()),
                next_arena: AtomicUsize::new(0),
                purge_period: self.purge_period,
            }),
        }
    }
}

struct HeapInner {
    arenas: Arc<[Arena]>,
    /// thread identity -> descriptor. `Arc` keeps descriptor addresses
    /// stable while the map rehashes.
    threads: RwLock<HashMap<ThreadId, Arc<ThreadDescriptor>>>,
    next_arena: AtomicUsize,
    purge_period: Duration,
}

/// A handle on a shared heap. Clones are cheap and refer to the same arenas
/// and thread registry; the heap lives until the last handle (and the last
/// armed purge timer) is gone.
#[derive(Clone)]
pub struct Heap {
    inner: Arc<HeapInner>,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    /// A heap with the default configuration.
    pub fn new() -> Heap {
        HeapBuilder::default().build()
    }

    /// Allocate at least `n` writable bytes, 8-byte aligned for small
    /// requests and page-aligned for large ones.
    ///
    /// Memory exhaustion is fatal; use [`Heap::try_allocate`] to recover
    /// from it instead.
    pub fn allocate(&self, n: usize) -> *mut u8 {
        match self.try_allocate(n) {
            Ok(region) => region.as_ptr(),
            Err(err) => die!("allocation of {} bytes failed: {}", n, err),
        }
    }

    /// Allocate at least `n` writable bytes, reporting memory exhaustion
    /// instead of aborting.
    pub fn try_allocate(&self, n: usize) -> Result<NonNull<u8>, AllocError> {
        let size = round_up(n);
        let tid = thread::current().id();

        let mut threads = self.inner.threads.read().unwrap();
        if !threads.contains_key(&tid) {
            // first allocation on this thread: trade the read lock for the
            // write lock, register, and take the read lock back
            drop(threads);
            self.register_thread(tid);
            threads = self.inner.threads.read().unwrap();
        }
        let descriptor = Arc::clone(threads.get(&tid).expect("descriptor registered above"));
        self.inner.arenas[descriptor.arena()].allocate(size, &descriptor)
    }

    /// Release a region previously returned by `allocate`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate`/`try_allocate` on this
    /// heap *from the calling thread*, must not have been released before,
    /// and no live references into the region may remain. Violations are
    /// detected where the page index allows and abort the process.
    pub unsafe fn deallocate(&self, ptr: *mut u8) {
        let tid = thread::current().id();
        let threads = self.inner.threads.read().unwrap();
        match threads.get(&tid) {
            Some(descriptor) => {
                let arena = &self.inner.arenas[descriptor.arena()];
                unsafe { arena.deallocate(ptr, descriptor) };
            }
            None => die!(
                "invalid free of {:p}: the calling thread has never allocated",
                ptr
            ),
        }
    }

    /// Register the calling thread with a round-robin arena assignment.
    fn register_thread(&self, tid: ThreadId) {
        let mut threads = self.inner.threads.write().unwrap();
        threads.entry(tid).or_insert_with(|| {
            let arena = self.inner.next_arena.fetch_add(1, Ordering::Relaxed)
                % self.inner.arenas.len();
            debug!("assigning thread {:?} to arena {}", tid, arena);
            ThreadDescriptor::spawn(arena, &self.inner.arenas, self.inner.purge_period)
        });
    }
}

lazy_static! {
    /// The process-wide heap behind the crate-level free functions.
    static ref GLOBAL: Heap = Heap::new();
}

/// Allocate from the process-wide heap. See [`Heap::allocate`].
pub fn allocate(n: usize) -> *mut u8 {
    GLOBAL.allocate(n)
}

/// Fallibly allocate from the process-wide heap. See [`Heap::try_allocate`].
pub fn try_allocate(n: usize) -> Result<NonNull<u8>, AllocError> {
    GLOBAL.try_allocate(n)
}

/// Release to the process-wide heap.
///
/// # Safety
///
/// As [`Heap::deallocate`].
pub unsafe fn deallocate(ptr: *mut u8) {
    unsafe { GLOBAL.deallocate(ptr) }
}
