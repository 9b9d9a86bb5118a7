// Copyright 2024 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread descriptors: the caches that make the hot path lock-free.
//!
//! Every thread that allocates gets a descriptor holding a small LIFO of
//! recently freed chunks per size class. Push and pop touch nothing shared
//! beyond a per-class spin flag whose sole other taker is the thread's own
//! purge timer, so the common small-object round trip never sees a mutex.
//!
//! Caches decay rather than persist: a repeating tick returns a growing
//! number of the oldest entries to their bin, doubling the amount each idle
//! tick, and any push or pop resets the rate to one. A busy class keeps its
//! cache; an idle one drains completely within a handful of ticks.

use std::ptr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::trace;

use crate::arena::Arena;
use crate::bin::Bin;
use crate::size_classes::NUM_SMALL_CLASSES;
use crate::sync::SpinLock;
use crate::timer::Ticker;

/// Cached chunks per size class per thread. Larger caches lower peak lock
/// contention at the price of more memory stranded on idle threads.
pub(crate) const THREAD_CACHE_SIZE: usize = 16;

/// Default interval between purge ticks.
pub(crate) const DEFAULT_PURGE_PERIOD: Duration = Duration::from_secs(2);

/// One size class worth of cached chunks.
struct ClassCache {
    slots: [*mut u8; THREAD_CACHE_SIZE],
    /// number of live entries; the stack grows upward from 0
    top: usize,
    /// entries the next purge tick may discard; 0 until first use
    decay: usize,
}

impl ClassCache {
    fn new() -> ClassCache {
        ClassCache {
            slots: [ptr::null_mut(); THREAD_CACHE_SIZE],
            top: 0,
            decay: 0,
        }
    }
}

pub(crate) struct ThreadDescriptor {
    arena: usize,
    classes: [SpinLock<ClassCache>; NUM_SMALL_CLASSES],
    /// handle keeping the purge ticker alive; dropped with the descriptor
    ticker: Mutex<Option<Ticker>>,
}

// Slots hold plain addresses owned by this descriptor's arena; the spin lock
// serialises the owning thread against its purge timer.
unsafe impl Send for ThreadDescriptor {}
unsafe impl Sync for ThreadDescriptor {}

impl ThreadDescriptor {
    /// Create a descriptor assigned to `arena` and arm its purge ticker.
    ///
    /// The ticker holds the descriptor weakly and the arena array strongly,
    /// so dropping the owning registry stops the timer instead of leaking a
    /// cycle.
    pub fn spawn(arena: usize, arenas: &Arc<[Arena]>, period: Duration) -> Arc<ThreadDescriptor> {
        let descriptor = Arc::new(ThreadDescriptor {
            arena,
            classes: std::array::from_fn(|_| SpinLock::new(ClassCache::new())),
            ticker: Mutex::new(None),
        });
        let weak: Weak<ThreadDescriptor> = Arc::downgrade(&descriptor);
        let arenas = Arc::clone(arenas);
        let ticker = Ticker::spawn(period, move || {
            if let Some(descriptor) = weak.upgrade() {
                descriptor.purge(&arenas[descriptor.arena]);
            }
        });
        *descriptor.ticker.lock().unwrap() = Some(ticker);
        descriptor
    }

    /// Index of the arena this thread is assigned to.
    #[inline]
    pub fn arena(&self) -> usize {
        self.arena
    }

    /// Cache a freed chunk of class `class`, or hand it straight to `bin`
    /// when the cache is full.
    pub fn push_cache(&self, ptr: *mut u8, class: usize, bin: &Bin) {
        let mut cache = self.classes[class].lock();
        cache.decay = 1;
        if cache.top < THREAD_CACHE_SIZE {
            let top = cache.top;
            cache.slots[top] = ptr;
            cache.top += 1;
            trace!("cached chunk {:p} for class {}", ptr, class);
        } else {
            // flag -> bin is the one place the spin flag nests with a lock
            bin.give_back(ptr);
        }
    }

    /// Take the most recently cached chunk of class `class`, if any.
    pub fn pop_cache(&self, class: usize) -> Option<ptr::NonNull<u8>> {
        let mut cache = self.classes[class].lock();
        cache.decay = 1;
        if cache.top > 0 {
            cache.top -= 1;
            ptr::NonNull::new(cache.slots[cache.top])
        } else {
            None
        }
    }

    /// Timer tick: bleed the oldest entries of every class back to its bin.
    ///
    /// Discards `min(top, decay)` entries from the bottom of each stack
    /// (LIFO recency makes those the least recently used), then doubles the
    /// decay rate, capped at the cache capacity. Never allocates.
    pub fn purge(&self, arena: &Arena) {
        trace!("purge tick for a thread of arena {}", self.arena);
        for (class, lock) in self.classes.iter().enumerate() {
            let mut cache = lock.lock();
            if cache.top == 0 {
                continue;
            }
            let discards = cache.decay.min(cache.top);
            let bin = arena.bin(class);
            for i in 0..discards {
                bin.give_back(cache.slots[i]);
            }
            let top = cache.top;
            cache.slots.copy_within(discards..top, 0);
            cache.top -= discards;
            cache.decay = (cache.decay << 1).min(THREAD_CACHE_SIZE);
        }
    }

    /// Number of cached entries for `class`.
    #[cfg(test)]
    pub fn cached(&self, class: usize) -> usize {
        self.classes[class].lock().top
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn arena_setup() -> (Arc<[Arena]>, Arc<ThreadDescriptor>) {
        let arenas: Arc<[Arena]> = vec![Arena::new(0)].into();
        // an hour-long period keeps the timer out of deterministic tests
        let td = ThreadDescriptor::spawn(0, &arenas, Duration::from_secs(3600));
        (arenas, td)
    }

    #[test]
    fn push_pop_is_lifo() {
        let (arenas, td) = arena_setup();
        let bin = arenas[0].bin(2);
        let a = bin.allocate(arenas[0].pages()).unwrap().as_ptr();
        let b = bin.allocate(arenas[0].pages()).unwrap().as_ptr();
        td.push_cache(a, 2, bin);
        td.push_cache(b, 2, bin);
        assert_eq!(td.pop_cache(2).unwrap().as_ptr(), b);
        assert_eq!(td.pop_cache(2).unwrap().as_ptr(), a);
        assert!(td.pop_cache(2).is_none());
    }

    #[test]
    fn overflow_bypasses_cache() {
        let (arenas, td) = arena_setup();
        let class = 4;
        let bin = arenas[0].bin(class);
        let free_objects = |bin: &Bin| bin.free_runs().iter().map(|&(_, n)| n).sum::<usize>();
        let chunks: Vec<*mut u8> = (0..THREAD_CACHE_SIZE + 1)
            .map(|_| bin.allocate(arenas[0].pages()).unwrap().as_ptr())
            .collect();
        let in_bin = free_objects(bin);
        for &chunk in chunks.iter().take(THREAD_CACHE_SIZE) {
            td.push_cache(chunk, class, bin);
        }
        assert_eq!(td.cached(class), THREAD_CACHE_SIZE);
        assert_eq!(free_objects(bin), in_bin);
        // the seventeenth free must reach the bin immediately
        td.push_cache(chunks[THREAD_CACHE_SIZE], class, bin);
        assert_eq!(td.cached(class), THREAD_CACHE_SIZE);
        assert_eq!(free_objects(bin), in_bin + 1);
    }

    #[test]
    fn purge_drains_geometrically() {
        let (arenas, td) = arena_setup();
        let class = 6;
        let bin = arenas[0].bin(class);
        let chunks: Vec<*mut u8> = (0..THREAD_CACHE_SIZE)
            .map(|_| bin.allocate(arenas[0].pages()).unwrap().as_ptr())
            .collect();
        for &chunk in &chunks {
            td.push_cache(chunk, class, bin);
        }
        assert_eq!(td.cached(class), THREAD_CACHE_SIZE);

        // pushes left decay at 1: the drain doubles each tick, 1+2+4+8+16
        // covering any 16-entry cache in five ticks
        let mut tops = Vec::new();
        for _ in 0..5 {
            td.purge(&arenas[0]);
            tops.push(td.cached(class));
        }
        assert_eq!(tops, vec![15, 13, 9, 1, 0]);
    }

    #[test]
    fn purge_skips_idle_classes() {
        let (arenas, td) = arena_setup();
        td.purge(&arenas[0]);
        for class in 0..NUM_SMALL_CLASSES {
            assert_eq!(td.cached(class), 0);
        }
    }

    #[test]
    fn activity_resets_decay() {
        let (arenas, td) = arena_setup();
        let class = 6;
        let bin = arenas[0].bin(class);
        let chunks: Vec<*mut u8> = (0..THREAD_CACHE_SIZE)
            .map(|_| bin.allocate(arenas[0].pages()).unwrap().as_ptr())
            .collect();
        for &chunk in &chunks {
            td.push_cache(chunk, class, bin);
        }
        td.purge(&arenas[0]); // decay becomes 2
        td.purge(&arenas[0]); // decay becomes 4
        assert_eq!(td.cached(class), 13);
        // a pop snaps decay back to 1
        let popped = td.pop_cache(class).unwrap();
        td.push_cache(popped.as_ptr(), class, bin);
        td.purge(&arenas[0]);
        assert_eq!(td.cached(class), 12);
    }

    #[test]
    fn timer_empties_idle_cache() {
        let arenas: Arc<[Arena]> = vec![Arena::new(0)].into();
        let td = ThreadDescriptor::spawn(0, &arenas, Duration::from_millis(20));
        let class = 3;
        let bin = arenas[0].bin(class);
        let chunk = bin.allocate(arenas[0].pages()).unwrap().as_ptr();
        td.push_cache(chunk, class, bin);
        assert_eq!(td.cached(class), 1);
        thread::sleep(Duration::from_millis(300));
        assert_eq!(td.cached(class), 0);
    }
}
