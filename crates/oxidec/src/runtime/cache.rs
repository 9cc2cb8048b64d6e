//! Per-class method caches.
//!
//! Each class memoizes successful lookups in a `MethodCache`: an
//! open-addressed table from selector to [`CacheEntry`].
//!
//! # Architecture
//!
//! - The current table sits behind an `ArcSwap`. Readers load it without
//!   locking and probe it; a table is never mutated in place except by
//!   filling an empty slot.
//! - Slots are write-once (`OnceLock`), so a reader sees either an empty slot
//!   or a complete entry.
//! - Growth is copy-on-grow: the writer builds a table twice the size,
//!   reinserts every entry and publishes it. Readers still probing the old
//!   table keep it alive through their guard; it is freed when the last one
//!   lets go.
//! - A flush publishes a fresh empty table of the same capacity.
//!
//! # Thread Safety
//!
//! Every write needs a `&mut CacheUpdateToken`. The runtime owns a single
//! token inside its cache-update lock, so holding the token *is* holding the
//! lock, and all writers are serialized. Readers never block.

use crate::runtime::class::Class;
use crate::runtime::dispatch::Imp;
use crate::runtime::selector::Selector;
use arc_swap::ArcSwap;
use log::debug;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// A resolved method remembered by a class cache.
#[derive(Clone, Copy)]
pub struct CacheEntry {
    /// The selector looked up.
    pub selector: Selector,
    /// The implementation found.
    pub imp: Imp,
    /// The class whose method list supplied `imp`. May be an ancestor of the
    /// class that owns the cache.
    pub owner: Class,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("selector", &self.selector.name())
            .field("owner", &self.owner.name())
            .finish_non_exhaustive()
    }
}

/// Write permission for method caches.
///
/// Only the runtime creates one, and it lives inside the cache-update lock.
pub struct CacheUpdateToken {
    _private: (),
}

impl CacheUpdateToken {
    pub(crate) const fn new() -> Self {
        CacheUpdateToken { _private: () }
    }
}

struct CacheTable {
    slots: Box<[OnceLock<CacheEntry>]>,
    mask: usize,
    occupied: AtomicUsize,
}

impl CacheTable {
    fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        CacheTable {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            mask: capacity - 1,
            occupied: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn start(&self, selector: Selector) -> usize {
        (selector.hash_value() as usize) & self.mask
    }

    #[inline]
    fn probe(&self, selector: Selector) -> Option<CacheEntry> {
        let mut index = self.start(selector);
        for _ in 0..self.slots.len() {
            match self.slots[index].get() {
                None => return None,
                Some(entry) if entry.selector == selector => return Some(*entry),
                Some(_) => index = (index + 1) & self.mask,
            }
        }
        None
    }

    /// Writes `entry` into the first empty slot of its probe sequence.
    /// Callers keep occupancy under 3/4, so an empty slot always exists.
    fn insert(&self, entry: CacheEntry) {
        let mut index = self.start(entry.selector);
        for _ in 0..self.slots.len() {
            let slot = &self.slots[index];
            if slot.get().is_none() && slot.set(entry).is_ok() {
                self.occupied.fetch_add(1, Ordering::Relaxed);
                return;
            }
            index = (index + 1) & self.mask;
        }
    }

    fn entries(&self) -> impl Iterator<Item = CacheEntry> + '_ {
        self.slots.iter().filter_map(|slot| slot.get().copied())
    }

    /// True if one more entry would push occupancy over 3/4.
    fn needs_growth(&self) -> bool {
        (self.occupied.load(Ordering::Relaxed) + 1) * 4 > self.capacity() * 3
    }
}

/// A class's selector to implementation cache.
pub struct MethodCache {
    table: ArcSwap<CacheTable>,
    flushes: AtomicU64,
    generation: AtomicU64,
}

impl MethodCache {
    /// Creates an empty cache. `capacity` must be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        MethodCache {
            table: ArcSwap::from_pointee(CacheTable::with_capacity(capacity)),
            flushes: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    /// Looks `selector` up without taking any lock.
    #[inline]
    #[must_use]
    pub fn probe(&self, selector: Selector) -> Option<CacheEntry> {
        self.table.load().probe(selector)
    }

    /// Records `entry`, growing the table if it is more than 3/4 full.
    ///
    /// A selector that is already cached is left alone: the structural lock
    /// held by every filler guarantees both fills resolved the same method.
    pub(crate) fn fill(&self, _token: &mut CacheUpdateToken, entry: CacheEntry) {
        let table = self.table.load_full();
        if table.probe(entry.selector).is_some() {
            return;
        }

        if !table.needs_growth() {
            table.insert(entry);
            return;
        }

        let grown = CacheTable::with_capacity(table.capacity() * 2);
        for old in table.entries() {
            grown.insert(old);
        }
        grown.insert(entry);

        debug!(
            "method cache for {} grew to {} slots",
            entry.owner.name(),
            grown.capacity()
        );
        self.table.store(Arc::new(grown));
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Drops every entry by publishing an empty table of the same capacity.
    pub(crate) fn flush(&self, _token: &mut CacheUpdateToken) {
        let capacity = self.table.load().capacity();
        self.table.store(Arc::new(CacheTable::with_capacity(capacity)));
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Number of slots in the current table.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.table.load().capacity()
    }

    /// Number of filled slots in the current table.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.table.load().occupied.load(Ordering::Relaxed)
    }

    /// Number of flushes since the cache was created.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Incremented every time a new table is published (growth or flush).
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of the current entries, in slot order.
    #[must_use]
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.table.load().entries().collect()
    }
}

impl fmt::Debug for MethodCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodCache")
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .field("generation", &self.generation())
            .finish()
    }
}
