//! `Selector` interning for the `OxideC` runtime.
//!
//! Every selector name maps to exactly one [`Selector`] token for the life of
//! the runtime, so selectors compare and hash by identity.
//!
//! # Architecture
//!
//! - Interned records live in the runtime arena and are never freed.
//! - Names from the preoptimized table are interned up front into a frozen
//!   map that is read without any lock.
//! - All other names go to one of 16 shards picked by `FxHash`. Each shard is
//!   a ranked read/write lock around a hash map: lookups take the shard's
//!   read lock, inserts take its write lock and re-check before allocating.
//!
//! # Thread Safety
//!
//! Any number of threads may intern concurrently; racing interns of the same
//! name return the same token.

// Shard and bucket indices are masked hash bits.
#![allow(clippy::cast_possible_truncation)]

use crate::runtime::lock::{LockRank, LockStats, RankedRwLock};
use fxhash::{FxHashMap, FxHasher};
use oxidex_mem::GlobalArena;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

/// Number of shards in the mutable table.
const NUM_SHARDS: usize = 16;

/// Mask selecting a shard from a hash.
const SHARD_MASK: usize = NUM_SHARDS - 1;

/// Interned selector stored in the runtime arena.
struct InternedSelector {
    name: &'static str,
    /// Precomputed `FxHash` of the name.
    hash: u64,
    /// Sequential id, in interning order.
    id: u32,
}

/// A unique method name.
///
/// `Selector` is a pointer to an interned record: copying is free, equality
/// is pointer equality, and hashing uses the precomputed hash.
#[derive(Clone, Copy)]
pub struct Selector(&'static InternedSelector);

impl Selector {
    /// Returns the selector's name.
    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Returns the precomputed hash of the name.
    #[inline]
    #[must_use]
    pub fn hash_value(self) -> u64 {
        self.0.hash
    }

    /// Returns the sequential id assigned at interning.
    #[inline]
    #[must_use]
    pub fn id(self) -> u32 {
        self.0.id
    }
}

impl PartialEq for Selector {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({})", self.name())
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Computes the `FxHash` of a selector name.
fn hash_name(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

/// The runtime's selector table.
pub struct SelectorTable {
    arena: &'static GlobalArena,
    /// Preoptimized names. Built before the runtime is shared and never
    /// written again.
    frozen: FxHashMap<&'static str, Selector>,
    shards: [RankedRwLock<FxHashMap<&'static str, Selector>>; NUM_SHARDS],
    next_id: AtomicU32,
    interned: AtomicUsize,
}

impl SelectorTable {
    /// Creates a table whose frozen part holds `preoptimized`.
    pub(crate) fn new<'n>(
        arena: &'static GlobalArena,
        stats: &'static LockStats,
        preoptimized: impl IntoIterator<Item = &'n str>,
    ) -> Self {
        let mut table = SelectorTable {
            arena,
            frozen: FxHashMap::default(),
            shards: std::array::from_fn(|_| {
                RankedRwLock::with_stats(LockRank::Selector, FxHashMap::default(), stats)
            }),
            next_id: AtomicU32::new(0),
            interned: AtomicUsize::new(0),
        };

        for name in preoptimized {
            if !table.frozen.contains_key(name) {
                let selector = table.allocate(name, hash_name(name));
                table.frozen.insert(selector.name(), selector);
            }
        }
        table
    }

    /// Returns the selector for `name`, interning it if necessary.
    ///
    /// # Example
    ///
    /// ```
    /// use oxidec::runtime::Runtime;
    ///
    /// let rt = Runtime::builder().build().unwrap();
    /// let a = rt.selectors().intern("initWithFrame:");
    /// let b = rt.selectors().intern(&String::from("initWithFrame:"));
    ///
    /// assert_eq!(a, b);
    /// assert_eq!(a.name(), "initWithFrame:");
    /// ```
    pub fn intern(&self, name: &str) -> Selector {
        if let Some(&selector) = self.frozen.get(name) {
            return selector;
        }

        let hash = hash_name(name);
        let shard = &self.shards[(hash as usize) & SHARD_MASK];

        if let Some(&selector) = shard.read().get(name) {
            return selector;
        }

        let mut map = shard.write();

        // Another thread may have inserted while we waited for the write lock.
        if let Some(&selector) = map.get(name) {
            return selector;
        }

        let selector = self.allocate(name, hash);
        map.insert(selector.name(), selector);
        selector
    }

    /// Returns the selector for `name` if it has been interned.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<Selector> {
        if let Some(&selector) = self.frozen.get(name) {
            return Some(selector);
        }

        let hash = hash_name(name);
        self.shards[(hash as usize) & SHARD_MASK]
            .read()
            .get(name)
            .copied()
    }

    /// Returns the selector for `name` only if it is preoptimized. Takes no
    /// lock.
    #[must_use]
    pub fn lookup_preoptimized(&self, name: &str) -> Option<Selector> {
        self.frozen.get(name).copied()
    }

    /// Number of distinct selectors, preoptimized ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.interned.load(Ordering::Relaxed)
    }

    /// Returns true if nothing has been interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate(&self, name: &str, hash: u64) -> Selector {
        let record = self.arena.alloc(InternedSelector {
            name: self.arena.alloc_str(name),
            hash,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        });
        self.interned.fetch_add(1, Ordering::Relaxed);
        Selector(record)
    }
}

impl fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorTable")
            .field("preoptimized", &self.frozen.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::lock::held_ranks;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    fn table(preoptimized: &[&str]) -> (SelectorTable, &'static LockStats) {
        let arena: &'static GlobalArena = Box::leak(Box::new(GlobalArena::new(8192)));
        let stats: &'static LockStats = Box::leak(Box::new(LockStats::new()));
        (
            SelectorTable::new(arena, stats, preoptimized.iter().copied()),
            stats,
        )
    }

    #[test]
    fn test_selector_interning() {
        let (table, _) = table(&[]);
        let sel1 = table.intern("test");
        let sel2 = table.intern("test");

        assert_eq!(sel1, sel2);
        assert_eq!(sel1.name(), "test");
        assert_eq!(sel1.hash_value(), sel2.hash_value());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_different_selectors() {
        let (table, _) = table(&[]);
        let sel1 = table.intern("foo");
        let sel2 = table.intern("bar");

        assert_ne!(sel1, sel2);
        assert_ne!(sel1.id(), sel2.id());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_lookup_does_not_insert() {
        let (table, _) = table(&[]);
        assert!(table.lookup("missing").is_none());
        assert!(table.is_empty());

        let sel = table.intern("present");
        assert_eq!(table.lookup("present"), Some(sel));
    }

    #[test]
    fn test_preoptimized_names_take_no_lock() {
        let (table, stats) = table(&["init", "dealloc", "init"]);
        assert_eq!(table.len(), 2);

        let before = stats.acquisitions(LockRank::Selector);
        let init = table.intern("init");
        assert_eq!(table.lookup_preoptimized("init"), Some(init));
        assert_eq!(table.lookup("dealloc").map(Selector::name), Some("dealloc"));
        assert_eq!(stats.acquisitions(LockRank::Selector), before);
        assert!(held_ranks().is_empty());

        table.intern("other");
        assert!(stats.acquisitions(LockRank::Selector) > before);
        assert!(table.lookup_preoptimized("other").is_none());
    }

    #[test]
    fn test_selectors_as_map_keys() {
        let (table, _) = table(&[]);
        let mut set = HashSet::new();
        set.insert(table.intern("a:"));
        set.insert(table.intern("b:"));
        set.insert(table.intern("a:"));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_concurrent_interning_yields_one_token() {
        let (table, _) = table(&[]);
        let table = Arc::new(table);
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..200)
                        .map(|i| table.intern(&format!("selector{i}:")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<Selector>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for result in &results[1..] {
            assert_eq!(result, &results[0]);
        }
        assert_eq!(table.len(), 200);
    }
}
