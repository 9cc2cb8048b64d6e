//! Lock domain manager.
//!
//! Every runtime lock has a [`LockRank`]. A thread may only acquire a lock
//! whose rank is strictly greater than every rank it already holds, which
//! makes the acquisition order a total order and rules out lock-order
//! deadlocks. The ranks are:
//!
//! | rank | lock | held for |
//! |---|---|---|
//! | `InitGate` | per-class initialization gate | the state check around an initializer |
//! | `Structural` | class store read/write lock | hierarchy scans (shared), mutations (exclusive) |
//! | `Selector` | selector table shards | interning a new name |
//! | `CacheUpdate` | method cache writer lock | one cache fill or flush |
//!
//! No runtime lock may be held while user code runs (class initializers,
//! resolver hooks). [`assert_no_locks_held`] checks this at every such call.
//!
//! # Thread Safety
//!
//! Held ranks are tracked in a thread-local stack, so checks cost no shared
//! memory traffic. Violations are programming errors: they are logged with
//! `error!` and then panic.

use log::error;
use parking_lot::{
    Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Position of a lock in the global acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LockRank {
    /// Per-class initialization gate.
    InitGate = 0,
    /// The class store's structural lock.
    Structural = 1,
    /// Selector table shard locks.
    Selector = 2,
    /// The method cache writer lock.
    CacheUpdate = 3,
}

impl LockRank {
    const COUNT: usize = 4;

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for LockRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LockRank::InitGate => "init-gate",
            LockRank::Structural => "structural",
            LockRank::Selector => "selector",
            LockRank::CacheUpdate => "cache-update",
        };
        f.write_str(name)
    }
}

thread_local! {
    static HELD: RefCell<Vec<LockRank>> = const { RefCell::new(Vec::new()) };
}

/// Returns the ranks currently held by this thread, in acquisition order.
#[must_use]
pub fn held_ranks() -> Vec<LockRank> {
    HELD.with(|held| held.borrow().clone())
}

/// Panics if this thread holds any runtime lock.
///
/// Called before the runtime hands control to user code. `context` names the
/// call being guarded.
///
/// # Panics
///
/// Panics (after logging) if any ranked lock is held.
pub fn assert_no_locks_held(context: &str) {
    let held = held_ranks();
    if !held.is_empty() {
        error!("entering {context} while holding runtime locks {held:?}");
        panic!("lock order violation: {context} entered with locks held");
    }
}

/// Acquisition counters, one per rank.
///
/// A runtime shares one `LockStats` between all of its locks; tests read it
/// to check which paths touch which locks.
#[derive(Debug, Default)]
pub struct LockStats {
    acquisitions: [AtomicU64; LockRank::COUNT],
}

impl LockStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many times locks of `rank` have been acquired.
    #[must_use]
    pub fn acquisitions(&self, rank: LockRank) -> u64 {
        self.acquisitions[rank.index()].load(Ordering::Relaxed)
    }

    fn record(&self, rank: LockRank) {
        self.acquisitions[rank.index()].fetch_add(1, Ordering::Relaxed);
    }
}

/// Proof that this thread holds a lock of some rank. Popped on drop.
struct HeldRank {
    rank: LockRank,
    // Rank bookkeeping is thread-local, so the token must stay on this thread.
    _not_send: PhantomData<*const ()>,
}

impl HeldRank {
    fn enter(rank: LockRank, stats: Option<&LockStats>) -> Self {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(&highest) = held.iter().max()
                && highest >= rank
            {
                drop(held);
                error!("acquiring {rank} lock while holding {highest} lock");
                panic!("lock order violation: {rank} after {highest}");
            }
            held.push(rank);
        });

        if let Some(stats) = stats {
            stats.record(rank);
        }

        HeldRank {
            rank,
            _not_send: PhantomData,
        }
    }
}

impl Drop for HeldRank {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|&r| r == self.rank) {
                held.remove(pos);
            }
        });
    }
}

/// A `parking_lot` read/write lock with a rank.
pub struct RankedRwLock<T> {
    rank: LockRank,
    stats: Option<&'static LockStats>,
    inner: RwLock<T>,
}

impl<T> RankedRwLock<T> {
    /// Creates a lock that is not counted in any [`LockStats`].
    pub fn new(rank: LockRank, value: T) -> Self {
        RankedRwLock {
            rank,
            stats: None,
            inner: RwLock::new(value),
        }
    }

    /// Creates a lock whose acquisitions are counted in `stats`.
    pub fn with_stats(
        rank: LockRank,
        value: T,
        stats: &'static LockStats,
    ) -> Self {
        RankedRwLock {
            rank,
            stats: Some(stats),
            inner: RwLock::new(value),
        }
    }

    /// Acquires shared access.
    ///
    /// # Panics
    ///
    /// Panics if the thread holds a lock of equal or higher rank.
    pub fn read(&self) -> RankedReadGuard<'_, T> {
        let held = HeldRank::enter(self.rank, self.stats);
        RankedReadGuard {
            guard: self.inner.read(),
            _held: held,
        }
    }

    /// Acquires exclusive access.
    ///
    /// # Panics
    ///
    /// Panics if the thread holds a lock of equal or higher rank.
    pub fn write(&self) -> RankedWriteGuard<'_, T> {
        let held = HeldRank::enter(self.rank, self.stats);
        RankedWriteGuard {
            guard: self.inner.write(),
            _held: held,
        }
    }

    /// Returns the lock's rank.
    pub const fn rank(&self) -> LockRank {
        self.rank
    }
}

impl<T> fmt::Debug for RankedRwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedRwLock").field("rank", &self.rank).finish_non_exhaustive()
    }
}

/// Shared guard for a [`RankedRwLock`].
pub struct RankedReadGuard<'a, T> {
    // Field order: the lock is released before the rank is popped.
    guard: RwLockReadGuard<'a, T>,
    _held: HeldRank,
}

impl<T> Deref for RankedReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

/// Exclusive guard for a [`RankedRwLock`].
pub struct RankedWriteGuard<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    _held: HeldRank,
}

impl<T> Deref for RankedWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// A `parking_lot` mutex with a rank.
pub struct RankedMutex<T> {
    rank: LockRank,
    stats: Option<&'static LockStats>,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    /// Creates a mutex that is not counted in any [`LockStats`].
    pub fn new(rank: LockRank, value: T) -> Self {
        RankedMutex {
            rank,
            stats: None,
            inner: Mutex::new(value),
        }
    }

    /// Creates a mutex whose acquisitions are counted in `stats`.
    pub fn with_stats(
        rank: LockRank,
        value: T,
        stats: &'static LockStats,
    ) -> Self {
        RankedMutex {
            rank,
            stats: Some(stats),
            inner: Mutex::new(value),
        }
    }

    /// Acquires the mutex.
    ///
    /// # Panics
    ///
    /// Panics if the thread holds a lock of equal or higher rank.
    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        let held = HeldRank::enter(self.rank, self.stats);
        RankedMutexGuard {
            guard: self.inner.lock(),
            _held: held,
        }
    }
}

impl<T> fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RankedMutex").field("rank", &self.rank).finish_non_exhaustive()
    }
}

/// Guard for a [`RankedMutex`].
pub struct RankedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _held: HeldRank,
}

impl<T> RankedMutexGuard<'_, T> {
    /// Blocks on `condvar`, releasing the mutex while parked.
    ///
    /// The rank stays recorded while waiting: the thread cannot acquire
    /// anything else until it wakes.
    pub fn wait(&mut self, condvar: &Condvar) {
        condvar.wait(&mut self.guard);
    }
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

/// Per-class initialization gate: a ranked mutex plus a condition variable
/// that waiters park on until the class finishes initializing.
#[derive(Debug)]
pub struct InitGate {
    lock: RankedMutex<()>,
    condvar: Condvar,
}

impl InitGate {
    /// Creates a gate counted in `stats`.
    pub fn new(stats: &'static LockStats) -> Self {
        InitGate {
            lock: RankedMutex::with_stats(LockRank::InitGate, (), stats),
            condvar: Condvar::new(),
        }
    }

    /// Acquires the gate.
    pub fn lock(&self) -> RankedMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Parks until [`notify_all`](Self::notify_all) is called.
    pub fn wait(&self, guard: &mut RankedMutexGuard<'_, ()>) {
        guard.wait(&self.condvar);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.condvar.notify_all();
    }
}
