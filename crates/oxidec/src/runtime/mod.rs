//! `OxideC` runtime core.
//!
//! This module provides the message-dispatch runtime:
//!
//! - [`identity`]: receivers, tagged pointers and the tagged class table
//! - [`object`]: object headers with an atomic isa, reference-counted handles
//! - [`selector`]: selector interning
//! - [`class`]: class records and metaclasses
//! - [`loader`]: image descriptors and batch loading
//! - [`cache`]: per-class lock-free method caches
//! - [`dispatch`]: the lookup state machine
//! - [`initialize`]: one-time class initialization
//! - [`lock`]: ranked locks and lock-order checking
//! - [`introspection`]: read-only queries
//!
//! # Architecture
//!
//! A [`Runtime`] owns everything: an arena for metadata that lives as long as
//! the runtime, the selector table, the class store behind the structural
//! lock, and the cache-update lock. Runtimes are leaked on construction, so
//! handles into them (`Class`, `Selector`, `Protocol`) are `&'static`.
//!
//! Locks are always taken in rank order:
//!
//! ```text
//! init gate < structural < selector shard < cache update
//! ```
//!
//! # Example
//!
//! ```rust
//! use oxidec::runtime::identity::Receiver;
//! use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
//! use oxidec::runtime::{ObjectRef, Runtime, Selector};
//!
//! fn greet(_: Receiver<'_>, _: Selector, args: &[usize]) -> usize {
//!     args[0] * 2
//! }
//!
//! let rt = Runtime::builder().build().unwrap();
//! rt.load_image(
//!     ImageDescriptor::new("app").class(ClassDescriptor::root("Greeter").method("greet:", greet)),
//! )
//! .unwrap();
//!
//! let greeter = ObjectRef::new(rt.lookup_class("Greeter").unwrap());
//! assert_eq!(rt.send(greeter.as_receiver(), rt.selector("greet:"), &[21]), 42);
//! ```

pub mod cache;
pub mod class;
pub mod dispatch;
pub mod identity;
pub mod initialize;
pub mod introspection;
pub mod loader;
pub mod lock;
pub mod object;
pub mod preopt;
pub mod protocol;
pub mod selector;
mod store;

pub use cache::{CacheEntry, MethodCache};
pub use class::{Class, ClassState, Method};
pub use dispatch::{
    DispatchState, EntryKind, EntryPoint, Imp, LookupMode, MethodResolver, Resolution,
};
pub use identity::{Receiver, TaggedPointer};
pub use initialize::Initializer;
pub use loader::{ImageId, ImageReport, IvarLayoutProvider, SlidingLayout};
pub use lock::{LockRank, LockStats};
pub use object::{Object, ObjectRef};
pub use preopt::PreoptimizedTable;
pub use protocol::Protocol;
pub use selector::{Selector, SelectorTable};

use crate::config::RuntimeOptions;
use crate::error::{Error, Result};
use cache::CacheUpdateToken;
use fxhash::FxHashMap;
use identity::TaggedClassTable;
use lock::{RankedMutex, RankedRwLock};
use oxidex_mem::GlobalArena;
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use store::StoreData;

/// Chunk size of a runtime's metadata arena.
const ARENA_CHUNK_SIZE: usize = 64 * 1024;

/// A message-dispatch runtime.
///
/// Built with [`Runtime::builder`] (or [`Runtime::global`]) and never
/// dropped.
pub struct Runtime {
    /// Stamped into every class this runtime allocates.
    id: u32,
    options: RuntimeOptions,
    arena: &'static GlobalArena,
    lock_stats: &'static LockStats,
    selectors: SelectorTable,
    store: RankedRwLock<StoreData>,
    /// Holding the token is holding the cache-update lock.
    cache_lock: RankedMutex<CacheUpdateToken>,
    tagged: TaggedClassTable,
    /// Preoptimized classes by name; written once during construction.
    preopt_classes: OnceLock<FxHashMap<&'static str, Class>>,
    forward_handler: Imp,
    layout: Box<dyn IvarLayoutProvider>,
}

static GLOBAL: OnceLock<&'static Runtime> = OnceLock::new();

static NEXT_RUNTIME_ID: AtomicU32 = AtomicU32::new(1);

impl Runtime {
    /// Starts configuring a new runtime.
    #[must_use]
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// The process-wide runtime, configured from the environment on first
    /// use.
    pub fn global() -> &'static Runtime {
        GLOBAL.get_or_init(|| {
            RuntimeBuilder::new()
                .options(RuntimeOptions::from_env())
                .assemble()
        })
    }

    /// The options the runtime was built with.
    #[must_use]
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Lock acquisition counters for this runtime's locks.
    #[must_use]
    pub fn lock_stats(&self) -> &'static LockStats {
        self.lock_stats
    }

    /// The metadata arena.
    #[must_use]
    pub fn arena(&self) -> &'static GlobalArena {
        self.arena
    }

    /// Returns true if `class` was loaded into this runtime.
    ///
    /// Classes of other runtimes are never looked up here: dispatch to
    /// their instances forwards and queries about them come back empty.
    #[inline]
    #[must_use]
    pub fn owns(&self, class: Class) -> bool {
        class.runtime_id() == self.id
    }

    /// Rejects classes of other runtimes.
    pub(crate) fn check_owned(&self, class: Class) -> Result<()> {
        if self.owns(class) {
            Ok(())
        } else {
            Err(Error::ForeignClass {
                class: class.name().to_string(),
            })
        }
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("options", &self.options)
            .field("selectors", &self.selectors)
            .field("tagged", &self.tagged)
            .finish_non_exhaustive()
    }
}

/// Configures and builds a [`Runtime`].
pub struct RuntimeBuilder {
    options: RuntimeOptions,
    preoptimized: PreoptimizedTable,
    forward_handler: Imp,
    layout: Box<dyn IvarLayoutProvider>,
}

impl RuntimeBuilder {
    fn new() -> Self {
        RuntimeBuilder {
            options: RuntimeOptions::default(),
            preoptimized: PreoptimizedTable::default(),
            forward_handler: dispatch::unrecognized_selector,
            layout: Box::new(SlidingLayout),
        }
    }

    /// Sets diagnostic switches and tuning values.
    #[must_use]
    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    /// Installs selectors and classes known ahead of time.
    #[must_use]
    pub fn preoptimized(mut self, table: PreoptimizedTable) -> Self {
        self.preoptimized = table;
        self
    }

    /// Sets the implementation returned when no method is found.
    #[must_use]
    pub fn forward_handler(mut self, handler: Imp) -> Self {
        self.forward_handler = handler;
        self
    }

    /// Sets the collaborator that lays out instance variables.
    #[must_use]
    pub fn layout_provider(mut self, provider: impl IvarLayoutProvider + 'static) -> Self {
        self.layout = Box::new(provider);
        self
    }

    /// Builds the runtime and installs the preoptimized classes.
    ///
    /// # Errors
    ///
    /// A loading or realization error from the preoptimized table.
    pub fn build(self) -> Result<&'static Runtime> {
        let preoptimized = self.preoptimized.clone();
        let runtime = self.assemble();
        runtime.install_preoptimized(&preoptimized)?;
        Ok(runtime)
    }

    /// Allocates the runtime with its frozen selectors, without any class.
    fn assemble(self) -> &'static Runtime {
        let arena: &'static GlobalArena = Box::leak(Box::new(GlobalArena::new(ARENA_CHUNK_SIZE)));
        let lock_stats: &'static LockStats = Box::leak(Box::new(LockStats::new()));

        self.options.log_enabled();

        let runtime = Runtime {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            selectors: SelectorTable::new(arena, lock_stats, self.preoptimized.selector_names()),
            store: RankedRwLock::with_stats(LockRank::Structural, StoreData::new(), lock_stats),
            cache_lock: RankedMutex::with_stats(
                LockRank::CacheUpdate,
                CacheUpdateToken::new(),
                lock_stats,
            ),
            tagged: TaggedClassTable::new(),
            preopt_classes: OnceLock::new(),
            forward_handler: self.forward_handler,
            layout: self.layout,
            options: self.options,
            arena,
            lock_stats,
        };
        Box::leak(Box::new(runtime))
    }
}

impl fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeBuilder")
            .field("options", &self.options)
            .field("preoptimized", &self.preoptimized)
            .finish_non_exhaustive()
    }
}
