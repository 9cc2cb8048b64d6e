//! Class records and the `Class` handle.
//!
//! A class is an arena-allocated [`ClassRecord`] that lives as long as its
//! runtime. [`Class`] is a `Copy` handle to one; two handles are equal only
//! if they name the same record.
//!
//! # Architecture
//!
//! The record holds what dispatch reads without the structural lock:
//!
//! - the embedded [`Object`] header (a class's isa is its metaclass),
//! - name, id, owning image and metaclass flag (immutable),
//! - realization state and flags (atomics),
//! - the method cache and the initialization gate.
//!
//! Everything else about a class (superclass link, method lists,
//! categories, subclasses, protocols, hooks) lives in the class store and is
//! only reachable through the structural lock.
//!
//! Every class has a metaclass holding its class methods. A metaclass's
//! superclass is the superclass's metaclass; the root metaclass's superclass
//! is the root class itself.

use crate::runtime::Receiver;
use crate::runtime::cache::MethodCache;
use crate::runtime::dispatch::Imp;
use crate::runtime::loader::ImageId;
use crate::runtime::lock::{InitGate, LockStats};
use crate::runtime::object::Object;
use crate::runtime::selector::Selector;
use oxidex_mem::GlobalArena;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ptr;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};

/// Instances (or a previous identity of them) have associated objects.
const FLAG_HAS_ASSOCIATED: u32 = 1 << 0;
/// The class can no longer be dispatched to.
const FLAG_UNUSABLE: u32 = 1 << 1;
/// A realization attempt has already failed once.
const FLAG_REALIZE_FAILED: u32 = 1 << 2;

/// Lifecycle of a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ClassState {
    /// Loaded from a descriptor, not yet linked.
    Unrealized = 0,
    /// Superclass linked, methods flattened, layout final.
    Realized = 1,
    /// Its initializer is running.
    Initializing = 2,
    /// Its initializer has finished (or it has none).
    Initialized = 3,
}

impl ClassState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ClassState::Unrealized,
            1 => ClassState::Realized,
            2 => ClassState::Initializing,
            _ => ClassState::Initialized,
        }
    }
}

/// A method: selector, implementation and type encoding.
///
/// The type encoding is opaque to the runtime core.
#[derive(Clone, Copy)]
pub struct Method {
    /// The method's selector.
    pub selector: Selector,
    /// The implementation.
    pub imp: Imp,
    /// Type encoding string, e.g. `"v@:"`.
    pub types: &'static str,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector.name())
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

/// Arena record for a class or metaclass.
#[repr(C)]
pub struct ClassRecord {
    /// Must stay first: a class pointer is also an object pointer.
    object: Object,
    name: &'static str,
    id: u32,
    /// The runtime that allocated this record.
    runtime: u32,
    is_meta: bool,
    image: ImageId,
    state: AtomicU8,
    flags: AtomicU32,
    instance_size: AtomicUsize,
    /// For a metaclass, the class it describes.
    instance_class: OnceLock<Class>,
    cache: MethodCache,
    gate: InitGate,
}

/// Handle to a class record.
#[derive(Clone, Copy)]
pub struct Class(&'static ClassRecord);

/// Everything needed to allocate a class/metaclass pair.
pub(crate) struct ClassPairSpec<'a> {
    pub name: &'a str,
    pub class_id: u32,
    pub meta_id: u32,
    pub runtime: u32,
    pub image: ImageId,
    pub cache_capacity: usize,
}

impl Class {
    /// Allocates a class and its metaclass in `arena`.
    ///
    /// The class's isa is bound to the metaclass. The metaclass's isa points
    /// at itself until realization binds it to the root metaclass.
    pub(crate) fn alloc_pair(
        arena: &'static GlobalArena,
        stats: &'static LockStats,
        spec: &ClassPairSpec<'_>,
    ) -> Class {
        let name = arena.alloc_str(spec.name);
        let record = |id, is_meta| ClassRecord {
            object: Object::unbound(),
            name,
            id,
            runtime: spec.runtime,
            is_meta,
            image: spec.image,
            state: AtomicU8::new(ClassState::Unrealized as u8),
            flags: AtomicU32::new(0),
            instance_size: AtomicUsize::new(0),
            instance_class: OnceLock::new(),
            cache: MethodCache::new(spec.cache_capacity),
            gate: InitGate::new(stats),
        };

        let meta = Class(arena.alloc(record(spec.meta_id, true)));
        let class = Class(arena.alloc(record(spec.class_id, false)));

        meta.0.object.bind_isa(meta);
        class.0.object.bind_isa(meta);
        let _ = meta.0.instance_class.set(class);
        class
    }

    /// # Safety
    ///
    /// `ptr` must point at a `ClassRecord` allocated by [`Class::alloc_pair`]
    /// in an arena that is never dropped.
    pub(crate) unsafe fn from_ptr(ptr: *const ClassRecord) -> Class {
        // SAFETY: guaranteed by the caller.
        Class(unsafe { &*ptr })
    }

    pub(crate) fn as_ptr(self) -> *mut ClassRecord {
        ptr::from_ref(self.0).cast_mut()
    }

    /// The class name. A metaclass shares its class's name.
    #[inline]
    #[must_use]
    pub fn name(self) -> &'static str {
        self.0.name
    }

    /// Index of this record in the class store.
    #[inline]
    pub(crate) fn id(self) -> usize {
        self.0.id as usize
    }

    /// Id of the runtime whose store holds this class.
    #[inline]
    pub(crate) fn runtime_id(self) -> u32 {
        self.0.runtime
    }

    /// Returns true for metaclasses.
    #[inline]
    #[must_use]
    pub fn is_metaclass(self) -> bool {
        self.0.is_meta
    }

    /// The class's object header.
    #[must_use]
    pub fn as_object(self) -> &'static Object {
        &self.0.object
    }

    /// The class as a message receiver (messages go to its metaclass).
    #[must_use]
    pub fn as_receiver(self) -> Receiver<'static> {
        Receiver::Class(self)
    }

    /// The isa of the class object: the metaclass for a class, the root
    /// metaclass for a realized metaclass.
    #[must_use]
    pub fn metaclass(self) -> Class {
        self.0.object.isa()
    }

    /// The class whose instances this class describes: the class itself, or
    /// for a metaclass, the class it is the metaclass of.
    #[must_use]
    pub fn instance_class(self) -> Class {
        self.0.instance_class.get().copied().unwrap_or(self)
    }

    /// Image the class was loaded from.
    #[must_use]
    pub fn image(self) -> ImageId {
        self.0.image
    }

    /// Current lifecycle state.
    #[inline]
    #[must_use]
    pub fn state(self) -> ClassState {
        ClassState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(self, state: ClassState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    /// Returns true once the class has been realized.
    #[must_use]
    pub fn is_realized(self) -> bool {
        self.state() >= ClassState::Realized
    }

    /// Returns true once the class's initializer has finished.
    #[inline]
    #[must_use]
    pub fn is_initialized(self) -> bool {
        self.state() == ClassState::Initialized
    }

    /// Returns false for unloaded classes, inert duplicates and classes that
    /// failed to realize twice.
    #[inline]
    #[must_use]
    pub fn is_usable(self) -> bool {
        self.0.flags.load(Ordering::Acquire) & FLAG_UNUSABLE == 0
    }

    pub(crate) fn mark_unusable(self) {
        self.0.flags.fetch_or(FLAG_UNUSABLE, Ordering::AcqRel);
    }

    /// Records a failed realization; returns true if one had already failed.
    pub(crate) fn note_realize_failure(self) -> bool {
        self.0.flags.fetch_or(FLAG_REALIZE_FAILED, Ordering::AcqRel) & FLAG_REALIZE_FAILED != 0
    }

    /// Returns true if instances of this class may have associated objects.
    #[must_use]
    pub fn instances_have_associated_objects(self) -> bool {
        self.0.flags.load(Ordering::Acquire) & FLAG_HAS_ASSOCIATED != 0
    }

    /// Sets the sticky associated-objects flag.
    pub fn set_instances_have_associated_objects(self) {
        self.0.flags.fetch_or(FLAG_HAS_ASSOCIATED, Ordering::AcqRel);
    }

    /// Instance size in bytes, header included. Zero until realized.
    #[must_use]
    pub fn instance_size(self) -> usize {
        self.0.instance_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_instance_size(self, size: usize) {
        self.0.instance_size.store(size, Ordering::Release);
    }

    /// The class's method cache.
    #[inline]
    #[must_use]
    pub fn cache(self) -> &'static MethodCache {
        &self.0.cache
    }

    pub(crate) fn gate(self) -> &'static InitGate {
        &self.0.gate
    }
}

impl PartialEq for Class {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        ptr::eq(self.0, other.0)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        ptr::hash(self.0, state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metaclass() {
            write!(f, "Class(meta {})", self.name())
        } else {
            write!(f, "Class({})", self.name())
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
