//! Objects and reference counting.
//!
//! An [`Object`] is the header every heap instance starts with: an atomic
//! isa word pointing at its class record and an atomic reference count.
//! Class records embed the same header, so a class is itself an object whose
//! isa is its metaclass.
//!
//! # Architecture
//!
//! - [`Object`]: the header. `isa()` is the "assume real" accessor: holding
//!   an `&Object` already proves the handle is not tagged.
//! - [`ObjectRef`]: owning handle. `Clone` retains, `Drop` releases, and the
//!   last release frees the object.
//!
//! # Thread Safety
//!
//! The isa word is only written twice in an object's life: once by
//! [`Object::init_identity`] before the object is shared (which takes
//! `&mut self` for exactly that reason), and by
//! [`Object::change_identity`], a CAS loop safe against concurrent readers.

use crate::runtime::class::{Class, ClassRecord};
use crate::runtime::identity::Receiver;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering, fence};

/// Object header: isa plus reference count.
#[repr(C)]
pub struct Object {
    isa: AtomicPtr<ClassRecord>,
    refcount: AtomicUsize,
}

impl Object {
    /// A header with no class yet. Only reachable through constructors that
    /// bind the isa before the object escapes.
    pub(crate) const fn unbound() -> Self {
        Object {
            isa: AtomicPtr::new(ptr::null_mut()),
            refcount: AtomicUsize::new(1),
        }
    }

    /// Sets the isa of an object that no other thread can see yet.
    ///
    /// `&mut self` makes "not yet published" a type-level guarantee.
    pub fn init_identity(&mut self, class: Class) {
        *self.isa.get_mut() = class.as_ptr();
    }

    /// Binds the isa of a class record's embedded header. The record is
    /// arena-allocated and thus only reachable by shared reference, but it is
    /// not published until the store lock that created it is released.
    pub(crate) fn bind_isa(&self, class: Class) {
        self.isa.store(class.as_ptr(), Ordering::Release);
    }

    /// Returns the object's class.
    #[must_use]
    pub fn isa(&self) -> Class {
        let ptr = self.isa.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "object used before init_identity");

        // SAFETY: every Object is created through init_identity or bind_isa
        // before it is shared, and the isa only ever points at class records
        // in the runtime arena, which are never freed.
        unsafe { Class::from_ptr(ptr) }
    }

    /// Atomically replaces the object's class and returns the previous one.
    ///
    /// If the previous class had instances with associated objects, the new
    /// class is flagged too. The flag is sticky: it is never cleared here.
    pub fn change_identity(&self, new: Class) -> Class {
        let mut current = self.isa.load(Ordering::Acquire);
        loop {
            match self.isa.compare_exchange_weak(
                current,
                new.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        // SAFETY: see isa().
        let old = unsafe { Class::from_ptr(current) };
        if old.instances_have_associated_objects() {
            new.set_instances_have_associated_objects();
        }
        old
    }

    /// Records that this object has associated objects. The storage itself
    /// lives outside the runtime core; the runtime only keeps the class flag.
    pub fn set_has_associated_objects(&self) {
        self.isa().set_instances_have_associated_objects();
    }

    /// Returns the current reference count.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Returns this object as a dispatch receiver.
    #[must_use]
    pub fn as_receiver(&self) -> Receiver<'_> {
        Receiver::Object(self)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("isa", &self.isa().name())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Owning, reference-counted handle to a heap [`Object`].
///
/// # Example
///
/// ```
/// use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
/// use oxidec::runtime::{ObjectRef, Runtime};
///
/// let rt = Runtime::builder().build().unwrap();
/// rt.load_image(ImageDescriptor::new("app").class(ClassDescriptor::root("Thing")))
///     .unwrap();
/// let class = rt.lookup_class("Thing").unwrap();
///
/// let a = ObjectRef::new(class);
/// let b = a.clone();
/// assert_eq!(a.refcount(), 2);
/// drop(b);
/// assert_eq!(a.refcount(), 1);
/// assert_eq!(a.isa(), class);
/// ```
pub struct ObjectRef {
    ptr: NonNull<Object>,
}

// SAFETY: the header is made of atomics and is freed only by the release that
// drops the count to zero, so the handle can move and be shared across threads.
unsafe impl Send for ObjectRef {}
unsafe impl Sync for ObjectRef {}

impl ObjectRef {
    /// Allocates a new instance of `class` with a reference count of one.
    #[must_use]
    pub fn new(class: Class) -> Self {
        let mut object = Box::new(Object::unbound());
        object.init_identity(class);

        ObjectRef {
            ptr: NonNull::from(Box::leak(object)),
        }
    }

    /// Returns true if both handles refer to the same object.
    #[must_use]
    pub fn ptr_eq(a: &ObjectRef, b: &ObjectRef) -> bool {
        a.ptr == b.ptr
    }
}

impl std::ops::Deref for ObjectRef {
    type Target = Object;

    fn deref(&self) -> &Object {
        // SAFETY: the object stays alive while this handle holds a reference.
        unsafe { self.ptr.as_ref() }
    }
}

impl Clone for ObjectRef {
    fn clone(&self) -> Self {
        let previous = self.refcount.fetch_add(1, Ordering::Relaxed);
        assert!(previous < usize::MAX / 2, "object reference count overflow");

        ObjectRef { ptr: self.ptr }
    }
}

impl Drop for ObjectRef {
    fn drop(&mut self) {
        if self.refcount.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        // Synchronize with every earlier release before freeing.
        fence(Ordering::Acquire);

        // SAFETY: this was the last reference, and the allocation came from
        // the Box leaked in ObjectRef::new.
        drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use crate::runtime::loader::{ClassDescriptor, ImageDescriptor};
    use std::sync::Arc;
    use std::thread;

    fn runtime_with(names: &[&str]) -> &'static Runtime {
        let rt = Runtime::builder().build().unwrap();
        let image = names
            .iter()
            .fold(ImageDescriptor::new("objects"), |image, name| {
                image.class(ClassDescriptor::root(*name))
            });
        rt.load_image(image).unwrap();
        rt
    }

    #[test]
    fn test_object_creation() {
        let rt = runtime_with(&["A"]);
        let class = rt.lookup_class("A").unwrap();

        let object = ObjectRef::new(class);
        assert_eq!(object.isa(), class);
        assert_eq!(object.refcount(), 1);
    }

    #[test]
    fn test_retain_release() {
        let rt = runtime_with(&["A"]);
        let object = ObjectRef::new(rt.lookup_class("A").unwrap());

        let copies: Vec<_> = (0..5).map(|_| object.clone()).collect();
        assert_eq!(object.refcount(), 6);
        assert!(ObjectRef::ptr_eq(&object, &copies[0]));

        drop(copies);
        assert_eq!(object.refcount(), 1);
    }

    #[test]
    fn test_concurrent_retain_release() {
        let rt = runtime_with(&["A"]);
        let object = Arc::new(ObjectRef::new(rt.lookup_class("A").unwrap()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let object = Arc::clone(&object);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let copy = (*object).clone();
                        drop(copy);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(object.refcount(), 1);
    }

    #[test]
    fn test_change_identity_returns_old_class() {
        let rt = runtime_with(&["A", "B"]);
        let a = rt.lookup_class("A").unwrap();
        let b = rt.lookup_class("B").unwrap();

        let object = ObjectRef::new(a);
        assert_eq!(object.change_identity(b), a);
        assert_eq!(object.isa(), b);
    }

    #[test]
    fn test_change_identity_propagates_associated_flag() {
        let rt = runtime_with(&["A", "B", "C"]);
        let a = rt.lookup_class("A").unwrap();
        let b = rt.lookup_class("B").unwrap();
        let c = rt.lookup_class("C").unwrap();

        let object = ObjectRef::new(a);
        object.set_has_associated_objects();
        assert!(a.instances_have_associated_objects());
        assert!(!b.instances_have_associated_objects());

        object.change_identity(b);
        assert!(b.instances_have_associated_objects());
        // Sticky on the old class.
        assert!(a.instances_have_associated_objects());

        // Never set when the old class lacked it.
        let plain = ObjectRef::new(c);
        let d = rt.lookup_class("A").unwrap();
        assert_eq!(plain.change_identity(d), c);
        assert!(!c.instances_have_associated_objects());
    }

    #[test]
    fn test_concurrent_change_identity() {
        let rt = runtime_with(&["A", "B"]);
        let a = rt.lookup_class("A").unwrap();
        let b = rt.lookup_class("B").unwrap();
        let object = Arc::new(ObjectRef::new(a));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let object = Arc::clone(&object);
                thread::spawn(move || {
                    let target = if i % 2 == 0 { a } else { b };
                    for _ in 0..500 {
                        let old = object.change_identity(target);
                        assert!(old == a || old == b);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        let isa = object.isa();
        assert!(isa == a || isa == b);
    }
}
