//! Message dispatch: (receiver, selector) to entry point.
//!
//! # Architecture
//!
//! A lookup moves through a small state machine:
//!
//! ```text
//! start -> CacheHit                                  (done)
//! start -> CacheMiss -> HierarchyScan -> Found       (cache filled)
//!                                     -> ResolverInvoked -> HierarchyScan
//!                                     -> Forward     (never cached)
//! ```
//!
//! - The cache probe takes no lock at all.
//! - The hierarchy scan runs under the structural lock held shared; a hit is
//!   written to the receiver class's cache under the cache-update lock
//!   before the structural lock is released, so a concurrent mutation
//!   cannot slip in between the scan and the fill.
//! - The resolver hook runs at most once per (receiver class, selector),
//!   with no runtime lock held. The scan is then repeated once.
//!
//! Not finding a method is not an error: it produces the forwarding entry
//! (or `None` from [`Runtime::dispatch_or_nil`]).
//!
//! # Thread Safety
//!
//! Dispatch may run on any number of threads concurrently with class
//! loading and method mutation. The runtime never calls the entry point it
//! returns; [`Runtime::send`] does, after every lock has been released.

use crate::runtime::Runtime;
use crate::runtime::cache::CacheEntry;
use crate::runtime::class::{Class, ClassState};
use crate::runtime::identity::Receiver;
use crate::runtime::lock::assert_no_locks_held;
use crate::runtime::selector::Selector;
use log::{debug, error, info, trace};
use std::fmt;

/// A method implementation.
///
/// Receives the receiver, the selector it was invoked for and the message
/// arguments as machine words.
pub type Imp = fn(Receiver<'_>, Selector, &[usize]) -> usize;

/// What an [`EntryPoint`] leads to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A method found in the receiver's class hierarchy.
    Method,
    /// The forwarding handler.
    Forwarding,
}

/// A callable result of dispatch.
#[derive(Clone, Copy)]
pub struct EntryPoint {
    /// The implementation to call.
    pub imp: Imp,
    /// The class that supplied the method; `None` for forwarding.
    pub owner: Option<Class>,
    /// Method or forwarding.
    pub kind: EntryKind,
}

impl EntryPoint {
    fn method(imp: Imp, owner: Class) -> Self {
        EntryPoint {
            imp,
            owner: Some(owner),
            kind: EntryKind::Method,
        }
    }

    /// Calls the entry point.
    #[inline]
    pub fn call(&self, receiver: Receiver<'_>, selector: Selector, args: &[usize]) -> usize {
        (self.imp)(receiver, selector, args)
    }

    /// Returns true for the forwarding handler.
    #[must_use]
    pub fn is_forwarding(&self) -> bool {
        self.kind == EntryKind::Forwarding
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPoint")
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// States of a single lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// The receiver class's cache had the selector.
    CacheHit,
    /// The cache did not have it.
    CacheMiss,
    /// Walking the class and its superclasses.
    HierarchyScan,
    /// The resolver hook is being given its one chance.
    ResolverInvoked,
    /// Nothing found; the forwarding path applies.
    Forward,
    /// The scan found a method and cached it.
    Found,
}

/// What to return when no method is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    /// Return the forwarding entry.
    OrForward,
    /// Return no entry.
    OrNil,
}

/// Outcome of [`Runtime::lookup`].
#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    /// The entry point, unless the lookup found nothing in
    /// [`LookupMode::OrNil`].
    pub entry: Option<EntryPoint>,
    /// Terminal state: `CacheHit`, `Found` or `Forward`.
    pub state: DispatchState,
    /// Whether the resolver hook ran during this lookup.
    pub resolver_invoked: bool,
}

/// Dynamic method resolution hook.
///
/// Called when a selector is not found for a class, at most once per
/// (receiver class, selector). It may install methods (for example with
/// [`Runtime::add_method`]) and returns whether it did. The hook runs with
/// no runtime lock held.
pub trait MethodResolver: Send + Sync {
    /// Tries to provide `selector` for `class`.
    fn resolve_method(&self, rt: &Runtime, class: Class, selector: Selector) -> bool;
}

impl<F> MethodResolver for F
where
    F: Fn(&Runtime, Class, Selector) -> bool + Send + Sync,
{
    fn resolve_method(&self, rt: &Runtime, class: Class, selector: Selector) -> bool {
        self(rt, class, selector)
    }
}

/// Default forwarding handler: logs the unrecognized selector and returns 0.
pub fn unrecognized_selector(receiver: Receiver<'_>, selector: Selector, _args: &[usize]) -> usize {
    match receiver {
        Receiver::Object(object) => {
            error!("-[{} {selector}]: does not recognize selector {selector}", object.isa());
        }
        Receiver::Class(class) => {
            error!("+[{class} {selector}]: does not recognize selector {selector}");
        }
        Receiver::Tagged(tagged) => {
            error!(
                "tagged pointer (slot {}) does not recognize selector {selector}",
                tagged.slot()
            );
        }
        Receiver::Nil => error!("nil does not recognize selector {selector}"),
    }
    0
}

impl Runtime {
    /// Resolves `selector` for `receiver`. Never fails: when nothing is
    /// found the forwarding entry is returned.
    #[inline]
    pub fn dispatch(&self, receiver: Receiver<'_>, selector: Selector) -> EntryPoint {
        match self.lookup(receiver, selector, LookupMode::OrForward).entry {
            Some(entry) => entry,
            None => self.forwarding_entry(),
        }
    }

    /// Resolves `selector` for `receiver`, or `None` when no method exists
    /// (including for nil receivers).
    #[inline]
    pub fn dispatch_or_nil(&self, receiver: Receiver<'_>, selector: Selector) -> Option<EntryPoint> {
        self.lookup(receiver, selector, LookupMode::OrNil).entry
    }

    /// Dispatches and calls the entry point.
    #[inline]
    pub fn send(&self, receiver: Receiver<'_>, selector: Selector, args: &[usize]) -> usize {
        self.dispatch(receiver, selector).call(receiver, selector, args)
    }

    /// Full lookup, reporting how the result was reached.
    pub fn lookup(&self, receiver: Receiver<'_>, selector: Selector, mode: LookupMode) -> Resolution {
        let Some(class) = self.class_of(receiver) else {
            trace!("dispatch {selector} to {receiver:?}: no class");
            return self.forward(mode, false);
        };
        if !self.owns(class) {
            debug!("dispatch {selector} to {class:?}: class belongs to another runtime");
            return self.forward(mode, false);
        }

        let owner = class.instance_class();
        if owner.state() != ClassState::Initialized {
            self.ensure_initialized(owner);
        }

        if let Some(hit) = class.cache().probe(selector) {
            trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::CacheHit);
            return Resolution {
                entry: Some(EntryPoint::method(hit.imp, hit.owner)),
                state: DispatchState::CacheHit,
                resolver_invoked: false,
            };
        }

        trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::CacheMiss);
        self.lookup_slow(class, selector, mode)
    }

    fn lookup_slow(&self, class: Class, selector: Selector, mode: LookupMode) -> Resolution {
        let mut resolver_invoked = false;

        loop {
            if !class.is_usable() || !class.is_realized() {
                break;
            }

            if let Some(entry) = self.scan_and_fill(class, selector) {
                trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::Found);
                return Resolution {
                    entry: Some(entry),
                    state: DispatchState::Found,
                    resolver_invoked,
                };
            }

            if resolver_invoked {
                break;
            }
            let resolver = self.store.write().claim_resolver(class, selector);
            let Some(resolver) = resolver else {
                break;
            };

            resolver_invoked = true;
            trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::ResolverInvoked);
            assert_no_locks_held("method resolver");
            let installed = resolver.resolve_method(self, class, selector);

            if self.options.print_resolved {
                info!(
                    "RESOLVED: {}[{class} {selector}] {}",
                    if class.is_metaclass() { '+' } else { '-' },
                    if installed { "installed a method" } else { "declined" }
                );
            }
        }

        trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::Forward);
        self.forward(mode, resolver_invoked)
    }

    /// Scans the hierarchy under the shared structural lock and caches a hit
    /// before releasing it.
    fn scan_and_fill(&self, class: Class, selector: Selector) -> Option<EntryPoint> {
        let data = self.store.read();
        trace!("dispatch {selector} to {class:?}: {:?}", DispatchState::HierarchyScan);

        let (method, owner) = data.find_method(class, selector)?;
        let mut token = self.cache_lock.lock();
        class.cache().fill(
            &mut token,
            CacheEntry {
                selector,
                imp: method.imp,
                owner,
            },
        );
        Some(EntryPoint::method(method.imp, owner))
    }

    fn forward(&self, mode: LookupMode, resolver_invoked: bool) -> Resolution {
        Resolution {
            entry: match mode {
                LookupMode::OrForward => Some(self.forwarding_entry()),
                LookupMode::OrNil => None,
            },
            state: DispatchState::Forward,
            resolver_invoked,
        }
    }

    /// The entry point used when no method is found.
    #[must_use]
    pub fn forwarding_entry(&self) -> EntryPoint {
        EntryPoint {
            imp: self.forward_handler,
            owner: None,
            kind: EntryKind::Forwarding,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::identity::TaggedPointer;
    use crate::runtime::loader::{ClassDescriptor, ImageDescriptor};
    use crate::runtime::object::ObjectRef;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn answer(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        42
    }

    fn sum(_: Receiver<'_>, _: Selector, args: &[usize]) -> usize {
        args.iter().sum()
    }

    fn payload(receiver: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        match receiver {
            Receiver::Tagged(tagged) => tagged.payload(),
            _ => 0,
        }
    }

    fn marker(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        7
    }

    fn runtime() -> &'static Runtime {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("dispatch")
                .class(ClassDescriptor::root("Root").method("answer", answer))
                .class(ClassDescriptor::subclass("Adder", "Root").method("sum:", sum)),
        )
        .unwrap();
        rt
    }

    #[test]
    fn test_miss_then_hit() {
        let rt = runtime();
        let adder = ObjectRef::new(rt.lookup_class("Adder").unwrap());
        let sel = rt.selector("answer");

        let first = rt.lookup(adder.as_receiver(), sel, LookupMode::OrForward);
        assert_eq!(first.state, DispatchState::Found);
        assert_eq!(first.entry.unwrap().owner, rt.lookup_class("Root"));

        let second = rt.lookup(adder.as_receiver(), sel, LookupMode::OrForward);
        assert_eq!(second.state, DispatchState::CacheHit);
        assert_eq!(second.entry.unwrap().call(adder.as_receiver(), sel, &[]), 42);
    }

    #[test]
    fn test_arguments_reach_the_method() {
        let rt = runtime();
        let adder = ObjectRef::new(rt.lookup_class("Adder").unwrap());
        assert_eq!(rt.send(adder.as_receiver(), rt.selector("sum:"), &[1, 2, 3]), 6);
    }

    #[test]
    fn test_unknown_selector_forwards_and_is_not_cached() {
        let rt = runtime();
        let class = rt.lookup_class("Adder").unwrap();
        let adder = ObjectRef::new(class);
        let sel = rt.selector("missing");

        let entry = rt.dispatch(adder.as_receiver(), sel);
        assert!(entry.is_forwarding());
        assert_eq!(entry.owner, None);
        assert_eq!(rt.send(adder.as_receiver(), sel, &[]), 0);
        assert!(rt.dispatch_or_nil(adder.as_receiver(), sel).is_none());
        assert!(class.cache().probe(sel).is_none());
    }

    #[test]
    fn test_nil_receiver() {
        let rt = runtime();
        let sel = rt.selector("answer");

        assert!(rt.dispatch_or_nil(Receiver::Nil, sel).is_none());
        let resolution = rt.lookup(Receiver::Nil, sel, LookupMode::OrForward);
        assert_eq!(resolution.state, DispatchState::Forward);
        assert!(resolution.entry.unwrap().is_forwarding());
    }

    #[test]
    fn test_tagged_receiver() {
        let rt = runtime();
        rt.load_image(ImageDescriptor::new("numbers").class(ClassDescriptor::subclass("SmallInt", "Root").method("value", payload)))
            .unwrap();
        let small = rt.lookup_class("SmallInt").unwrap();

        let tagged = TaggedPointer::new(3, 1234).unwrap();
        // Unregistered slot behaves like nil.
        assert!(rt.dispatch_or_nil(tagged.into(), rt.selector("value")).is_none());

        rt.register_tagged_class(3, small).unwrap();
        assert_eq!(rt.send(tagged.into(), rt.selector("value"), &[]), 1234);
        assert_eq!(rt.send(tagged.into(), rt.selector("answer"), &[]), 42);
    }

    #[test]
    fn test_custom_forward_handler() {
        let rt = Runtime::builder().forward_handler(marker).build().unwrap();
        rt.load_image(ImageDescriptor::new("app").class(ClassDescriptor::root("Empty")))
            .unwrap();
        let empty = ObjectRef::new(rt.lookup_class("Empty").unwrap());
        assert_eq!(rt.send(empty.as_receiver(), rt.selector("anything"), &[]), 7);
    }

    #[test]
    fn test_resolver_installs_method() {
        let rt = runtime();
        let root = rt.lookup_class("Root").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        rt.set_resolver(root, move |rt: &Runtime, class: Class, sel: Selector| {
            seen.fetch_add(1, Ordering::SeqCst);
            if sel.name() == "dynamic" {
                rt.add_method(class, sel, marker, "v@:").is_ok()
            } else {
                false
            }
        });

        let adder = ObjectRef::new(rt.lookup_class("Adder").unwrap());
        let resolution = rt.lookup(adder.as_receiver(), rt.selector("dynamic"), LookupMode::OrForward);
        assert!(resolution.resolver_invoked);
        assert_eq!(resolution.state, DispatchState::Found);
        assert_eq!(resolution.entry.unwrap().call(adder.as_receiver(), rt.selector("dynamic"), &[]), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Cached from now on.
        let again = rt.lookup(adder.as_receiver(), rt.selector("dynamic"), LookupMode::OrForward);
        assert_eq!(again.state, DispatchState::CacheHit);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resolver_runs_once_per_class_and_selector() {
        let rt = runtime();
        let root = rt.lookup_class("Root").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&calls);
        rt.set_resolver(root, move |_: &Runtime, _: Class, _: Selector| {
            seen.fetch_add(1, Ordering::SeqCst);
            false
        });

        let adder = ObjectRef::new(rt.lookup_class("Adder").unwrap());
        let sel = rt.selector("never");
        for _ in 0..3 {
            assert!(rt.dispatch(adder.as_receiver(), sel).is_forwarding());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A different receiver class gets its own chance.
        let plain = ObjectRef::new(root);
        assert!(rt.dispatch(plain.as_receiver(), sel).is_forwarding());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unloaded_class_forwards_on_miss() {
        let rt = Runtime::builder().build().unwrap();
        let report = rt
            .load_image(ImageDescriptor::new("plugin").class(ClassDescriptor::root("Plugin").method("run", answer)))
            .unwrap();
        let plugin = ObjectRef::new(rt.lookup_class("Plugin").unwrap());
        let run = rt.selector("run");
        assert_eq!(rt.send(plugin.as_receiver(), run, &[]), 42);

        rt.unload_image(report.image).unwrap();
        // The cached entry is not retracted.
        assert_eq!(rt.send(plugin.as_receiver(), run, &[]), 42);
        // Anything not cached forwards.
        assert!(rt.dispatch(plugin.as_receiver(), rt.selector("other")).is_forwarding());
    }

    #[test]
    fn test_entry_point_debug() {
        let rt = runtime();
        let entry = rt.forwarding_entry();
        assert_eq!(
            format!("{entry:?}"),
            "EntryPoint { owner: None, kind: Forwarding, .. }"
        );
    }
}
