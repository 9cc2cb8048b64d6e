//! Class metadata store.
//!
//! The mutable class graph lives in [`StoreData`] behind the runtime's
//! structural lock: shared for hierarchy scans, exclusive for every change.
//!
//! # Architecture
//!
//! - `ClassData` is indexed by class record id. It holds the superclass link,
//!   the class's own (primary) methods, attached categories, the flattened
//!   method table used by lookups, subclasses, protocols and hooks.
//! - Realization links a class under its superclass, lays out its ivars,
//!   binds its metaclass into the metaclass hierarchy and flattens methods.
//!   Superclasses are realized first.
//! - Every mutation that can change what a selector resolves to flushes the
//!   caches of the class and its whole subclass closure before the exclusive
//!   lock is released, so no reader can see a stale entry afterwards.
//!
//! # Category order
//!
//! For a selector on class C, lookup consults C's primary methods first,
//! then C's categories from the most recently loaded to the oldest, then C's
//! superclass chain. A category therefore overrides inherited methods and
//! earlier categories, but never a method C defines itself. Load order is a
//! store-wide sequence number assigned as categories arrive.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassState, Method};
use crate::runtime::dispatch::{Imp, MethodResolver};
use crate::runtime::initialize::Initializer;
use crate::runtime::loader::{IvarDescriptor, ImageId, ROOT_INSTANCE_SIZE};
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::Selector;
use fxhash::{FxHashMap, FxHashSet};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A category whose methods have been added to a class or metaclass.
#[derive(Debug, Clone)]
pub(crate) struct AttachedCategory {
    pub name: &'static str,
    pub seq: u64,
    pub methods: Vec<Method>,
}

/// A category waiting to be attached.
#[derive(Debug, Clone)]
pub(crate) struct PendingCategory {
    pub name: &'static str,
    pub seq: u64,
    pub image: ImageId,
    pub instance_methods: Vec<Method>,
    pub class_methods: Vec<Method>,
    pub protocols: Vec<Protocol>,
}

/// Mutable metadata of one class or metaclass.
pub(crate) struct ClassData {
    pub class: Class,
    pub superclass: Option<Class>,
    /// Superclass as named by the loader; resolved at realization.
    pub superclass_name: Option<&'static str>,
    /// Methods the class defines itself.
    pub methods: FxHashMap<Selector, Method>,
    /// Attached categories, oldest first.
    pub categories: Vec<AttachedCategory>,
    /// Primary methods merged with categories. Rebuilt on every change.
    pub flat: FxHashMap<Selector, Method>,
    pub ivars: Vec<IvarDescriptor>,
    pub ivar_offsets: Vec<usize>,
    /// Realized direct subclasses (the root class also lists the root
    /// metaclass).
    pub subclasses: Vec<Class>,
    pub protocols: Vec<Protocol>,
    pub resolver: Option<Arc<dyn MethodResolver>>,
    pub initializer: Option<Initializer>,
    /// Selectors the resolver hook already ran for, with this class as the
    /// receiver class.
    pub resolver_tried: FxHashSet<Selector>,
}

impl ClassData {
    pub(crate) fn new(class: Class) -> Self {
        ClassData {
            class,
            superclass: None,
            superclass_name: None,
            methods: FxHashMap::default(),
            categories: Vec::new(),
            flat: FxHashMap::default(),
            ivars: Vec::new(),
            ivar_offsets: Vec::new(),
            subclasses: Vec::new(),
            protocols: Vec::new(),
            resolver: None,
            initializer: None,
            resolver_tried: FxHashSet::default(),
        }
    }
}

/// A method-list change worth reporting under `print_replaced`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Replacement {
    /// A category method is hidden by the class's own method.
    ShadowedByPrimary { category: &'static str, seq: u64, selector: Selector },
    /// A later category replaced an earlier category's method.
    CategoryOverride {
        winner: &'static str,
        loser: &'static str,
        seq: u64,
        selector: Selector,
    },
}

struct ImageData {
    name: String,
    classes: Vec<Class>,
}

/// The class graph. Only reachable through the structural lock.
#[derive(Default)]
pub(crate) struct StoreData {
    classes: Vec<ClassData>,
    by_name: FxHashMap<&'static str, Class>,
    protocols: FxHashMap<&'static str, Protocol>,
    deferred: FxHashMap<String, Vec<PendingCategory>>,
    images: BTreeMap<ImageId, ImageData>,
    next_image: u32,
    next_category_seq: u64,
}

impl StoreData {
    pub(crate) fn new() -> Self {
        StoreData {
            next_image: 1,
            ..Self::default()
        }
    }

    pub(crate) fn class(&self, class: Class) -> &ClassData {
        &self.classes[class.id()]
    }

    pub(crate) fn class_mut(&mut self, class: Class) -> &mut ClassData {
        &mut self.classes[class.id()]
    }

    pub(crate) fn next_image_id(&mut self) -> ImageId {
        let id = ImageId::new(self.next_image);
        self.next_image += 1;
        id
    }

    pub(crate) fn next_category_seq(&mut self) -> u64 {
        self.next_category_seq += 1;
        self.next_category_seq
    }

    /// Ids for the next class and its metaclass.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn next_class_ids(&self) -> (u32, u32) {
        let id = self.classes.len() as u32;
        (id, id + 1)
    }

    pub(crate) fn push_pair(&mut self, class: ClassData, meta: ClassData) {
        debug_assert_eq!(class.class.id(), self.classes.len());
        self.classes.push(class);
        debug_assert_eq!(meta.class.id(), self.classes.len());
        self.classes.push(meta);
    }

    pub(crate) fn lookup_name(&self, name: &str) -> Option<Class> {
        self.by_name.get(name).copied()
    }

    pub(crate) fn insert_name(&mut self, class: Class) {
        self.by_name.insert(class.name(), class);
    }

    pub(crate) fn forget_name(&mut self, class: Class) {
        if self.by_name.get(class.name()) == Some(&class) {
            self.by_name.remove(class.name());
        }
    }

    pub(crate) fn named_classes(&self) -> impl Iterator<Item = Class> + '_ {
        self.by_name.values().copied()
    }

    pub(crate) fn protocol(&self, name: &str) -> Option<Protocol> {
        self.protocols.get(name).copied()
    }

    pub(crate) fn protocols(&self) -> impl Iterator<Item = Protocol> + '_ {
        self.protocols.values().copied()
    }

    pub(crate) fn insert_protocol(&mut self, protocol: Protocol) {
        self.protocols.insert(protocol.name(), protocol);
    }

    pub(crate) fn defer_category(&mut self, class_name: &str, category: PendingCategory) {
        self.deferred
            .entry(class_name.to_string())
            .or_default()
            .push(category);
    }

    pub(crate) fn take_deferred(&mut self, class_name: &str) -> Vec<PendingCategory> {
        self.deferred.remove(class_name).unwrap_or_default()
    }

    pub(crate) fn drop_pending_from(&mut self, image: ImageId) {
        for pending in self.deferred.values_mut() {
            pending.retain(|category| category.image != image);
        }
        self.deferred.retain(|_, pending| !pending.is_empty());
    }

    pub(crate) fn record_image(&mut self, id: ImageId, name: &str, classes: Vec<Class>) {
        self.images.insert(
            id,
            ImageData {
                name: name.to_string(),
                classes,
            },
        );
    }

    pub(crate) fn remove_image(&mut self, id: ImageId) -> Option<(String, Vec<Class>)> {
        self.images
            .remove(&id)
            .map(|image| (image.name, image.classes))
    }

    /// Walks `class` and its superclasses for `selector` in their flattened
    /// method tables. Returns the method and the class that supplied it.
    pub(crate) fn find_method(&self, class: Class, selector: Selector) -> Option<(Method, Class)> {
        let mut current = Some(class);
        while let Some(class) = current {
            let data = self.class(class);
            if let Some(method) = data.flat.get(&selector) {
                return Some((*method, class));
            }
            current = data.superclass;
        }
        None
    }

    /// Iterates `class` and its realized superclasses.
    pub(crate) fn ancestry(&self, class: Class) -> impl Iterator<Item = Class> + '_ {
        std::iter::successors(Some(class), |&class| self.class(class).superclass)
    }

    /// Marks the resolver as tried for (`class`, `selector`) and returns it,
    /// unless it already ran for this pair or no class in the chain has one.
    pub(crate) fn claim_resolver(
        &mut self,
        class: Class,
        selector: Selector,
    ) -> Option<Arc<dyn MethodResolver>> {
        let resolver = self
            .ancestry(class)
            .find_map(|class| self.class(class).resolver.clone())?;

        self.class_mut(class)
            .resolver_tried
            .insert(selector)
            .then_some(resolver)
    }

    /// Rebuilds `class`'s flattened table from its primary methods and
    /// categories, oldest category first so the newest wins.
    pub(crate) fn rebuild_flat(&mut self, class: Class) -> Vec<Replacement> {
        let data = self.class_mut(class);
        let mut flat = data.methods.clone();
        let mut supplier: FxHashMap<Selector, &'static str> = FxHashMap::default();
        let mut replacements = Vec::new();

        for category in &data.categories {
            for method in &category.methods {
                if data.methods.contains_key(&method.selector) {
                    replacements.push(Replacement::ShadowedByPrimary {
                        category: category.name,
                        seq: category.seq,
                        selector: method.selector,
                    });
                    continue;
                }
                if let Some(loser) = supplier.insert(method.selector, category.name) {
                    replacements.push(Replacement::CategoryOverride {
                        winner: category.name,
                        loser,
                        seq: category.seq,
                        selector: method.selector,
                    });
                }
                flat.insert(method.selector, *method);
            }
        }

        data.flat = flat;
        replacements
    }

    fn attach(&mut self, class: Class, name: &'static str, seq: u64, methods: Vec<Method>) -> bool {
        if methods.is_empty() {
            return false;
        }
        let categories = &mut self.class_mut(class).categories;
        let pos = categories.partition_point(|category| category.seq < seq);
        categories.insert(pos, AttachedCategory { name, seq, methods });
        true
    }

    fn add_protocols(&mut self, class: Class, protocols: &[Protocol]) {
        let adopted = &mut self.class_mut(class).protocols;
        for &protocol in protocols {
            if !adopted.contains(&protocol) {
                adopted.push(protocol);
            }
        }
    }

    /// Superclasses that still need realizing, starting with `class`.
    fn unrealized_chain(&self, class: Class) -> Result<Vec<Class>> {
        let mut chain = vec![class];
        let mut current = class;

        while let Some(name) = self.class(current).superclass_name {
            let Some(superclass) = self.lookup_name(name) else {
                return Err(Error::MissingSuperclass {
                    class: current.name().to_string(),
                    superclass: name.to_string(),
                });
            };
            if chain.contains(&superclass) {
                return Err(Error::InheritanceCycle {
                    class: superclass.name().to_string(),
                });
            }
            if superclass.is_realized() {
                break;
            }
            chain.push(superclass);
            current = superclass;
        }

        Ok(chain)
    }
}

impl Runtime {
    /// Realizes `class` (or the class of a metaclass), realizing its
    /// superclasses first.
    ///
    /// # Errors
    ///
    /// [`Error::MissingSuperclass`] or [`Error::InheritanceCycle`] if the
    /// chain cannot be resolved. The first failure leaves the class
    /// unrealized so a later image can supply the superclass; a second one
    /// marks it unusable. [`Error::ClassUnusable`] for unusable classes,
    /// [`Error::ForeignClass`] for classes of another runtime.
    pub fn realize(&self, class: Class) -> Result<()> {
        self.check_owned(class)?;
        let class = class.instance_class();
        if class.is_realized() {
            return Ok(());
        }
        let mut data = self.store.write();
        self.realize_locked(&mut data, class)
    }

    pub(crate) fn realize_locked(&self, data: &mut StoreData, class: Class) -> Result<()> {
        let class = class.instance_class();
        if class.is_realized() {
            return Ok(());
        }
        if !class.is_usable() {
            return Err(Error::ClassUnusable {
                class: class.name().to_string(),
            });
        }

        let chain = match data.unrealized_chain(class) {
            Ok(chain) => chain,
            Err(err) => {
                if class.note_realize_failure() {
                    warn!("class {class} failed to realize twice and is now unusable: {err}");
                    class.mark_unusable();
                    class.metaclass().mark_unusable();
                    data.forget_name(class);
                } else {
                    warn!("class {class} failed to realize: {err}");
                }
                return Err(err);
            }
        };

        for &class in chain.iter().rev() {
            self.link_class(data, class);
        }
        Ok(())
    }

    /// Realizes one class whose superclass (if any) is already realized.
    fn link_class(&self, data: &mut StoreData, class: Class) {
        let meta = class.metaclass();
        let superclass = data
            .class(class)
            .superclass_name
            .and_then(|name| data.lookup_name(name));

        data.class_mut(class).superclass = superclass;
        if let Some(superclass) = superclass {
            data.class_mut(superclass).subclasses.push(class);
        }

        let superclass_size = superclass.map_or(ROOT_INSTANCE_SIZE, Class::instance_size);
        let layout = self
            .layout
            .layout(class, superclass_size, &data.class(class).ivars);
        data.class_mut(class).ivar_offsets = layout.offsets;
        class.set_instance_size(layout.instance_size);

        // Metaclass side: a root metaclass inherits from its root class, and
        // every metaclass's isa is the root metaclass.
        let (meta_superclass, root_meta) = match superclass {
            Some(superclass) => {
                let super_meta = superclass.metaclass();
                (super_meta, super_meta.metaclass())
            }
            None => (class, meta),
        };
        data.class_mut(meta).superclass = Some(meta_superclass);
        data.class_mut(meta_superclass).subclasses.push(meta);
        meta.as_object().bind_isa(root_meta);

        let events = data.rebuild_flat(class);
        self.report_replacements(data, class, &events, None);
        let events = data.rebuild_flat(meta);
        self.report_replacements(data, meta, &events, None);

        meta.set_state(ClassState::Realized);
        class.set_state(ClassState::Realized);

        debug!(
            "realized class {class} (superclass {}, instance size {})",
            superclass.map_or("none", Class::name),
            class.instance_size()
        );
    }

    pub(crate) fn attach_category(&self, data: &mut StoreData, class: Class, category: PendingCategory) {
        let meta = class.metaclass();
        let PendingCategory {
            name,
            seq,
            instance_methods,
            class_methods,
            protocols,
            ..
        } = category;

        data.add_protocols(class, &protocols);
        let touched = [
            (class, data.attach(class, name, seq, instance_methods)),
            (meta, data.attach(meta, name, seq, class_methods)),
        ];

        if class.is_realized() {
            for (target, changed) in touched {
                if changed {
                    let events = data.rebuild_flat(target);
                    self.report_replacements(data, target, &events, Some(seq));
                    self.flush_subtree(data, target, "category attached");
                }
            }
        }

        debug!("attached category {class}({name})");
    }

    fn report_replacements(
        &self,
        data: &StoreData,
        class: Class,
        events: &[Replacement],
        only_seq: Option<u64>,
    ) {
        if !self.options.print_replaced {
            return;
        }

        let sign = if class.is_metaclass() { '+' } else { '-' };
        for event in events {
            match *event {
                Replacement::ShadowedByPrimary { category, seq, selector }
                    if only_seq.is_none_or(|s| s == seq) =>
                {
                    info!(
                        "REPLACED: {sign}[{class}({category}) {selector}] is hidden by the class's own method"
                    );
                }
                Replacement::CategoryOverride { winner, loser, seq, selector }
                    if only_seq.is_none_or(|s| s == seq) =>
                {
                    info!(
                        "REPLACED: {sign}[{class}({loser}) {selector}] by category {winner}"
                    );
                }
                _ => {}
            }
        }

        // Category methods that now hide a superclass method.
        let superclass = data.class(class).superclass;
        for category in &data.class(class).categories {
            if only_seq.is_some_and(|s| s != category.seq) {
                continue;
            }
            for method in &category.methods {
                if let Some((_, owner)) = superclass.and_then(|s| data.find_method(s, method.selector)) {
                    info!(
                        "REPLACED: {sign}[{owner} {}] by category {class}({})",
                        method.selector, category.name
                    );
                }
            }
        }
    }

    /// Flushes the caches of `root` and every realized class below it.
    pub(crate) fn flush_subtree(&self, data: &StoreData, root: Class, reason: &str) {
        let mut token = self.cache_lock.lock();
        let mut stack = vec![root];
        let mut seen = FxHashSet::default();

        while let Some(class) = stack.pop() {
            if !seen.insert(class) {
                continue;
            }
            class.cache().flush(&mut token);
            stack.extend_from_slice(&data.class(class).subclasses);
        }

        if self.options.print_cache_flush {
            info!("flushed {} method caches below {root:?} ({reason})", seen.len());
        } else {
            debug!("flushed {} method caches below {root:?} ({reason})", seen.len());
        }
    }

    /// Flushes the method caches of `class` and all of its subclasses.
    ///
    /// For method changes made outside this runtime's mutation API.
    pub fn invalidate_caches(&self, class: Class) {
        if !self.owns(class) {
            warn!("not invalidating {class}: it belongs to another runtime");
            return;
        }
        let data = self.store.write();
        self.flush_subtree(&data, class, "explicit invalidation");
    }

    /// Realizes the class owning `class` and checks it can be mutated.
    fn prepare_mutation(&self, data: &mut StoreData, class: Class) -> Result<()> {
        self.check_owned(class)?;
        self.realize_locked(data, class)?;
        if class.is_usable() {
            Ok(())
        } else {
            Err(Error::ClassUnusable {
                class: class.name().to_string(),
            })
        }
    }

    /// Adds a method to `class`'s own method list.
    ///
    /// Pass a metaclass to add a class method, or use
    /// [`add_class_method`](Self::add_class_method).
    ///
    /// # Errors
    ///
    /// [`Error::MethodExists`] if `class` itself already defines `selector`
    /// (inherited definitions do not count), or a realization error.
    pub fn add_method(&self, class: Class, selector: Selector, imp: Imp, types: &str) -> Result<()> {
        let mut data = self.store.write();
        self.prepare_mutation(&mut data, class)?;

        if data.class(class).methods.contains_key(&selector) {
            return Err(Error::MethodExists {
                class: class.name().to_string(),
                selector: selector.name().to_string(),
            });
        }

        let types = self.arena.alloc_str(types);
        data.class_mut(class)
            .methods
            .insert(selector, Method { selector, imp, types });
        data.rebuild_flat(class);
        self.flush_subtree(&data, class, "method added");
        Ok(())
    }

    /// Adds a method to `class`'s metaclass.
    ///
    /// # Errors
    ///
    /// As [`add_method`](Self::add_method).
    pub fn add_class_method(&self, class: Class, selector: Selector, imp: Imp, types: &str) -> Result<()> {
        self.add_method(class.instance_class().metaclass(), selector, imp, types)
    }

    /// Sets `class`'s own implementation of `selector`, adding the method if
    /// needed. Returns the implementation it replaced.
    ///
    /// # Errors
    ///
    /// A realization error if `class` cannot be realized.
    pub fn replace_method(
        &self,
        class: Class,
        selector: Selector,
        imp: Imp,
        types: &str,
    ) -> Result<Option<Imp>> {
        let mut data = self.store.write();
        self.prepare_mutation(&mut data, class)?;

        let types = self.arena.alloc_str(types);
        let previous = data
            .class_mut(class)
            .methods
            .insert(selector, Method { selector, imp, types })
            .map(|method| method.imp);

        if previous.is_some() && self.options.print_replaced {
            let sign = if class.is_metaclass() { '+' } else { '-' };
            info!("REPLACED: {sign}[{class} {selector}] by a new implementation");
        }

        data.rebuild_flat(class);
        self.flush_subtree(&data, class, "method replaced");
        Ok(previous)
    }

    /// Swaps the implementations of two methods `class` defines itself.
    ///
    /// # Errors
    ///
    /// [`Error::MethodNotFound`] if either selector is not in `class`'s own
    /// method list.
    pub fn exchange_implementations(&self, class: Class, a: Selector, b: Selector) -> Result<()> {
        let mut data = self.store.write();
        self.prepare_mutation(&mut data, class)?;

        let methods = &mut data.class_mut(class).methods;
        let missing = |selector: Selector| Error::MethodNotFound {
            class: class.name().to_string(),
            selector: selector.name().to_string(),
        };
        let imp_a = methods.get(&a).ok_or_else(|| missing(a))?.imp;
        let imp_b = methods.get(&b).ok_or_else(|| missing(b))?.imp;

        if let Some(method) = methods.get_mut(&a) {
            method.imp = imp_b;
        }
        if let Some(method) = methods.get_mut(&b) {
            method.imp = imp_a;
        }

        if self.options.print_replaced {
            info!("REPLACED: exchanged [{class} {a}] and [{class} {b}]");
        }

        data.rebuild_flat(class);
        self.flush_subtree(&data, class, "implementations exchanged");
        Ok(())
    }

    /// Installs the dynamic resolution hook for `class` and its subclasses.
    ///
    /// For class methods, install it on the metaclass.
    pub fn set_resolver<R>(&self, class: Class, resolver: R)
    where
        R: MethodResolver + 'static,
    {
        if !self.owns(class) {
            warn!("ignoring resolver for {class}: it belongs to another runtime");
            return;
        }
        let mut data = self.store.write();
        data.class_mut(class).resolver = Some(Arc::new(resolver));
    }

    /// Installs the one-time initializer of `class`.
    ///
    /// Has no effect once the class has started initializing.
    pub fn set_initializer<F>(&self, class: Class, initializer: F)
    where
        F: Fn(&Runtime, Class) + Send + Sync + 'static,
    {
        if !self.owns(class) {
            warn!("ignoring initializer for {class}: it belongs to another runtime");
            return;
        }
        let class = class.instance_class();
        let mut data = self.store.write();
        if class.state() >= ClassState::Initializing {
            debug!("class {class} is already initialized; ignoring new initializer");
            return;
        }
        data.class_mut(class).initializer = Some(Arc::new(initializer));
    }

    /// Declares that `class` adopts `protocol`. Returns false if it already
    /// did, or if `class` belongs to another runtime.
    pub fn add_protocol(&self, class: Class, protocol: Protocol) -> bool {
        if !self.owns(class) {
            warn!("{class} belongs to another runtime; not adopting {protocol:?}");
            return false;
        }
        let mut data = self.store.write();
        let adopted = &mut data.class_mut(class.instance_class()).protocols;
        if adopted.contains(&protocol) {
            false
        } else {
            adopted.push(protocol);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::identity::Receiver;
    use crate::runtime::loader::{CategoryDescriptor, ClassDescriptor, ImageDescriptor};
    use crate::runtime::object::ObjectRef;

    fn one(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        1
    }

    fn two(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        2
    }

    fn three(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
        3
    }

    fn send(rt: &Runtime, object: &ObjectRef, name: &str) -> usize {
        rt.send(object.as_receiver(), rt.selector(name), &[])
    }

    #[test]
    fn test_realization_links_hierarchy() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Root"))
                .class(ClassDescriptor::subclass("Middle", "Root"))
                .class(ClassDescriptor::subclass("Leaf", "Middle")),
        )
        .unwrap();

        let root = rt.lookup_class("Root").unwrap();
        let middle = rt.lookup_class("Middle").unwrap();
        let leaf = rt.lookup_class("Leaf").unwrap();

        rt.realize(leaf).unwrap();
        assert!(root.is_realized() && middle.is_realized() && leaf.is_realized());
        assert_eq!(rt.superclass(leaf), Some(middle));
        assert_eq!(rt.subclasses(root), vec![middle]);

        // Metaclass hierarchy.
        assert_eq!(rt.superclass(leaf.metaclass()), Some(middle.metaclass()));
        assert_eq!(rt.superclass(root.metaclass()), Some(root));
        assert_eq!(leaf.metaclass().metaclass(), root.metaclass());
        assert_eq!(root.metaclass().metaclass(), root.metaclass());
    }

    #[test]
    fn test_missing_superclass_retried_once() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(ImageDescriptor::new("app").class(ClassDescriptor::subclass("Orphan", "Parent")))
            .unwrap();
        let orphan = rt.lookup_class("Orphan").unwrap();

        assert!(matches!(rt.realize(orphan), Err(Error::MissingSuperclass { .. })));
        assert!(orphan.is_usable());

        // The superclass arrives before the retry.
        rt.load_image(ImageDescriptor::new("late").class(ClassDescriptor::root("Parent")))
            .unwrap();
        rt.realize(orphan).unwrap();
        assert!(orphan.is_realized());
    }

    #[test]
    fn test_second_realization_failure_is_final() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(ImageDescriptor::new("app").class(ClassDescriptor::subclass("Orphan", "Nowhere")))
            .unwrap();
        let orphan = rt.lookup_class("Orphan").unwrap();

        assert!(rt.realize(orphan).is_err());
        assert!(rt.realize(orphan).is_err());
        assert!(!orphan.is_usable());
        assert!(rt.lookup_class("Orphan").is_none());
        assert!(matches!(rt.realize(orphan), Err(Error::ClassUnusable { .. })));
    }

    #[test]
    fn test_cycle_detected() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::subclass("A", "B"))
                .class(ClassDescriptor::subclass("B", "A")),
        )
        .unwrap();

        let a = rt.lookup_class("A").unwrap();
        assert!(matches!(rt.realize(a), Err(Error::InheritanceCycle { .. })));
    }

    #[test]
    fn test_category_order() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Base").method("inherited", one))
                .class(ClassDescriptor::subclass("Widget", "Base").method("own", one)),
        )
        .unwrap();
        rt.load_image(
            ImageDescriptor::new("first")
                .category(
                    CategoryDescriptor::new("First", "Widget")
                        .method("own", two)
                        .method("inherited", two)
                        .method("shared", two),
                ),
        )
        .unwrap();
        rt.load_image(
            ImageDescriptor::new("second")
                .category(CategoryDescriptor::new("Second", "Widget").method("shared", three)),
        )
        .unwrap();

        let widget = ObjectRef::new(rt.lookup_class("Widget").unwrap());
        // Primary beats every category.
        assert_eq!(send(rt, &widget, "own"), 1);
        // A category beats the superclass.
        assert_eq!(send(rt, &widget, "inherited"), 2);
        // The last loaded category wins.
        assert_eq!(send(rt, &widget, "shared"), 3);
    }

    #[test]
    fn test_category_on_realized_class_flushes_caches() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Base").method("value", one))
                .class(ClassDescriptor::subclass("Derived", "Base")),
        )
        .unwrap();

        let derived = ObjectRef::new(rt.lookup_class("Derived").unwrap());
        assert_eq!(send(rt, &derived, "value"), 1);

        rt.load_image(ImageDescriptor::new("ext").category(CategoryDescriptor::new("Ext", "Base").method("value", two)))
            .unwrap();
        assert_eq!(send(rt, &derived, "value"), 2);
    }

    #[test]
    fn test_add_method_rules() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Base").method("value", one))
                .class(ClassDescriptor::subclass("Derived", "Base")),
        )
        .unwrap();
        let base = rt.lookup_class("Base").unwrap();
        let derived = rt.lookup_class("Derived").unwrap();
        let value = rt.selector("value");

        assert!(matches!(
            rt.add_method(base, value, two, "v@:"),
            Err(Error::MethodExists { .. })
        ));
        // Overriding an inherited method is an add on the subclass.
        rt.add_method(derived, value, two, "v@:").unwrap();

        let object = ObjectRef::new(derived);
        assert_eq!(send(rt, &object, "value"), 2);
    }

    #[test]
    fn test_replace_method_returns_previous() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(ImageDescriptor::new("app").class(ClassDescriptor::root("Thing").method("value", one)))
            .unwrap();
        let thing = rt.lookup_class("Thing").unwrap();
        let value = rt.selector("value");

        let previous = rt.replace_method(thing, value, two, "v@:").unwrap().unwrap();
        assert_eq!(previous(Receiver::Nil, value, &[]), 1);
        assert!(rt.replace_method(thing, rt.selector("fresh"), three, "v@:").unwrap().is_none());

        let object = ObjectRef::new(thing);
        assert_eq!(send(rt, &object, "value"), 2);
        assert_eq!(send(rt, &object, "fresh"), 3);
    }

    #[test]
    fn test_exchange_implementations() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Thing").method("a", one).method("b", two)),
        )
        .unwrap();
        let thing = rt.lookup_class("Thing").unwrap();
        let object = ObjectRef::new(thing);
        assert_eq!(send(rt, &object, "a"), 1);

        rt.exchange_implementations(thing, rt.selector("a"), rt.selector("b"))
            .unwrap();
        assert_eq!(send(rt, &object, "a"), 2);
        assert_eq!(send(rt, &object, "b"), 1);

        assert!(matches!(
            rt.exchange_implementations(thing, rt.selector("a"), rt.selector("zzz")),
            Err(Error::MethodNotFound { .. })
        ));
    }

    #[test]
    fn test_class_methods_live_on_metaclass() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Root").class_method("make", one))
                .class(ClassDescriptor::subclass("Child", "Root")),
        )
        .unwrap();
        let child = rt.lookup_class("Child").unwrap();
        let make = rt.selector("make");

        assert_eq!(rt.send(child.as_receiver(), make, &[]), 1);
        rt.add_class_method(child, make, two, "@@:").unwrap();
        assert_eq!(rt.send(child.as_receiver(), make, &[]), 2);

        // Class methods are not visible to instances.
        let object = ObjectRef::new(child);
        assert!(rt.dispatch_or_nil(object.as_receiver(), make).is_none());
    }

    #[test]
    fn test_root_instance_methods_reach_class_objects() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Root").method("describe", one))
                .class(ClassDescriptor::subclass("Child", "Root")),
        )
        .unwrap();
        let child = rt.lookup_class("Child").unwrap();

        assert_eq!(rt.send(child.as_receiver(), rt.selector("describe"), &[]), 1);
    }

    #[test]
    fn test_flush_reaches_metaclasses_through_root() {
        let rt = Runtime::builder().build().unwrap();
        rt.load_image(
            ImageDescriptor::new("app")
                .class(ClassDescriptor::root("Root").method("describe", one))
                .class(ClassDescriptor::subclass("Child", "Root")),
        )
        .unwrap();
        let root = rt.lookup_class("Root").unwrap();
        let child = rt.lookup_class("Child").unwrap();
        let describe = rt.selector("describe");

        assert_eq!(rt.send(child.as_receiver(), describe, &[]), 1);
        rt.replace_method(root, describe, two, "v@:").unwrap();
        assert_eq!(rt.send(child.as_receiver(), describe, &[]), 2);
    }
}
