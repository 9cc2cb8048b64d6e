//! Loader interface: image descriptors in, class records out.
//!
//! The runtime core does not parse binaries. A loader hands it an
//! [`ImageDescriptor`] (classes, categories and protocols that became
//! available together) and later, possibly, an unload notification.
//!
//! # Loading
//!
//! A batch is added under one exclusive acquisition of the structural lock,
//! so no dispatch observes half an image. Validation runs before anything is
//! inserted: a batch that refers to an unknown protocol is rejected whole.
//!
//! - A class whose name is already registered is kept *inert*: it gets a
//!   record (so the loader has a handle for it) but is never realized and
//!   never returned by name lookup. It is listed in
//!   [`ImageReport::duplicates`].
//! - A category whose class is not loaded yet stays pending and attaches
//!   when the class arrives.
//! - Classes are realized lazily, on first dispatch or explicit
//!   [`Runtime::realize`].
//!
//! # Unloading
//!
//! [`Runtime::unload_image`] marks the image's classes unusable and removes
//! them from name lookup. Caches that already hold their methods are not
//! flushed; a receiver of an unloaded class forwards on its next cache miss.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassPairSpec, Method};
use crate::runtime::dispatch::Imp;
use crate::runtime::object::Object;
use crate::runtime::protocol::{Protocol, ProtocolRecord};
use crate::runtime::store::{ClassData, PendingCategory, StoreData};
use fxhash::FxHashSet;
use log::{debug, info, warn};
use std::fmt;

/// Identifies a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ImageId(u32);

impl ImageId {
    /// The image holding preoptimized classes.
    pub const PREOPTIMIZED: ImageId = ImageId(0);

    pub(crate) const fn new(id: u32) -> Self {
        ImageId(id)
    }

    /// The numeric id.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A method as delivered by the loader.
#[derive(Clone)]
pub struct MethodDescriptor {
    /// Selector name.
    pub selector: String,
    /// Implementation.
    pub imp: Imp,
    /// Type encoding, opaque to the runtime.
    pub types: String,
}

impl MethodDescriptor {
    /// A method with the generic `v@:` encoding.
    #[must_use]
    pub fn new(selector: impl Into<String>, imp: Imp) -> Self {
        Self::with_types(selector, imp, "v@:")
    }

    /// A method with an explicit type encoding.
    #[must_use]
    pub fn with_types(
        selector: impl Into<String>,
        imp: Imp,
        types: impl Into<String>,
    ) -> Self {
        MethodDescriptor {
            selector: selector.into(),
            imp,
            types: types.into(),
        }
    }
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("selector", &self.selector)
            .field("types", &self.types)
            .finish_non_exhaustive()
    }
}

/// An instance variable. Layout is decided by the [`IvarLayoutProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarDescriptor {
    /// Variable name.
    pub name: String,
    /// Size in bytes.
    pub size: usize,
    /// Alignment in bytes (a power of two).
    pub align: usize,
}

/// A class as delivered by the loader.
#[derive(Debug, Clone)]
pub struct ClassDescriptor {
    /// Class name.
    pub name: String,
    /// Superclass name; `None` for a root class.
    pub superclass: Option<String>,
    /// Methods of instances.
    pub instance_methods: Vec<MethodDescriptor>,
    /// Methods of the class object (installed on the metaclass).
    pub class_methods: Vec<MethodDescriptor>,
    /// Instance variables declared by this class.
    pub ivars: Vec<IvarDescriptor>,
    /// Names of adopted protocols.
    pub protocols: Vec<String>,
}

impl ClassDescriptor {
    /// A root class.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        ClassDescriptor {
            name: name.into(),
            superclass: None,
            instance_methods: Vec::new(),
            class_methods: Vec::new(),
            ivars: Vec::new(),
            protocols: Vec::new(),
        }
    }

    /// A class inheriting from `superclass`.
    #[must_use]
    pub fn subclass(name: impl Into<String>, superclass: impl Into<String>) -> Self {
        ClassDescriptor {
            superclass: Some(superclass.into()),
            ..Self::root(name)
        }
    }

    /// Adds an instance method.
    #[must_use]
    pub fn method(mut self, selector: impl Into<String>, imp: Imp) -> Self {
        self.instance_methods.push(MethodDescriptor::new(selector, imp));
        self
    }

    /// Adds a class method.
    #[must_use]
    pub fn class_method(mut self, selector: impl Into<String>, imp: Imp) -> Self {
        self.class_methods.push(MethodDescriptor::new(selector, imp));
        self
    }

    /// Adds an instance variable.
    #[must_use]
    pub fn ivar(mut self, name: impl Into<String>, size: usize, align: usize) -> Self {
        self.ivars.push(IvarDescriptor {
            name: name.into(),
            size,
            align,
        });
        self
    }

    /// Adopts a protocol.
    #[must_use]
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocols.push(name.into());
        self
    }
}

/// A category as delivered by the loader.
#[derive(Debug, Clone)]
pub struct CategoryDescriptor {
    /// Category name.
    pub name: String,
    /// Name of the class it extends.
    pub class_name: String,
    /// Instance methods it adds.
    pub instance_methods: Vec<MethodDescriptor>,
    /// Class methods it adds.
    pub class_methods: Vec<MethodDescriptor>,
    /// Protocols it adopts on the class's behalf.
    pub protocols: Vec<String>,
}

impl CategoryDescriptor {
    /// An empty category on `class_name`.
    #[must_use]
    pub fn new(name: impl Into<String>, class_name: impl Into<String>) -> Self {
        CategoryDescriptor {
            name: name.into(),
            class_name: class_name.into(),
            instance_methods: Vec::new(),
            class_methods: Vec::new(),
            protocols: Vec::new(),
        }
    }

    /// Adds an instance method.
    #[must_use]
    pub fn method(mut self, selector: impl Into<String>, imp: Imp) -> Self {
        self.instance_methods.push(MethodDescriptor::new(selector, imp));
        self
    }

    /// Adds a class method.
    #[must_use]
    pub fn class_method(mut self, selector: impl Into<String>, imp: Imp) -> Self {
        self.class_methods.push(MethodDescriptor::new(selector, imp));
        self
    }

    /// Adopts a protocol.
    #[must_use]
    pub fn protocol(mut self, name: impl Into<String>) -> Self {
        self.protocols.push(name.into());
        self
    }
}

/// A protocol as delivered by the loader.
#[derive(Debug, Clone, Default)]
pub struct ProtocolDescriptor {
    /// Protocol name.
    pub name: String,
    /// Names of inherited protocols.
    pub inherits: Vec<String>,
    /// Required selector names.
    pub required: Vec<String>,
    /// Optional selector names.
    pub optional: Vec<String>,
}

impl ProtocolDescriptor {
    /// An empty protocol.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ProtocolDescriptor {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Inherits another protocol.
    #[must_use]
    pub fn inherits(mut self, name: impl Into<String>) -> Self {
        self.inherits.push(name.into());
        self
    }

    /// Adds a required selector.
    #[must_use]
    pub fn required(mut self, selector: impl Into<String>) -> Self {
        self.required.push(selector.into());
        self
    }

    /// Adds an optional selector.
    #[must_use]
    pub fn optional(mut self, selector: impl Into<String>) -> Self {
        self.optional.push(selector.into());
        self
    }
}

/// Everything that became available together.
#[derive(Debug, Clone, Default)]
pub struct ImageDescriptor {
    /// Image name, for diagnostics.
    pub name: String,
    /// Classes, in load order.
    pub classes: Vec<ClassDescriptor>,
    /// Categories, in load order.
    pub categories: Vec<CategoryDescriptor>,
    /// Protocols.
    pub protocols: Vec<ProtocolDescriptor>,
}

impl ImageDescriptor {
    /// An empty image.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        ImageDescriptor {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a class.
    #[must_use]
    pub fn class(mut self, class: ClassDescriptor) -> Self {
        self.classes.push(class);
        self
    }

    /// Adds a category.
    #[must_use]
    pub fn category(mut self, category: CategoryDescriptor) -> Self {
        self.categories.push(category);
        self
    }

    /// Adds a protocol.
    #[must_use]
    pub fn protocol(mut self, protocol: ProtocolDescriptor) -> Self {
        self.protocols.push(protocol);
        self
    }
}

/// Outcome of [`Runtime::load_image`].
#[derive(Debug, Clone)]
pub struct ImageReport {
    /// Id assigned to the image.
    pub image: ImageId,
    /// Classes registered under their names.
    pub classes: Vec<Class>,
    /// Classes whose names were taken; kept inert.
    pub duplicates: Vec<Class>,
    /// Categories waiting for a class that is not loaded.
    pub pending_categories: Vec<String>,
}

/// Final placement of a class's instance variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IvarLayout {
    /// Offset of each declared ivar, in declaration order.
    pub offsets: Vec<usize>,
    /// Instance size including the superclass part.
    pub instance_size: usize,
}

/// Collaborator that finalizes instance variable layout at realization.
pub trait IvarLayoutProvider: Send + Sync {
    /// Lays out `ivars` after a superclass part of `superclass_size` bytes.
    fn layout(&self, class: Class, superclass_size: usize, ivars: &[IvarDescriptor]) -> IvarLayout;
}

/// Default layout: each ivar at the next offset aligned for it, after the
/// superclass's instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlidingLayout;

impl IvarLayoutProvider for SlidingLayout {
    fn layout(&self, _class: Class, superclass_size: usize, ivars: &[IvarDescriptor]) -> IvarLayout {
        let mut offset = superclass_size;
        let offsets = ivars
            .iter()
            .map(|ivar| {
                let align = ivar.align.max(1);
                let start = offset.next_multiple_of(align);
                offset = start + ivar.size;
                start
            })
            .collect();

        IvarLayout {
            offsets,
            instance_size: offset,
        }
    }
}

/// Size of a root class instance: just the object header.
pub(crate) const ROOT_INSTANCE_SIZE: usize = size_of::<Object>();

impl Runtime {
    /// Adds an image's classes, categories and protocols as one batch.
    ///
    /// # Errors
    ///
    /// [`Error::ProtocolNotFound`] if anything names a protocol that is
    /// neither loaded nor part of the batch, and [`Error::InheritanceCycle`]
    /// for a class naming itself as superclass. Nothing is added on error.
    pub fn load_image(&self, image: ImageDescriptor) -> Result<ImageReport> {
        let mut data = self.store.write();
        let id = data.next_image_id();
        self.load_image_locked(&mut data, id, image)
    }

    pub(crate) fn load_image_locked(
        &self,
        data: &mut StoreData,
        id: ImageId,
        image: ImageDescriptor,
    ) -> Result<ImageReport> {
        validate_image(data, &image)?;

        for protocol in &image.protocols {
            self.register_protocol(data, protocol);
        }

        let mut report = ImageReport {
            image: id,
            classes: Vec::new(),
            duplicates: Vec::new(),
            pending_categories: Vec::new(),
        };

        for descriptor in &image.classes {
            let duplicate = data.lookup_name(&descriptor.name).is_some();
            let class = self.register_class(data, id, descriptor, duplicate);
            if duplicate {
                warn!(
                    "class {} in image {} is already registered; keeping the new one inert",
                    descriptor.name, image.name
                );
                report.duplicates.push(class);
            } else {
                report.classes.push(class);
            }
        }

        for descriptor in &image.categories {
            let category = self.pending_category(data, id, descriptor);
            match data.lookup_name(&descriptor.class_name) {
                Some(class) => self.attach_category(data, class, category),
                None => {
                    warn!(
                        "category {}({}) targets a class that is not loaded; deferring",
                        descriptor.class_name, descriptor.name
                    );
                    report
                        .pending_categories
                        .push(format!("{}({})", descriptor.class_name, descriptor.name));
                    data.defer_category(&descriptor.class_name, category);
                }
            }
        }

        data.record_image(id, &image.name, report.classes.clone());

        if self.options.print_images {
            info!(
                "loaded image {} ({id}): {} classes, {} categories, {} protocols",
                image.name,
                image.classes.len(),
                image.categories.len(),
                image.protocols.len()
            );
        } else {
            debug!("loaded image {} ({id})", image.name);
        }

        Ok(report)
    }

    /// Marks every class of `image` unusable and drops it from name lookup.
    ///
    /// # Errors
    ///
    /// [`Error::ImageNotFound`] if the image is not loaded.
    pub fn unload_image(&self, image: ImageId) -> Result<()> {
        let mut data = self.store.write();
        let (name, classes) = data
            .remove_image(image)
            .ok_or(Error::ImageNotFound { image: image.get() })?;

        for &class in &classes {
            class.mark_unusable();
            class.metaclass().mark_unusable();
            data.forget_name(class);
        }
        data.drop_pending_from(image);

        if self.options.print_images {
            info!("unloaded image {name} ({image}): {} classes", classes.len());
        } else {
            debug!("unloaded image {name} ({image})");
        }
        Ok(())
    }

    fn register_protocol(&self, data: &mut StoreData, descriptor: &ProtocolDescriptor) {
        if data.protocol(&descriptor.name).is_some() {
            warn!("protocol {} is already registered; ignoring", descriptor.name);
            return;
        }

        let selectors = |names: &[String]| -> Vec<_> {
            names.iter().map(|name| self.selectors.intern(name)).collect()
        };
        // Validation guarantees every inherited protocol resolves, and the
        // batch is registered in order.
        let inherits = descriptor
            .inherits
            .iter()
            .filter_map(|name| data.protocol(name))
            .collect();

        let record = self.arena.alloc(ProtocolRecord::new(
            self.arena.alloc_str(&descriptor.name),
            selectors(&descriptor.required),
            selectors(&descriptor.optional),
            inherits,
        ));
        data.insert_protocol(Protocol::from_record(record));
    }

    fn register_class(
        &self,
        data: &mut StoreData,
        image: ImageId,
        descriptor: &ClassDescriptor,
        inert: bool,
    ) -> Class {
        let (class_id, meta_id) = data.next_class_ids();
        let class = Class::alloc_pair(
            self.arena,
            self.lock_stats,
            &ClassPairSpec {
                name: &descriptor.name,
                class_id,
                meta_id,
                runtime: self.id,
                image,
                cache_capacity: self.options.initial_cache_capacity,
            },
        );
        let meta = class.metaclass();

        let mut class_data = ClassData::new(class);
        class_data.superclass_name = descriptor
            .superclass
            .as_deref()
            .map(|name| self.arena.alloc_str(name));
        class_data.methods = self.methods(&descriptor.instance_methods).map(|m| (m.selector, m)).collect();
        class_data.ivars.clone_from(&descriptor.ivars);
        class_data.protocols = descriptor
            .protocols
            .iter()
            .filter_map(|name| data.protocol(name))
            .collect();

        let mut meta_data = ClassData::new(meta);
        meta_data.methods = self.methods(&descriptor.class_methods).map(|m| (m.selector, m)).collect();

        data.push_pair(class_data, meta_data);

        if inert {
            class.mark_unusable();
            meta.mark_unusable();
        } else {
            data.insert_name(class);
            for category in data.take_deferred(class.name()) {
                self.attach_category(data, class, category);
            }
        }
        class
    }

    fn pending_category(
        &self,
        data: &mut StoreData,
        image: ImageId,
        descriptor: &CategoryDescriptor,
    ) -> PendingCategory {
        PendingCategory {
            name: self.arena.alloc_str(&descriptor.name),
            seq: data.next_category_seq(),
            image,
            instance_methods: self.methods(&descriptor.instance_methods).collect(),
            class_methods: self.methods(&descriptor.class_methods).collect(),
            protocols: descriptor
                .protocols
                .iter()
                .filter_map(|name| data.protocol(name))
                .collect(),
        }
    }

    fn methods<'d>(
        &'d self,
        descriptors: &'d [MethodDescriptor],
    ) -> impl Iterator<Item = Method> + 'd {
        descriptors.iter().map(|descriptor| Method {
            selector: self.selectors.intern(&descriptor.selector),
            imp: descriptor.imp,
            types: self.arena.alloc_str(&descriptor.types),
        })
    }
}

/// Checks everything that could make a batch fail before any of it is added.
fn validate_image(data: &StoreData, image: &ImageDescriptor) -> Result<()> {
    let mut known: FxHashSet<&str> = FxHashSet::default();
    for protocol in &image.protocols {
        for inherited in &protocol.inherits {
            if !known.contains(inherited.as_str()) && data.protocol(inherited).is_none() {
                return Err(Error::ProtocolNotFound {
                    name: inherited.clone(),
                });
            }
        }
        known.insert(&protocol.name);
    }

    let protocol_exists =
        |name: &String| known.contains(name.as_str()) || data.protocol(name).is_some();

    for class in &image.classes {
        if class.superclass.as_deref() == Some(class.name.as_str()) {
            return Err(Error::InheritanceCycle {
                class: class.name.clone(),
            });
        }
        if let Some(missing) = class.protocols.iter().find(|name| !protocol_exists(name)) {
            return Err(Error::ProtocolNotFound {
                name: missing.clone(),
            });
        }
    }

    for category in &image.categories {
        if let Some(missing) = category.protocols.iter().find(|name| !protocol_exists(name)) {
            return Err(Error::ProtocolNotFound {
                name: missing.clone(),
            });
        }
    }

    Ok(())
}
