//! Runtime introspection: read-only queries over the class store.
//!
//! - **Class enumeration** - list registered classes, find one by name
//! - **Hierarchy** - superclass, subclasses, ancestry
//! - **Methods** - list a class's methods, find which class provides one
//! - **Protocols** - list protocols, check conformance
//!
//! Queries about a class of another runtime come back empty.
//!
//! Queries take the structural lock shared. The ones that need a linked
//! hierarchy (`responds_to`, `method_provider`) realize the class first.
//!
//! # Example
//!
//! ```rust
//! use oxidec::runtime::Runtime;
//! use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
//!
//! let rt = Runtime::builder().build().unwrap();
//! rt.load_image(
//!     ImageDescriptor::new("app")
//!         .class(ClassDescriptor::root("Shape"))
//!         .class(ClassDescriptor::subclass("Circle", "Shape")),
//! )
//! .unwrap();
//!
//! let circle = rt.lookup_class("Circle").unwrap();
//! let names: Vec<_> = rt.class_hierarchy(circle).iter().map(|c| c.name()).collect();
//! assert_eq!(names, ["Circle", "Shape"]);
//! ```

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassState, Method};
use crate::runtime::protocol::Protocol;
use crate::runtime::selector::{Selector, SelectorTable};

impl Runtime {
    /// Finds a usable class by name.
    ///
    /// Preoptimized classes are found without taking the structural lock.
    #[must_use]
    pub fn lookup_class(&self, name: &str) -> Option<Class> {
        if let Some(class) = self
            .preopt_classes
            .get()
            .and_then(|classes| classes.get(name).copied())
            && class.is_usable()
        {
            return Some(class);
        }
        self.store.read().lookup_name(name)
    }

    /// Finds a usable class by name, as an error when there is none.
    ///
    /// # Errors
    ///
    /// [`Error::ClassNotFound`] if no usable class has this name.
    pub fn class_named(&self, name: &str) -> Result<Class> {
        self.lookup_class(name).ok_or_else(|| Error::ClassNotFound {
            name: name.to_string(),
        })
    }

    /// Every usable class, sorted by name.
    #[must_use]
    pub fn all_classes(&self) -> Vec<Class> {
        let mut classes: Vec<Class> = self.store.read().named_classes().collect();
        classes.sort_by_key(|class| class.name());
        classes
    }

    /// Lifecycle state of `class`.
    #[must_use]
    pub fn class_state(&self, class: Class) -> ClassState {
        class.state()
    }

    /// The superclass of `class`.
    ///
    /// Before realization this is the superclass named by the loader, if it
    /// is loaded. Metaclasses have no superclass until realized.
    #[must_use]
    pub fn superclass(&self, class: Class) -> Option<Class> {
        if !self.owns(class) {
            return None;
        }
        let data = self.store.read();
        let record = data.class(class);
        record.superclass.or_else(|| {
            record
                .superclass_name
                .and_then(|name| data.lookup_name(name))
        })
    }

    /// Realized direct subclasses of `class`, in realization order.
    ///
    /// For a class this never includes metaclasses; for a metaclass it lists
    /// the metaclasses of the class's subclasses.
    #[must_use]
    pub fn subclasses(&self, class: Class) -> Vec<Class> {
        if !self.owns(class) {
            return Vec::new();
        }
        let data = self.store.read();
        data.class(class)
            .subclasses
            .iter()
            .copied()
            .filter(|subclass| subclass.is_metaclass() == class.is_metaclass())
            .collect()
    }

    /// `class` followed by its superclasses up to the root.
    #[must_use]
    pub fn class_hierarchy(&self, class: Class) -> Vec<Class> {
        let mut hierarchy = vec![class];
        while let Some(superclass) = hierarchy.last().and_then(|&c| self.superclass(c)) {
            if hierarchy.contains(&superclass) {
                break;
            }
            hierarchy.push(superclass);
        }
        hierarchy
    }

    /// Returns true if `ancestor` is `class` or one of its superclasses.
    #[must_use]
    pub fn is_subclass(&self, class: Class, ancestor: Class) -> bool {
        self.class_hierarchy(class).contains(&ancestor)
    }

    /// Methods `class` itself provides (own and category methods, not
    /// inherited ones), sorted by selector name.
    ///
    /// Category methods only appear once the class is realized.
    #[must_use]
    pub fn instance_methods(&self, class: Class) -> Vec<Method> {
        if !self.owns(class) {
            return Vec::new();
        }
        let data = self.store.read();
        let record = data.class(class);
        let table = if class.is_realized() {
            &record.flat
        } else {
            &record.methods
        };
        let mut methods: Vec<Method> = table.values().copied().collect();
        methods.sort_by_key(|method| method.selector.name());
        methods
    }

    /// Methods of the class object, i.e. of `class`'s metaclass.
    #[must_use]
    pub fn class_methods(&self, class: Class) -> Vec<Method> {
        self.instance_methods(class.instance_class().metaclass())
    }

    /// Returns true if an instance of `class` (or, for a metaclass, the class
    /// object) has a method for `selector`, own or inherited.
    ///
    /// Only scans the hierarchy: the resolver hook is not consulted and
    /// nothing is cached.
    #[must_use]
    pub fn responds_to(&self, class: Class, selector: Selector) -> bool {
        self.method_provider(class, selector).is_some()
    }

    /// The class whose method list supplies `selector` for `class`.
    #[must_use]
    pub fn method_provider(&self, class: Class, selector: Selector) -> Option<Class> {
        if self.realize(class).is_err() {
            return None;
        }
        self.store
            .read()
            .find_method(class, selector)
            .map(|(_, owner)| owner)
    }

    /// Protocols `class` adopts directly (not through superclasses).
    #[must_use]
    pub fn adopted_protocols(&self, class: Class) -> Vec<Protocol> {
        if !self.owns(class) {
            return Vec::new();
        }
        self.store.read().class(class.instance_class()).protocols.clone()
    }

    /// Returns true if `class` or a superclass adopts `protocol` or a
    /// protocol inheriting it.
    #[must_use]
    pub fn conforms_to(&self, class: Class, protocol: Protocol) -> bool {
        self.class_hierarchy(class.instance_class())
            .into_iter()
            .flat_map(|class| self.adopted_protocols(class))
            .any(|adopted| adopted.conforms_to(protocol))
    }

    /// Finds a protocol by name.
    #[must_use]
    pub fn protocol(&self, name: &str) -> Option<Protocol> {
        self.store.read().protocol(name)
    }

    /// Every registered protocol, sorted by name.
    #[must_use]
    pub fn all_protocols(&self) -> Vec<Protocol> {
        let mut protocols = self.store.read().protocols().collect::<Vec<_>>();
        protocols.sort_by_key(|protocol| protocol.name());
        protocols
    }

    /// Offset of the instance variable `name` declared by `class` itself.
    /// `None` if `class` does not declare it or is not realized yet.
    #[must_use]
    pub fn ivar_offset(&self, class: Class, name: &str) -> Option<usize> {
        if !self.owns(class) {
            return None;
        }
        let data = self.store.read();
        let record = data.class(class);
        let index = record.ivars.iter().position(|ivar| ivar.name == name)?;
        record.ivar_offsets.get(index).copied()
    }

    /// The runtime's selector table.
    #[must_use]
    pub fn selectors(&self) -> &SelectorTable {
        &self.selectors
    }

    /// Interns `name`. Shorthand for `selectors().intern(name)`.
    pub fn selector(&self, name: &str) -> Selector {
        self.selectors.intern(name)
    }
}
