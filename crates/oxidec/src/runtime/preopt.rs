//! Preoptimized tables built ahead of time.
//!
//! A [`PreoptimizedTable`] lists selectors and classes known before the
//! runtime starts. Its selectors become the canonical tokens for their names
//! and are found without any lock. Its classes are loaded as image 0 when
//! the runtime is built, realized eagerly, and published in a read-only map
//! that class lookup consults before taking the structural lock.
//!
//! # Example
//!
//! ```
//! use oxidec::runtime::Runtime;
//! use oxidec::runtime::loader::ClassDescriptor;
//! use oxidec::runtime::preopt::PreoptimizedTable;
//!
//! let table = PreoptimizedTable::builder()
//!     .selector("description")
//!     .class(ClassDescriptor::root("Base"))
//!     .build();
//!
//! let rt = Runtime::builder().preoptimized(table).build().unwrap();
//! assert!(rt.selectors().lookup_preoptimized("description").is_some());
//! assert!(rt.lookup_class("Base").unwrap().is_realized());
//! ```

use crate::error::Result;
use crate::runtime::Runtime;
use crate::runtime::class::Class;
use crate::runtime::loader::{ClassDescriptor, ImageDescriptor, ImageId};
use crate::runtime::store::StoreData;
use fxhash::FxHashMap;
use log::debug;

/// Selectors and classes installed when a runtime is built.
#[derive(Debug, Clone, Default)]
pub struct PreoptimizedTable {
    selectors: Vec<String>,
    classes: Vec<ClassDescriptor>,
}

impl PreoptimizedTable {
    /// Starts an empty table.
    #[must_use]
    pub fn builder() -> PreoptimizedTableBuilder {
        PreoptimizedTableBuilder::default()
    }

    /// Selector names, including every method name of the classes.
    pub fn selector_names(&self) -> impl Iterator<Item = &str> {
        let methods = self.classes.iter().flat_map(|class| {
            class
                .instance_methods
                .iter()
                .chain(&class.class_methods)
                .map(|method| method.selector.as_str())
        });
        self.selectors.iter().map(String::as_str).chain(methods)
    }

    /// The classes, in load order.
    #[must_use]
    pub fn classes(&self) -> &[ClassDescriptor] {
        &self.classes
    }

    /// Returns true if the table has neither selectors nor classes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty() && self.classes.is_empty()
    }
}

/// Builder for [`PreoptimizedTable`].
#[derive(Debug, Default)]
pub struct PreoptimizedTableBuilder {
    table: PreoptimizedTable,
}

impl PreoptimizedTableBuilder {
    /// Adds a selector name.
    #[must_use]
    pub fn selector(mut self, name: impl Into<String>) -> Self {
        self.table.selectors.push(name.into());
        self
    }

    /// Adds a class. Superclasses must come from this table too.
    #[must_use]
    pub fn class(mut self, class: ClassDescriptor) -> Self {
        self.table.classes.push(class);
        self
    }

    /// Finishes the table.
    #[must_use]
    pub fn build(self) -> PreoptimizedTable {
        self.table
    }
}

impl Runtime {
    /// Loads and realizes the preoptimized classes as image 0, then
    /// publishes them for lock-free lookup.
    pub(crate) fn install_preoptimized(&self, table: &PreoptimizedTable) -> Result<()> {
        if table.classes.is_empty() {
            return Ok(());
        }

        let mut data = self.store.write();
        let image = ImageDescriptor {
            name: "preoptimized".to_string(),
            classes: table.classes.clone(),
            ..ImageDescriptor::default()
        };
        let report = self.load_image_locked(&mut data, ImageId::PREOPTIMIZED, image)?;
        self.realize_preoptimized(&mut data, &report.classes)?;

        let published: FxHashMap<&'static str, Class> = report
            .classes
            .iter()
            .map(|&class| (class.name(), class))
            .collect();
        debug!("published {} preoptimized classes", published.len());
        let _ = self.preopt_classes.set(published);
        Ok(())
    }

    fn realize_preoptimized(&self, data: &mut StoreData, classes: &[Class]) -> Result<()> {
        for &class in classes {
            self.realize_locked(data, class)?;
        }
        Ok(())
    }
}
