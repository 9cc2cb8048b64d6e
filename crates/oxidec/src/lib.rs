//! `OxideC` runtime core: Objective-C style message dispatch for Rust.
//!
//! `OxideC` resolves (receiver, selector) pairs to method implementations at
//! run time. It provides:
//!
//! - **Dynamic Dispatch** with per-class lock-free method caches
//! - **Runtime Mutation** of method lists, with cache invalidation that no
//!   concurrent reader can miss
//! - **Tagged Pointers** for small values that are never dereferenced
//! - **Categories and Metaclasses** with a deterministic override order
//! - **Ranked Locks** that turn lock-order mistakes into immediate panics
//!
//! # Architecture
//!
//! - **Runtime Layer** ([`runtime`]): identity, selectors, class store,
//!   caches, dispatch and locking
//! - **Configuration** ([`config`]): diagnostic switches read from the
//!   environment
//! - **Memory Layer** (`oxidex-mem`): the arena that holds metadata for the
//!   runtime's lifetime
//!
//! # Example
//!
//! ```rust
//! use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
//! use oxidec::{ObjectRef, Receiver, Runtime, Selector};
//!
//! fn area(_: Receiver<'_>, _: Selector, args: &[usize]) -> usize {
//!     args[0] * args[1]
//! }
//!
//! let rt = Runtime::builder().build().unwrap();
//! rt.load_image(
//!     ImageDescriptor::new("shapes")
//!         .class(ClassDescriptor::root("Shape"))
//!         .class(ClassDescriptor::subclass("Rect", "Shape").method("areaWith:and:", area)),
//! )
//! .unwrap();
//!
//! let rect = ObjectRef::new(rt.lookup_class("Rect").unwrap());
//! let sel = rt.selector("areaWith:and:");
//! assert_eq!(rt.send(rect.as_receiver(), sel, &[3, 4]), 12);
//! ```

pub mod config;
pub mod error;
pub mod runtime;

// Re-export commonly used types
pub use config::RuntimeOptions;
pub use error::{Error, Result};
pub use runtime::{
    Class, ClassState, EntryPoint, Imp, Method, Object, ObjectRef, Protocol, Receiver,
    Runtime, Selector, TaggedPointer,
};
