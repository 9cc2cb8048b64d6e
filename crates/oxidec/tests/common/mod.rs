// Common test utilities for integration tests
//
// This module provides shared helper functions and test fixtures
// for use across all integration tests.

#![allow(dead_code)]

use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
use oxidec::{Class, ObjectRef, Receiver, Runtime, Selector};
use std::sync::atomic::{AtomicUsize, Ordering};

static NAME_ID: AtomicUsize = AtomicUsize::new(0);

/// Returns `prefix` with a process-unique suffix.
pub fn unique_name(prefix: &str) -> String {
    let id = NAME_ID.fetch_add(1, Ordering::SeqCst);
    format!("{prefix}_{id}")
}

/// A fresh runtime with default options.
pub fn runtime() -> &'static Runtime {
    Runtime::builder().build().expect("Failed to build runtime")
}

/// Loads a single root class and returns it.
pub fn root_class(rt: &Runtime, name: &str, methods: &[(&str, oxidec::Imp)]) -> Class {
    let mut descriptor = ClassDescriptor::root(name);
    for &(selector, imp) in methods {
        descriptor = descriptor.method(selector, imp);
    }
    rt.load_image(ImageDescriptor::new(unique_name("image")).class(descriptor))
        .expect("Failed to load test class");
    rt.lookup_class(name).expect("Test class not registered")
}

/// Loads a subclass of `superclass` and returns it.
pub fn subclass(rt: &Runtime, name: &str, superclass: &str) -> Class {
    rt.load_image(ImageDescriptor::new(unique_name("image")).class(ClassDescriptor::subclass(name, superclass)))
        .expect("Failed to load test subclass");
    rt.lookup_class(name).expect("Test subclass not registered")
}

/// Sends `selector` with no arguments to a new instance of `class`.
pub fn send_to_instance(rt: &Runtime, class: Class, selector: &str) -> usize {
    let object = ObjectRef::new(class);
    rt.send(object.as_receiver(), rt.selector(selector), &[])
}

pub fn returns_1(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
    1
}

pub fn returns_2(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
    2
}

pub fn returns_3(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
    3
}

pub fn returns_first_arg(_: Receiver<'_>, _: Selector, args: &[usize]) -> usize {
    args.first().copied().unwrap_or(0)
}

/// Forwarding handler used to tell forwarded sends apart.
pub fn forwarded(_: Receiver<'_>, _: Selector, _: &[usize]) -> usize {
    usize::MAX
}
