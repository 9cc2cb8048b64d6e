//! Several runtimes in one process: classes stay with the runtime that
//! loaded them.

mod common;

use common::*;
use oxidec::runtime::LookupMode;
use oxidec::runtime::loader::{ImageDescriptor, ProtocolDescriptor};
use oxidec::{Class, Error, ObjectRef, Runtime, Selector, TaggedPointer};

#[test]
fn test_mutating_a_class_of_another_runtime_fails() {
    let a = runtime();
    let b = runtime();
    let a_only = root_class(a, "AOnly", &[("m", returns_1)]);
    let b_only = root_class(b, "BOnly", &[("m", returns_2)]);
    let extra = b.selector("extra");

    let foreign = Error::ForeignClass {
        class: "AOnly".to_string(),
    };
    assert_eq!(b.add_method(a_only, extra, returns_3, "v@:"), Err(foreign.clone()));
    assert_eq!(b.add_class_method(a_only, extra, returns_3, "v@:"), Err(foreign.clone()));
    assert_eq!(
        b.replace_method(a_only, extra, returns_3, "v@:").err(),
        Some(foreign.clone())
    );
    assert_eq!(
        b.exchange_implementations(a_only, b.selector("m"), extra),
        Err(foreign.clone())
    );
    assert_eq!(b.realize(a_only), Err(foreign.clone()));
    assert_eq!(b.initialize(a_only), Err(foreign.clone()));
    assert_eq!(b.register_tagged_class(3, a_only), Err(foreign));

    // Neither runtime's own classes picked anything up.
    assert!(!b.responds_to(b_only, extra));
    assert!(!a.responds_to(a_only, a.selector("extra")));
    assert!(b.tagged_classes().get(3).is_none());
}

#[test]
fn test_dispatch_to_foreign_instance_forwards() {
    let a = runtime();
    let b = Runtime::builder().forward_handler(forwarded).build().unwrap();
    let a_only = root_class(a, "AOnly", &[("m", returns_1)]);
    root_class(b, "BOnly", &[("m", returns_2)]);

    let object = ObjectRef::new(a_only);
    assert_eq!(a.send(object.as_receiver(), a.selector("m"), &[]), 1);
    assert_eq!(b.send(object.as_receiver(), b.selector("m"), &[]), usize::MAX);
    assert!(b.dispatch_or_nil(object.as_receiver(), b.selector("m")).is_none());
    assert!(b.lookup(a_only.as_receiver(), b.selector("m"), LookupMode::OrNil).entry.is_none());
}

#[test]
fn test_setters_ignore_foreign_classes() {
    let a = runtime();
    let b = runtime();
    let a_only = root_class(a, "AOnly", &[]);
    let b_only = root_class(b, "BOnly", &[]);
    b.load_image(ImageDescriptor::new("protocols").protocol(ProtocolDescriptor::new("Shared")))
        .unwrap();
    let shared = b.protocol("Shared").unwrap();

    b.set_resolver(a_only, |_: &Runtime, _: Class, _: Selector| true);
    b.set_initializer(a_only, |_, _| panic!("never runs"));
    assert!(!b.add_protocol(a_only, shared));
    b.invalidate_caches(a_only);

    assert!(b.adopted_protocols(b_only).is_empty());
    assert!(b.adopted_protocols(a_only).is_empty());
    assert!(!b.conforms_to(a_only, shared));

    // The initializer was not installed anywhere, in either runtime.
    assert_eq!(send_to_instance(a, a_only, "missing"), 0);
    assert!(a_only.is_initialized());
}

#[test]
fn test_queries_about_foreign_classes_are_empty() {
    let a = runtime();
    let b = runtime();
    root_class(a, "Base", &[("m", returns_1)]);
    let derived = subclass(a, "Derived", "Base");
    root_class(b, "Other", &[("m", returns_2)]);

    assert!(a.owns(derived));
    assert!(!b.owns(derived));
    assert_eq!(b.superclass(derived), None);
    assert!(b.subclasses(a.lookup_class("Base").unwrap()).is_empty());
    assert_eq!(b.class_hierarchy(derived), vec![derived]);
    assert!(b.instance_methods(derived).is_empty());
    assert!(b.class_methods(derived).is_empty());
    assert!(!b.responds_to(derived, b.selector("m")));
    assert_eq!(b.method_provider(derived, b.selector("m")), None);
    assert_eq!(b.ivar_offset(derived, "anything"), None);
}

#[test]
fn test_tagged_slots_are_per_runtime() {
    let a = runtime();
    let b = runtime();
    let number = root_class(a, "Number", &[("m", returns_1)]);
    a.register_tagged_class(2, number).unwrap();

    let tagged = TaggedPointer::new(2, 7).unwrap();
    assert_eq!(a.class_of(tagged.into()), Some(number));
    assert_eq!(b.class_of(tagged.into()), None);
}
