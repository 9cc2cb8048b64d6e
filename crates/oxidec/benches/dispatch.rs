// Dispatch benchmarks
//
// This benchmark suite measures:
// - Cached dispatch (the lock-free fast path)
// - First dispatch after a cache flush
// - Inheritance traversal cost on a cache miss
// - Multi-threaded cached dispatch
// - Selector interning

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxidec::runtime::loader::{ClassDescriptor, ImageDescriptor};
use oxidec::{Class, ObjectRef, Receiver, Runtime, Selector};
use std::thread;

fn bench_method(_: Receiver<'_>, _: Selector, args: &[usize]) -> usize {
    args.len()
}

/// Loads a chain of `depth` classes; the method lives on the root.
fn hierarchy(rt: &Runtime, depth: usize) -> Class {
    let mut image = ImageDescriptor::new(format!("depth{depth}"))
        .class(ClassDescriptor::root(format!("D{depth}_0")).method("target", bench_method));
    for level in 1..depth {
        image = image.class(ClassDescriptor::subclass(
            format!("D{depth}_{level}"),
            format!("D{depth}_{}", level - 1),
        ));
    }
    rt.load_image(image).unwrap();
    rt.lookup_class(&format!("D{depth}_{}", depth - 1)).unwrap()
}

/// Benchmark cached message send - repeated calls to same method
fn bench_cached_dispatch(c: &mut Criterion) {
    let rt = Runtime::builder().build().unwrap();
    let class = hierarchy(rt, 1);
    let object = ObjectRef::new(class);
    let sel = rt.selector("target");
    rt.send(object.as_receiver(), sel, &[]);

    c.bench_function("cached_dispatch", |b| {
        b.iter(|| black_box(rt.send(black_box(object.as_receiver()), black_box(sel), &[])));
    });
}

/// Benchmark the slow path: flush, then dispatch once
fn bench_uncached_dispatch(c: &mut Criterion) {
    let rt = Runtime::builder().build().unwrap();
    let class = hierarchy(rt, 1);
    let object = ObjectRef::new(class);
    let sel = rt.selector("target");
    rt.send(object.as_receiver(), sel, &[]);

    c.bench_function("uncached_dispatch", |b| {
        b.iter(|| {
            rt.invalidate_caches(class);
            black_box(rt.send(object.as_receiver(), sel, &[]))
        });
    });
}

/// Benchmark a cache miss that walks `depth` classes
fn bench_hierarchy_miss(c: &mut Criterion) {
    let rt = Runtime::builder().build().unwrap();
    let mut group = c.benchmark_group("hierarchy_miss");

    for depth in [1, 4, 16, 64] {
        let leaf = hierarchy(rt, depth);
        let object = ObjectRef::new(leaf);
        let sel = rt.selector("target");
        rt.send(object.as_receiver(), sel, &[]);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                rt.invalidate_caches(leaf);
                black_box(rt.send(object.as_receiver(), sel, &[]))
            });
        });
    }
    group.finish();
}

/// Benchmark cached dispatch from several threads at once
fn bench_concurrent_dispatch(c: &mut Criterion) {
    let rt = Runtime::builder().build().unwrap();
    let class = hierarchy(rt, 1);
    let sel = rt.selector("target");
    let mut group = c.benchmark_group("concurrent_dispatch");

    for threads in [2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, &threads| {
            b.iter(|| {
                let handles: Vec<_> = (0..threads)
                    .map(|_| {
                        thread::spawn(move || {
                            let object = ObjectRef::new(class);
                            let mut total = 0;
                            for _ in 0..1000 {
                                total += rt.send(object.as_receiver(), sel, &[1]);
                            }
                            total
                        })
                    })
                    .collect();
                for handle in handles {
                    black_box(handle.join().unwrap());
                }
            });
        });
    }
    group.finish();
}

/// Benchmark selector interning: existing names and fresh ones
fn bench_interning(c: &mut Criterion) {
    let rt = Runtime::builder().build().unwrap();
    rt.selector("existing:selector:");

    c.bench_function("intern_existing", |b| {
        b.iter(|| black_box(rt.selector(black_box("existing:selector:"))));
    });

    let mut counter = 0usize;
    c.bench_function("intern_new", |b| {
        b.iter(|| {
            counter += 1;
            black_box(rt.selector(&format!("fresh{counter}:")))
        });
    });
}

criterion_group!(
    benches,
    bench_cached_dispatch,
    bench_uncached_dispatch,
    bench_hierarchy_miss,
    bench_concurrent_dispatch,
    bench_interning
);
criterion_main!(benches);
