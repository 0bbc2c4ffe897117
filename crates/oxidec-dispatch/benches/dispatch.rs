// Dispatch benchmarks for the OxideC dispatch core
//
// These benchmarks measure the send fast path, selector registration and
// dispatch table construction, including copy-on-write updates from
// category loads.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use oxidec_dispatch::runtime::{
    CategoryRecord, ClassRecord, LoadDescriptor, MethodRecord, SparseArray,
};
use oxidec_dispatch::{Object, ObjectPtr, Receiver, Runtime, Selector};

unsafe extern "C-unwind" fn answer(_: ObjectPtr, _: Selector, _: *const *mut u8, ret: *mut u8) {
    unsafe { ret.cast::<u64>().write_unaligned(42) };
}

/// A runtime with a chain of `depth` classes, the root declaring `count`
/// methods.
fn chain(depth: usize, count: usize) -> Runtime {
    let runtime = Runtime::new();
    let mut root = ClassRecord::root("Class0");
    for i in 0..count {
        root = root.with_instance_method(MethodRecord::new(format!("method{i}"), "Q@:", answer));
    }
    let mut descriptor = LoadDescriptor::new().with_class(root);
    for level in 1..depth {
        descriptor = descriptor.with_class(
            ClassRecord::new(format!("Class{level}"), format!("Class{}", level - 1)),
        );
    }
    runtime.load(&descriptor);
    runtime
}

/// Benchmark the lock-free lookup on an installed table.
///
/// Depth should not matter: inherited entries are copied into each table.
fn bench_lookup_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup_hit");

    for depth in [1, 4, 16] {
        let runtime = chain(depth, 64);
        let leaf = runtime.class_named(&format!("Class{}", depth - 1)).unwrap();
        let receiver = Receiver::Object(Object::new(&leaf));
        let sel = runtime.register_selector("method32", Some("Q@:"));
        runtime.create_dispatch_table(&leaf);

        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| runtime.lookup(black_box(&receiver), black_box(sel)));
        });
    }

    group.finish();
}

/// Benchmark a full send, lookup plus call.
fn bench_send(c: &mut Criterion) {
    let runtime = chain(4, 16);
    let leaf = runtime.class_named("Class3").unwrap();
    let receiver = Receiver::Object(Object::new(&leaf));
    let sel = runtime.register_selector("method8", Some("Q@:"));

    c.bench_function("send", |b| {
        b.iter(|| {
            let mut ret = 0u64;
            unsafe { runtime.send(black_box(&receiver), sel, &[], (&raw mut ret).cast()) };
            ret
        });
    });
}

/// Benchmark selector registration: the read-locked hit path and typed
/// variants.
fn bench_register_selector(c: &mut Criterion) {
    let mut group = c.benchmark_group("register_selector");
    let runtime = Runtime::new();
    runtime.register_selector("existing:", Some("v@:@"));

    group.bench_function("existing_untyped", |b| {
        b.iter(|| runtime.register_selector(black_box("existing:"), None));
    });
    group.bench_function("existing_typed", |b| {
        b.iter(|| runtime.register_selector(black_box("existing:"), Some("v@:@")));
    });

    group.finish();
}

/// Benchmark building tables for a fresh hierarchy.
fn bench_table_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_build");
    group.sample_size(20);

    for count in [16, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.iter_with_setup(
                || chain(8, count),
                |runtime| {
                    let leaf = runtime.class_named("Class7").unwrap();
                    runtime.create_dispatch_table(&leaf)
                },
            );
        });
    }

    group.finish();
}

/// Benchmark a category load that updates tables already built for a
/// hierarchy.
fn bench_category_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("category_update");
    group.sample_size(20);

    group.bench_function("root_category", |b| {
        b.iter_with_setup(
            || {
                let runtime = chain(8, 64);
                runtime.create_dispatch_table(&runtime.class_named("Class7").unwrap());
                runtime
            },
            |runtime| {
                runtime.load(&LoadDescriptor::new().with_category(
                    CategoryRecord::new("Class0", "Patch")
                        .with_instance_method(MethodRecord::new("method3", "Q@:", answer)),
                ));
                runtime
            },
        );
    });

    group.finish();
}

/// Benchmark raw trie operations.
fn bench_sparse_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_array");

    let mut table = SparseArray::new(16);
    for key in 0..1024u32 {
        table.insert(key * 7, key);
    }

    group.bench_function("lookup", |b| {
        b.iter(|| table.lookup(black_box(700)));
    });
    group.bench_function("clone_and_insert", |b| {
        b.iter(|| {
            let mut copy = table.clone();
            copy.insert(black_box(701), 1);
            copy
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_lookup_hit,
    bench_send,
    bench_register_selector,
    bench_table_build,
    bench_category_update,
    bench_sparse_array
);
criterion_main!(benches);
