//! Sends racing with loads and registrations.

mod common;

use common::*;
use oxidec_dispatch::runtime::{CategoryRecord, ClassRecord, LoadDescriptor};
use oxidec_dispatch::{Imp, Runtime, Selector};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const SENDERS: usize = 4;
const CATEGORIES: usize = 50;

#[test]
fn test_sends_during_category_loads_see_whole_methods() {
    let runtime = Runtime::new();
    runtime.load(
        &LoadDescriptor::new()
            .with_class(
                ClassRecord::root("Base").with_instance_method(value_method("s", returns_1)),
            )
            .with_class(ClassRecord::new("Middle", "Base"))
            .with_class(
                ClassRecord::new("Leaf", "Middle")
                    .with_instance_method(value_method("own", returns_6)),
            ),
    );
    let s = value_selector(&runtime, "s");
    let own = value_selector(&runtime, "own");
    let done = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..SENDERS {
            scope.spawn(|| {
                let leaf = instance_of(&runtime, "Leaf");
                while !done.load(Ordering::Acquire) {
                    let value = send_u64(&runtime, &leaf, s);
                    assert!((1..=5).contains(&value), "torn send returned {value}");
                    assert_eq!(send_u64(&runtime, &leaf, own), 6);
                }
            });
        }

        let imps: [Imp; 4] = [returns_2, returns_3, returns_4, returns_5];
        for i in 0..CATEGORIES {
            let target = if i % 2 == 0 { "Base" } else { "Middle" };
            runtime.load(&LoadDescriptor::new().with_category(
                CategoryRecord::new(target, format!("Patch{i}"))
                    .with_instance_method(value_method("s", imps[i % imps.len()])),
            ));
        }
        done.store(true, Ordering::Release);
    });

    // The last categories were Patch48 on Base and Patch49 on Middle.
    assert_eq!(send_u64(&runtime, &instance_of(&runtime, "Leaf"), s), 3);
    assert_eq!(send_u64(&runtime, &instance_of(&runtime, "Base"), s), 2);
}

#[test]
fn test_concurrent_registration_agrees() {
    let runtime = Runtime::new();
    let names: Vec<String> = (0..100).map(|i| format!("message{i}:")).collect();

    let results: Vec<Vec<Selector>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    names
                        .iter()
                        .map(|name| runtime.register_selector(name, Some("v@:@")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    // One untyped and one typed entry per name.
    assert_eq!(runtime.selectors().len(), names.len() * 2);
}

#[test]
fn test_concurrent_class_sends_and_loads() {
    let runtime = Runtime::new();
    runtime.load(
        &LoadDescriptor::new()
            .with_class(
                ClassRecord::root("Root").with_instance_method(value_method("v", returns_1)),
            ),
    );
    let v = value_selector(&runtime, "v");

    thread::scope(|scope| {
        scope.spawn(|| {
            for i in 0..50 {
                runtime.load(
                    &LoadDescriptor::new().with_class(ClassRecord::new(format!("Sub{i}"), "Root")),
                );
            }
        });
        scope.spawn(|| {
            for _ in 0..200 {
                assert_eq!(send_u64(&runtime, &instance_of(&runtime, "Root"), v), 1);
            }
        });
    });

    for i in 0..50 {
        assert_eq!(send_u64(&runtime, &instance_of(&runtime, &format!("Sub{i}")), v), 1);
    }
}
