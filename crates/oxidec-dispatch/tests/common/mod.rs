// Shared fixtures for the integration tests.
//
// Test implementations return a distinct `u64` so a send can be checked by
// calling through the lookup rather than comparing function pointers.

#![allow(dead_code)]

use oxidec_dispatch::{MethodRecord, Object, ObjectPtr, Receiver, Runtime, Selector};

/// Signature shared by the value-returning test methods.
pub const VALUE_TYPES: &str = "Q@:";

macro_rules! returning_imp {
    ($($name:ident => $value:expr),* $(,)?) => {
        $(
            pub unsafe extern "C-unwind" fn $name(
                _: ObjectPtr,
                _: Selector,
                _: *const *mut u8,
                ret: *mut u8,
            ) {
                if !ret.is_null() {
                    unsafe { ret.cast::<u64>().write_unaligned($value) };
                }
            }
        )*
    };
}

returning_imp! {
    returns_1 => 1,
    returns_2 => 2,
    returns_3 => 3,
    returns_4 => 4,
    returns_5 => 5,
    returns_6 => 6,
}

/// A method returning a fixed value under [`VALUE_TYPES`].
pub fn value_method(name: &str, imp: oxidec_dispatch::Imp) -> MethodRecord {
    MethodRecord::new(name, VALUE_TYPES, imp)
}

/// Sends `sel` to `receiver` and reads the `u64` it returns.
pub fn send_u64(runtime: &Runtime, receiver: &Receiver, sel: Selector) -> u64 {
    let lookup = runtime.lookup(receiver, sel);
    let mut ret = 0u64;
    unsafe { lookup.invoke(sel, &[], (&raw mut ret).cast()) };
    ret
}

/// A fresh instance of the class named `name`.
pub fn instance_of(runtime: &Runtime, name: &str) -> Receiver {
    let class = runtime
        .class_named(name)
        .unwrap_or_else(|| panic!("class {name} not loaded"));
    Receiver::Object(Object::new(&class))
}

/// The typed selector used by [`value_method`] records.
pub fn value_selector(runtime: &Runtime, name: &str) -> Selector {
    runtime.register_selector(name, Some(VALUE_TYPES))
}
