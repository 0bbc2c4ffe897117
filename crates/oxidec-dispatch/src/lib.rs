//! `OxideC` dispatch core.
//!
//! The message-dispatch heart of a dynamic, class-based object runtime:
//!
//! - **Selector uniquing** with typed variants chained under each name
//! - **Class registry** that links classes as their superclasses arrive
//! - **Copy-on-write dispatch tables** shared between a class and its
//!   unmodified subclasses, updated incrementally as categories load
//! - **Lock-free sends** once a class's table is installed
//! - **`+initialize` protocol** that runs each class initializer exactly
//!   once while other threads wait
//!
//! # Architecture
//!
//! Everything hangs off a [`Runtime`]. Loading a [`LoadDescriptor`] registers
//! selectors and classes; the first send to a class builds its table; the
//! send path ([`Runtime::lookup`]) reads installed tables without locking.
//!
//! # Example
//!
//! ```
//! use oxidec_dispatch::{
//!     ClassRecord, LoadDescriptor, MethodRecord, Object, ObjectPtr, Receiver, Runtime, Selector,
//! };
//!
//! unsafe extern "C-unwind" fn area(_: ObjectPtr, _: Selector, _: *const *mut u8, ret: *mut u8) {
//!     unsafe { ret.cast::<f64>().write_unaligned(12.5) };
//! }
//!
//! let runtime = Runtime::new();
//! runtime.load(
//!     &LoadDescriptor::new()
//!         .with_class(ClassRecord::root("Object"))
//!         .with_class(
//!             ClassRecord::new("Shape", "Object")
//!                 .with_instance_method(MethodRecord::new("area", "d@:", area)),
//!         ),
//! );
//!
//! let shape = Object::new(&runtime.class_named("Shape").unwrap());
//! let sel = runtime.register_selector("area", Some("d@:"));
//! let lookup = runtime.lookup(&Receiver::Object(shape), sel);
//!
//! let mut ret = 0.0f64;
//! unsafe { lookup.invoke(sel, &[], (&raw mut ret).cast()) };
//! assert_eq!(ret, 12.5);
//! ```

pub mod error;
pub mod runtime;

pub use error::{Error, Result};
pub use runtime::{
    CACHE_NEVER, CategoryRecord, Class, ClassFlags, ClassRecord, DispatchPolicy, Imp, InitState,
    Ivar, LoadDescriptor, Lookup, Method, MethodList, MethodRecord, Object, ObjectPtr, Receiver,
    Runtime, RuntimeConfig, RuntimeStats, Selector, SmallObject,
};
