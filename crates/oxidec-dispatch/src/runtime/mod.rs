//! `OxideC` dispatch runtime.
//!
//! A [`Runtime`] owns every piece of shared dispatch state: the selector
//! table, the class registry, per-class dispatch tables, the initialize
//! lookaside list and the hook slots. Nothing lives in process globals, so
//! independent runtimes can coexist (tests create one each).
//!
//! # Architecture
//!
//! - [`sparse`]: copy-on-write 256-way trie backing every dispatch table
//! - [`selector`] and [`encoding`]: selector uniquing and signature rules
//! - [`class`]: classes, method lists, the class table and the resolver
//! - [`dtable`]: building, merging and rebasing dispatch tables
//! - [`initialize`]: first-dispatch protocol around `+initialize`
//! - [`object`]: receivers and the opaque pointer handed to implementations
//! - [`dispatch`] and [`forwarding`]: the send path and its fallbacks
//! - [`loader`]: consumption of class and category records
//! - [`introspection`]: dynamic classes and read-only queries
//!
//! # Locking
//!
//! Structural mutation (selector registration, class insertion and
//! resolution, table construction and updates) is serialized behind one
//! recursive runtime lock. The send path takes no lock once a class's table
//! is installed: it loads the table pointer and walks the trie.
//!
//! # Example
//!
//! ```
//! use oxidec_dispatch::runtime::{ClassRecord, LoadDescriptor, MethodRecord, Receiver, Runtime};
//! use oxidec_dispatch::runtime::object::ObjectPtr;
//! use oxidec_dispatch::runtime::selector::Selector;
//!
//! unsafe extern "C-unwind" fn answer(_: ObjectPtr, _: Selector, _: *const *mut u8, ret: *mut u8) {
//!     unsafe { ret.cast::<u64>().write_unaligned(42) };
//! }
//!
//! let runtime = Runtime::new();
//! runtime.load(&LoadDescriptor::new().with_class(
//!     ClassRecord::root("Root").with_class_method(MethodRecord::new("answer", "Q@:", answer)),
//! ));
//!
//! let root = runtime.class_named("Root").unwrap();
//! let sel = runtime.register_selector("answer", None);
//! let mut ret = 0u64;
//! unsafe { runtime.send(&Receiver::Class(root), sel, &[], (&raw mut ret).cast()) };
//! assert_eq!(ret, 42);
//! ```

pub mod class;
pub mod dispatch;
pub mod dtable;
pub mod encoding;
pub mod forwarding;
pub mod initialize;
pub mod introspection;
pub mod loader;
pub mod object;
pub mod selector;
pub mod sparse;

pub use class::{Class, ClassFlags, ClassTable, Imp, InitState, Ivar, Method, MethodList};
pub use dispatch::Lookup;
pub use dtable::DispatchTable;
pub use forwarding::{ForwardingHook, TypeMismatchHook};
pub use loader::{
    CategoryRecord, ClassRecord, LoadDescriptor, LoadReport, MethodRecord, RECORD_ABI_VERSION,
};
pub use object::{Object, ObjectPtr, Receiver, SmallObject};
pub use selector::{DispatchPolicy, Selector, SelectorInfo, SelectorTable};
pub use sparse::SparseArray;

use crate::error::{Error, Result};
use arc_swap::ArcSwapOption;
use oxidec_log::Level;
use parking_lot::{Condvar, Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Version reported for lookups that must never be cached: nil receivers,
/// unregistered selectors, type mismatches and forwarded sends.
pub const CACHE_NEVER: u64 = 0;

/// Environment variable read by [`RuntimeConfig::from_env`].
pub const DISPATCH_POLICY_ENV_VAR: &str = "OXIDEC_DISPATCH_POLICY";

/// Number of small-object tags, including the unused tag 0.
pub(crate) const SMALL_OBJECT_SLOTS: usize = 8;

/// Construction-time settings of a [`Runtime`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Mapping of typed selectors onto dispatch slots; fixed for the life of
    /// the runtime.
    pub dispatch_policy: DispatchPolicy,
    /// Key depth, in bits, of freshly created root dispatch tables. Tables
    /// grow automatically when a larger selector index is inserted.
    pub initial_table_depth: u32,
    /// Log level applied when the runtime is created, if any.
    pub log_level: Option<Level>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            dispatch_policy: DispatchPolicy::default(),
            initial_table_depth: 16,
            log_level: None,
        }
    }
}

impl RuntimeConfig {
    /// Reads `OXIDEC_DISPATCH_POLICY` and `OXIDEC_LOG` on top of the
    /// defaults. Invalid values are logged and ignored. A set `OXIDEC_LOG`
    /// is applied to the logger immediately.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = RuntimeConfig::default();
        if let Ok(value) = std::env::var(DISPATCH_POLICY_ENV_VAR) {
            match value.parse() {
                Ok(policy) => config.dispatch_policy = policy,
                Err(e) => oxidec_log::warn!("{DISPATCH_POLICY_ENV_VAR}: {e}"),
            }
        }
        if std::env::var_os(oxidec_log::LOG_ENV_VAR).is_some() {
            config.log_level = Some(oxidec_log::init_from_env());
        }
        config
    }

    /// Sets the dispatch policy.
    #[must_use]
    pub fn with_dispatch_policy(mut self, policy: DispatchPolicy) -> Self {
        self.dispatch_policy = policy;
        self
    }

    /// Sets the initial depth of root dispatch tables.
    #[must_use]
    pub fn with_initial_table_depth(mut self, depth: u32) -> Self {
        self.initial_table_depth = depth;
        self
    }

    /// Sets the log level applied at construction.
    #[must_use]
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = Some(level);
        self
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeStats {
    /// Dispatch tables constructed from scratch (not merges or rebases).
    pub tables_built: u64,
    /// Current cache version.
    pub cache_version: u64,
    /// Classes in the class table, metaclasses excluded.
    pub classes: usize,
    /// Registered selectors, typed variants included.
    pub selectors: usize,
}

/// Wakes threads waiting for a superclass to be loaded.
#[derive(Default)]
pub(crate) struct ResolutionSignal {
    pub(crate) generation: Mutex<u64>,
    pub(crate) loaded: Condvar,
}

impl ResolutionSignal {
    pub(crate) fn current(&self) -> u64 {
        *self.generation.lock()
    }

    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.loaded.notify_all();
    }

    pub(crate) fn wait_past(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.loaded.wait(&mut generation);
        }
    }
}

/// Tables published while `+initialize` runs for their class.
pub(crate) type Lookaside = SmallVec<[(Class, Arc<DispatchTable>); 8]>;

/// The dispatch runtime.
///
/// `Runtime` is `Send + Sync`; share it between threads behind an `Arc` or a
/// `static`.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) lock: ReentrantMutex<()>,
    pub(crate) selectors: SelectorTable,
    pub(crate) classes: RwLock<ClassTable>,
    pub(crate) resolution: ResolutionSignal,
    pub(crate) lookaside: Mutex<Lookaside>,
    pub(crate) small_classes: [ArcSwapOption<class::ClassInner>; SMALL_OBJECT_SLOTS],
    pub(crate) forwarding_hook: RwLock<Option<ForwardingHook>>,
    pub(crate) mismatch_hook: RwLock<Option<TypeMismatchHook>>,
    pub(crate) loader: Mutex<loader::LoaderState>,
    version: AtomicU64,
    tables_built: AtomicU64,
}

impl Runtime {
    /// Creates a runtime with [`RuntimeConfig::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    /// Creates a runtime with an explicit configuration.
    #[must_use]
    pub fn with_config(config: RuntimeConfig) -> Self {
        if let Some(level) = config.log_level {
            oxidec_log::set_level(level);
        }
        #[cfg(feature = "fatal_backtrace")]
        oxidec_log::set_fatal_hook(print_backtrace);

        oxidec_log::debug!(
            "runtime created ({:?}, table depth {})",
            config.dispatch_policy,
            config.initial_table_depth
        );
        Runtime {
            selectors: SelectorTable::new(config.dispatch_policy),
            config,
            lock: ReentrantMutex::new(()),
            classes: RwLock::new(ClassTable::default()),
            resolution: ResolutionSignal::default(),
            lookaside: Mutex::new(SmallVec::new()),
            small_classes: std::array::from_fn(|_| ArcSwapOption::empty()),
            forwarding_hook: RwLock::new(None),
            mismatch_hook: RwLock::new(None),
            loader: Mutex::new(loader::LoaderState::default()),
            version: AtomicU64::new(1),
            tables_built: AtomicU64::new(0),
        }
    }

    /// The configuration this runtime was created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The dispatch policy selectors are keyed under.
    #[must_use]
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        self.config.dispatch_policy
    }

    /// Acquires the runtime lock. Recursive on the owning thread.
    pub(crate) fn lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.lock.lock()
    }

    /// Current cache version. Starts at 1 and increases on every structural
    /// change that can invalidate an earlier lookup.
    #[must_use]
    pub fn cache_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn count_table_built(&self) {
        self.tables_built.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot of the runtime counters.
    #[must_use]
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            tables_built: self.tables_built.load(Ordering::Relaxed),
            cache_version: self.cache_version(),
            classes: self.classes.read().len(),
            selectors: self.selectors.len(),
        }
    }

    /// The selector table of this runtime.
    #[must_use]
    pub fn selectors(&self) -> &SelectorTable {
        &self.selectors
    }

    /// Uniques `(name, types)` under the runtime lock.
    pub fn register_selector(&self, name: &str, types: Option<&str>) -> Selector {
        let _guard = self.lock();
        self.selectors.register(name, types)
    }

    /// Finds a registered selector without registering it.
    #[must_use]
    pub fn lookup_selector(&self, name: &str, types: Option<&str>) -> Option<Selector> {
        self.selectors.lookup(name, types)
    }

    /// Name of `sel`, if it belongs to this runtime.
    #[must_use]
    pub fn selector_name(&self, sel: Selector) -> Option<Arc<str>> {
        self.selectors.name(sel)
    }

    /// Signature of `sel`, if it is a typed selector of this runtime.
    #[must_use]
    pub fn selector_types(&self, sel: Selector) -> Option<Arc<str>> {
        self.selectors.types(sel)
    }

    /// Name, signature and untyped variant of `sel`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SelectorNotRegistered`] if another runtime issued
    /// `sel`.
    pub fn selector_info(&self, sel: Selector) -> Result<SelectorInfo> {
        self.selectors
            .info(sel)
            .ok_or(Error::SelectorNotRegistered { index: sel.index() })
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("policy", &self.config.dispatch_policy)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Drop for Runtime {
    /// Superclass links form cycles through root metaclasses; cut them so
    /// classes not referenced from outside are freed with the runtime.
    fn drop(&mut self) {
        let classes = self.classes.get_mut();
        for class in classes.all().into_iter().chain(classes.unresolved()) {
            class.unlink_for_teardown();
            if let Some(meta) = class.metaclass() {
                meta.unlink_for_teardown();
            }
        }
    }
}

#[cfg(feature = "fatal_backtrace")]
fn print_backtrace() {
    eprintln!("{:?}", backtrace::Backtrace::new());
}
