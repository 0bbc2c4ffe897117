//! Classes, methods and the class registry for the `OxideC` runtime.
//!
//! This module provides:
//! - [`Method`] and [`MethodList`]: implementations as declared by a class
//!   or category
//! - [`Class`]: a reference-counted handle to class metadata, including the
//!   dispatch table slot read by the send path
//! - [`ClassTable`]: the name table plus the worklist of classes whose
//!   superclass has not been loaded yet
//! - resolution: linking a class, its metaclass and the subclass
//!   back-references once the superclass is known
//!
//! # Ownership
//!
//! A class holds its metaclass strongly; the metaclass refers back to its
//! instance class weakly. Subclass back-references are weak as well, so the
//! only strong cycle is a root metaclass whose superclass is the root class.
//! [`Runtime`]'s `Drop` cuts those links.
//!
//! # Thread Safety
//!
//! Every mutation goes through the runtime lock. Fields the send path reads
//! (flags, the dispatch table pointer) are atomics; the remaining fields use
//! `parking_lot::RwLock` so introspection can read them from any thread.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::dtable::DispatchTable;
use crate::runtime::object::ObjectPtr;
use crate::runtime::selector::Selector;
use arc_swap::ArcSwapOption;
use bitflags::bitflags;
use fxhash::FxHashMap;
use parking_lot::{ReentrantMutex, RwLock};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

/// Method implementation function pointer.
///
/// Implementations follow the runtime's calling convention:
///
/// - `receiver`: the object the message was sent to (possibly substituted
///   by forwarding)
/// - `cmd`: the selector being sent
/// - `args`: pointer to an array of pointers to the explicit arguments
/// - `ret`: storage for the return value, sized by the method's return type
///
/// # Safety
///
/// Implementations must only dereference `args` and `ret` according to the
/// method's type encoding, and must tolerate a null `ret` for `void`
/// methods. A panic may unwind out of an implementation; an unwinding
/// `+initialize` still leaves its class's tables installed.
pub type Imp = unsafe extern "C-unwind" fn(
    receiver: ObjectPtr,
    cmd: Selector,
    args: *const *mut u8,
    ret: *mut u8,
);

/// A selector bound to an implementation.
///
/// Methods are immutable and shared as `Arc<Method>`; two table entries hold
/// "the same method" only if they point at the same allocation.
pub struct Method {
    selector: Selector,
    untyped: Selector,
    imp: Imp,
    types: Arc<str>,
}

impl Method {
    pub(crate) fn new(selector: Selector, untyped: Selector, imp: Imp, types: Arc<str>) -> Self {
        Method {
            selector,
            untyped,
            imp,
            types,
        }
    }

    /// Selector this method was declared under.
    #[must_use]
    pub fn selector(&self) -> Selector {
        self.selector
    }

    /// Canonical untyped selector for the method's name.
    #[must_use]
    pub fn untyped_selector(&self) -> Selector {
        self.untyped
    }

    /// The implementation.
    #[must_use]
    pub fn imp(&self) -> Imp {
        self.imp
    }

    /// Type encoding the method was declared with.
    #[must_use]
    pub fn types(&self) -> &str {
        &self.types
    }

    /// Dispatch keys this method is installed under: its own slot, plus the
    /// untyped slot of its name when the policy keys them separately.
    pub(crate) fn install_keys(&self) -> impl Iterator<Item = u32> {
        let own = self.selector.dispatch_key();
        let untyped = self.untyped.dispatch_key();
        std::iter::once(own).chain((untyped != own).then_some(untyped))
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("selector", &self.selector)
            .field("imp", &format!("{:p}", self.imp as *const ()))
            .field("types", &&*self.types)
            .finish()
    }
}

/// Methods declared together by a class or one category.
#[derive(Debug, Default)]
pub struct MethodList {
    methods: Vec<Arc<Method>>,
    category: Option<Arc<str>>,
}

impl MethodList {
    pub(crate) fn new(methods: Vec<Arc<Method>>, category: Option<Arc<str>>) -> Self {
        MethodList { methods, category }
    }

    /// Methods in declaration order.
    #[must_use]
    pub fn methods(&self) -> &[Arc<Method>] {
        &self.methods
    }

    /// Name of the category that contributed this list, `None` for a
    /// class's own methods.
    #[must_use]
    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Number of methods.
    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if the list declares nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// An instance variable as recorded by the compiler. The runtime carries
/// ivars for introspection and does not interpret them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ivar {
    /// Variable name.
    pub name: String,
    /// Type encoding.
    pub types: String,
    /// Byte offset within the instance.
    pub offset: usize,
}

impl Ivar {
    /// Creates an ivar description.
    #[must_use]
    pub fn new(name: impl Into<String>, types: impl Into<String>, offset: usize) -> Self {
        Ivar {
            name: name.into(),
            types: types.into(),
            offset,
        }
    }
}

bitflags! {
    /// Lifecycle and kind bits of a class.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ClassFlags: u32 {
        /// Linked to its superclass; appears in subclass chains.
        const RESOLVED = 1 << 0;
        /// The initialize protocol has started for this class.
        const INITIALIZED = 1 << 1;
        /// This is a metaclass.
        const META = 1 << 2;
        /// No superclass.
        const ROOT = 1 << 3;
        /// Created with `allocate_class_pair`.
        const USER_CREATED = 1 << 4;
        /// Present in the class table.
        const REGISTERED = 1 << 5;
    }
}

/// Where a class is in the first-dispatch lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InitState {
    /// No dispatch table has been built.
    NoTable,
    /// Tables are built and `+initialize` is running; only the initializing
    /// thread may dispatch to the class.
    Initializing,
    /// The dispatch table is installed.
    Installed,
}

pub(crate) struct ClassInner {
    name: Arc<str>,
    superclass_name: Option<Arc<str>>,
    superclass: RwLock<Option<Class>>,
    metaclass: Option<Class>,
    instance_class: Weak<ClassInner>,
    ivars: Vec<Ivar>,
    method_lists: RwLock<Vec<Arc<MethodList>>>,
    protocols: RwLock<Vec<Arc<str>>>,
    subclasses: RwLock<Vec<Weak<ClassInner>>>,
    dtable: ArcSwapOption<DispatchTable>,
    flags: AtomicU32,
    init_lock: ReentrantMutex<()>,
}

impl ClassInner {
    fn new(
        name: Arc<str>,
        superclass_name: Option<Arc<str>>,
        metaclass: Option<Class>,
        instance_class: Weak<ClassInner>,
        ivars: Vec<Ivar>,
        methods: Option<Arc<MethodList>>,
        flags: ClassFlags,
    ) -> Self {
        ClassInner {
            name,
            superclass_name,
            superclass: RwLock::new(None),
            metaclass,
            instance_class,
            ivars,
            method_lists: RwLock::new(methods.into_iter().collect()),
            protocols: RwLock::new(Vec::new()),
            subclasses: RwLock::new(Vec::new()),
            dtable: ArcSwapOption::empty(),
            flags: AtomicU32::new(flags.bits()),
            init_lock: ReentrantMutex::new(()),
        }
    }
}

/// Everything needed to create a class and its metaclass.
pub(crate) struct PairSpec {
    pub(crate) name: Arc<str>,
    pub(crate) superclass_name: Option<Arc<str>>,
    pub(crate) ivars: Vec<Ivar>,
    pub(crate) instance_methods: Option<Arc<MethodList>>,
    pub(crate) class_methods: Option<Arc<MethodList>>,
    pub(crate) protocols: Vec<Arc<str>>,
    pub(crate) flags: ClassFlags,
}

/// Handle to a class or metaclass.
///
/// Cloning is cheap; equality and hashing use identity.
#[derive(Clone)]
pub struct Class {
    pub(crate) inner: Arc<ClassInner>,
}

impl Class {
    /// Creates an unresolved class together with its metaclass.
    pub(crate) fn new_pair(spec: PairSpec) -> Class {
        let mut flags = spec.flags;
        if spec.superclass_name.is_none() {
            flags |= ClassFlags::ROOT;
        }
        let inner = Arc::new_cyclic(|weak: &Weak<ClassInner>| {
            let meta = ClassInner::new(
                Arc::clone(&spec.name),
                spec.superclass_name.clone(),
                None,
                weak.clone(),
                Vec::new(),
                spec.class_methods,
                flags | ClassFlags::META,
            );
            ClassInner::new(
                spec.name,
                spec.superclass_name,
                Some(Class {
                    inner: Arc::new(meta),
                }),
                Weak::new(),
                spec.ivars,
                spec.instance_methods,
                flags,
            )
        });
        *inner.protocols.write() = spec.protocols;
        Class { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ClassInner>) -> Class {
        Class { inner }
    }

    /// Class name. A metaclass shares its instance class's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Name of the superclass as recorded at load time.
    #[must_use]
    pub fn superclass_name(&self) -> Option<&str> {
        self.inner.superclass_name.as_deref()
    }

    /// The linked superclass; `None` until resolved, and for root classes.
    /// A root metaclass's superclass is the root class.
    #[must_use]
    pub fn superclass(&self) -> Option<Class> {
        self.inner.superclass.read().clone()
    }

    /// The metaclass; `None` for metaclasses.
    #[must_use]
    pub fn metaclass(&self) -> Option<Class> {
        self.inner.metaclass.clone()
    }

    /// For a metaclass, the class it describes.
    #[must_use]
    pub fn instance_class(&self) -> Option<Class> {
        self.inner.instance_class.upgrade().map(Class::from_inner)
    }

    /// Current flag bits.
    #[must_use]
    pub fn flags(&self) -> ClassFlags {
        ClassFlags::from_bits_truncate(self.inner.flags.load(Ordering::Acquire))
    }

    pub(crate) fn insert_flags(&self, flags: ClassFlags) {
        self.inner.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: ClassFlags) {
        self.inner.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Returns `true` for metaclasses.
    #[must_use]
    pub fn is_metaclass(&self) -> bool {
        self.flags().contains(ClassFlags::META)
    }

    /// Returns `true` once the class is linked to its superclass.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.flags().contains(ClassFlags::RESOLVED)
    }

    /// Returns `true` for classes without a superclass (and their
    /// metaclasses).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.flags().contains(ClassFlags::ROOT)
    }

    /// Where the class is in the first-dispatch lifecycle.
    #[must_use]
    pub fn init_state(&self) -> InitState {
        if self.inner.dtable.load().is_some() {
            InitState::Installed
        } else if self.flags().contains(ClassFlags::INITIALIZED) {
            InitState::Initializing
        } else {
            InitState::NoTable
        }
    }

    /// Instance variables declared directly on this class.
    #[must_use]
    pub fn ivars(&self) -> &[Ivar] {
        &self.inner.ivars
    }

    /// Method lists, newest first. Category lists precede the class's own.
    #[must_use]
    pub fn method_lists(&self) -> Vec<Arc<MethodList>> {
        self.inner.method_lists.read().clone()
    }

    pub(crate) fn prepend_method_list(&self, list: Arc<MethodList>) {
        self.inner.method_lists.write().insert(0, list);
    }

    /// Protocol names the class declares conformance to, including those
    /// added by categories.
    #[must_use]
    pub fn protocols(&self) -> Vec<Arc<str>> {
        self.inner.protocols.read().clone()
    }

    pub(crate) fn add_protocols(&self, protocols: &[Arc<str>]) {
        let mut current = self.inner.protocols.write();
        for protocol in protocols {
            if !current.contains(protocol) {
                current.push(Arc::clone(protocol));
            }
        }
    }

    /// Resolved subclasses, including a root class's metaclass.
    #[must_use]
    pub fn subclasses(&self) -> Vec<Class> {
        self.inner
            .subclasses
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .map(Class::from_inner)
            .collect()
    }

    pub(crate) fn add_subclass(&self, subclass: &Class) {
        let mut subclasses = self.inner.subclasses.write();
        subclasses.retain(|weak| weak.strong_count() > 0);
        if !subclasses.iter().any(|weak| weak.as_ptr() == Arc::as_ptr(&subclass.inner)) {
            subclasses.push(Arc::downgrade(&subclass.inner));
        }
    }

    pub(crate) fn remove_subclass(&self, subclass: &Class) {
        let target = Arc::as_ptr(&subclass.inner);
        self.inner
            .subclasses
            .write()
            .retain(|weak| weak.strong_count() > 0 && weak.as_ptr() != target);
    }

    pub(crate) fn set_superclass_link(&self, superclass: Option<Class>) {
        *self.inner.superclass.write() = superclass;
    }

    /// The installed dispatch table, without waiting for initialization.
    pub(crate) fn installed_table(&self) -> Option<Arc<DispatchTable>> {
        self.inner.dtable.load_full()
    }

    pub(crate) fn install_table(&self, table: Option<Arc<DispatchTable>>) {
        self.inner.dtable.store(table);
    }

    /// Lock serializing the initialize protocol; shared by a class and its
    /// metaclass.
    pub(crate) fn init_lock(&self) -> &ReentrantMutex<()> {
        &self.inner.init_lock
    }

    /// The instance class for a metaclass, `self` otherwise.
    pub(crate) fn init_owner(&self) -> Class {
        if self.is_metaclass() {
            self.instance_class().unwrap_or_else(|| self.clone())
        } else {
            self.clone()
        }
    }

    /// Returns `true` if both handles name the same class.
    #[must_use]
    pub fn ptr_eq(&self, other: &Class) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn as_ptr(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast()
    }

    pub(crate) fn unlink_for_teardown(&self) {
        self.set_superclass_link(None);
        self.install_table(None);
    }
}

impl PartialEq for Class {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Class {}

impl Hash for Class {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ptr().hash(state);
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metaclass() {
            write!(f, "Class(meta {})", self.name())
        } else {
            write!(f, "Class({})", self.name())
        }
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name table of registered classes plus the unresolved worklist.
///
/// Mutated only under the runtime lock.
#[derive(Default)]
pub struct ClassTable {
    by_name: FxHashMap<Arc<str>, Class>,
    order: Vec<Class>,
    unresolved: Vec<Class>,
}

impl ClassTable {
    /// Looks a class up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Class> {
        self.by_name.get(name).cloned()
    }

    /// Returns `true` if a class with this name is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Number of registered classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    /// Returns `true` if no class is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Registered classes in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<Class> {
        self.order.clone()
    }

    /// Registered classes still waiting for their superclass.
    #[must_use]
    pub fn unresolved(&self) -> Vec<Class> {
        self.unresolved.clone()
    }

    pub(crate) fn insert(&mut self, class: &Class) -> Result<()> {
        if self.by_name.contains_key(class.name()) {
            return Err(Error::ClassAlreadyExists {
                name: class.name().to_string(),
            });
        }
        self.by_name.insert(Arc::clone(&class.inner.name), class.clone());
        self.order.push(class.clone());
        if !class.is_resolved() {
            self.unresolved.push(class.clone());
        }
        Ok(())
    }

    pub(crate) fn mark_resolved(&mut self, class: &Class) {
        self.unresolved.retain(|pending| !pending.ptr_eq(class));
    }

    pub(crate) fn remove(&mut self, class: &Class) {
        self.by_name.remove(class.name());
        self.order.retain(|registered| !registered.ptr_eq(class));
        self.unresolved.retain(|pending| !pending.ptr_eq(class));
    }
}

impl fmt::Debug for ClassTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassTable")
            .field("classes", &self.by_name.len())
            .field("unresolved", &self.unresolved.len())
            .finish()
    }
}

// ============================================================================
// Registration and resolution
// ============================================================================

impl Runtime {
    /// Looks a registered class up by name.
    #[must_use]
    pub fn class_named(&self, name: &str) -> Option<Class> {
        self.classes.read().get(name)
    }

    /// The linked superclass of `class`.
    #[must_use]
    pub fn superclass(&self, class: &Class) -> Option<Class> {
        class.superclass()
    }

    /// Adds `class` to the class table and resolves whatever became
    /// resolvable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub(crate) fn insert_class_locked(&self, class: &Class) -> Result<()> {
        let _guard = self.lock();
        self.classes.write().insert(class)?;
        class.insert_flags(ClassFlags::REGISTERED);
        if let Some(meta) = class.metaclass() {
            meta.insert_flags(ClassFlags::REGISTERED);
        }
        oxidec_log::debug!("inserted class {}", class.name());
        self.resolve_pending();
        self.resolution.notify();
        Ok(())
    }

    /// Resolves every parked class whose superclass is now available.
    pub(crate) fn resolve_pending(&self) {
        let _guard = self.lock();
        loop {
            let pending = self.classes.read().unresolved();
            let before = pending.len();
            for class in pending {
                self.resolve_class(&class);
            }
            if self.classes.read().unresolved().len() == before {
                break;
            }
        }
    }

    /// Links `class` into the hierarchy.
    ///
    /// The superclass is resolved first. The metaclass's superclass becomes
    /// the superclass's metaclass, or the class itself for a root class.
    /// Returns `false` while the superclass is not loaded. Resolving an
    /// already resolved class is a no-op that returns `true`.
    pub fn resolve_class(&self, class: &Class) -> bool {
        self.resolve_within(class, 0)
    }

    fn resolve_within(&self, class: &Class, depth: usize) -> bool {
        if class.is_resolved() {
            return true;
        }
        let _guard = self.lock();
        if class.is_resolved() {
            return true;
        }
        // A chain longer than the table means the superclass names loop.
        if depth > self.classes.read().len() {
            oxidec_log::warn!("superclass chain of {} does not terminate", class.name());
            return false;
        }
        let class = class.init_owner();

        let superclass = match class.superclass_name() {
            None => None,
            Some(name) => match self.class_named(name) {
                Some(superclass) if self.resolve_within(&superclass, depth + 1) => Some(superclass),
                _ => return false,
            },
        };
        let Some(meta) = class.metaclass() else {
            return false;
        };

        match &superclass {
            Some(superclass) => {
                class.set_superclass_link(Some(superclass.clone()));
                superclass.add_subclass(&class);
                if let Some(super_meta) = superclass.metaclass() {
                    meta.set_superclass_link(Some(super_meta.clone()));
                    super_meta.add_subclass(&meta);
                }
            }
            None => {
                meta.set_superclass_link(Some(class.clone()));
                class.add_subclass(&meta);
            }
        }
        class.insert_flags(ClassFlags::RESOLVED);
        meta.insert_flags(ClassFlags::RESOLVED);
        self.classes.write().mark_resolved(&class);
        oxidec_log::debug!(
            "resolved class {} (superclass {})",
            class.name(),
            superclass.as_ref().map_or("<root>", Class::name)
        );
        true
    }

    /// Blocks until `class` can be resolved.
    ///
    /// A class whose superclass has not been loaded cannot be dispatched to;
    /// the caller waits until a later insertion makes resolution possible.
    pub(crate) fn wait_for_resolution(&self, class: &Class) {
        loop {
            let seen = {
                let _guard = self.lock();
                if self.resolve_class(class) {
                    return;
                }
                self.resolution.current()
            };
            oxidec_log::debug!(
                "waiting for superclass {} of {}",
                class.superclass_name().unwrap_or("?"),
                class.name()
            );
            self.resolution.wait_past(seen);
        }
    }
}
