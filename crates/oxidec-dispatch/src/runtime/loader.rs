//! Consumption of compiler-emitted class and category records.
//!
//! A [`LoadDescriptor`] describes one loadable unit: the selectors it
//! references, its classes, its categories and its protocol names. Loading
//! is idempotent: classes whose names are already present and categories
//! already attached to their class are skipped, so a unit loaded twice
//! changes nothing the second time.
//!
//! Categories that name a class not yet loaded are parked and attached
//! when the class arrives.
//!
//! Method records whose type encoding cannot be parsed are skipped with a
//! warning; an empty encoding declares an untyped method.
//!
//! All units loaded into one runtime must share a record ABI version.
//! Mixing versions is fatal.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::encoding::argument_count;
use crate::runtime::class::{Class, ClassFlags, Imp, Ivar, MethodList, PairSpec};
use fxhash::FxHashSet;
use std::fmt;
use std::sync::Arc;

/// Record layout version produced by current compilers.
pub const RECORD_ABI_VERSION: u32 = 1;

/// One method as declared in a class or category record.
#[derive(Clone)]
pub struct MethodRecord {
    /// Selector name.
    pub name: String,
    /// Type encoding; empty for an untyped declaration.
    pub types: String,
    /// Implementation.
    pub imp: Imp,
}

impl MethodRecord {
    /// Creates a method record.
    #[must_use]
    pub fn new(name: impl Into<String>, types: impl Into<String>, imp: Imp) -> Self {
        MethodRecord {
            name: name.into(),
            types: types.into(),
            imp,
        }
    }
}

impl fmt::Debug for MethodRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodRecord")
            .field("name", &self.name)
            .field("types", &self.types)
            .field("imp", &format!("{:p}", self.imp as *const ()))
            .finish()
    }
}

/// A class as emitted by the compiler.
#[derive(Debug, Clone, Default)]
pub struct ClassRecord {
    /// Class name.
    pub name: String,
    /// Superclass name; `None` for a root class.
    pub superclass: Option<String>,
    /// Instance variables, carried through uninterpreted.
    pub ivars: Vec<Ivar>,
    /// Instance methods in declaration order.
    pub instance_methods: Vec<MethodRecord>,
    /// Class methods in declaration order.
    pub class_methods: Vec<MethodRecord>,
    /// Names of adopted protocols.
    pub protocols: Vec<String>,
}

impl ClassRecord {
    /// A class with a superclass.
    #[must_use]
    pub fn new(name: impl Into<String>, superclass: impl Into<String>) -> Self {
        ClassRecord {
            name: name.into(),
            superclass: Some(superclass.into()),
            ..ClassRecord::default()
        }
    }

    /// A root class.
    #[must_use]
    pub fn root(name: impl Into<String>) -> Self {
        ClassRecord {
            name: name.into(),
            ..ClassRecord::default()
        }
    }

    /// Appends an instance method.
    #[must_use]
    pub fn with_instance_method(mut self, method: MethodRecord) -> Self {
        self.instance_methods.push(method);
        self
    }

    /// Appends a class method.
    #[must_use]
    pub fn with_class_method(mut self, method: MethodRecord) -> Self {
        self.class_methods.push(method);
        self
    }

    /// Appends an instance variable.
    #[must_use]
    pub fn with_ivar(mut self, ivar: Ivar) -> Self {
        self.ivars.push(ivar);
        self
    }

    /// Adopts a protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }
}

/// Methods and protocols added to an existing class.
#[derive(Debug, Clone, Default)]
pub struct CategoryRecord {
    /// Class the category extends.
    pub class_name: String,
    /// Category name; unique per class.
    pub name: String,
    /// Instance methods in declaration order.
    pub instance_methods: Vec<MethodRecord>,
    /// Class methods in declaration order.
    pub class_methods: Vec<MethodRecord>,
    /// Names of protocols the category adds.
    pub protocols: Vec<String>,
}

impl CategoryRecord {
    /// An empty category `name` on `class_name`.
    #[must_use]
    pub fn new(class_name: impl Into<String>, name: impl Into<String>) -> Self {
        CategoryRecord {
            class_name: class_name.into(),
            name: name.into(),
            ..CategoryRecord::default()
        }
    }

    /// Appends an instance method.
    #[must_use]
    pub fn with_instance_method(mut self, method: MethodRecord) -> Self {
        self.instance_methods.push(method);
        self
    }

    /// Appends a class method.
    #[must_use]
    pub fn with_class_method(mut self, method: MethodRecord) -> Self {
        self.class_methods.push(method);
        self
    }

    /// Adds a protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }

    fn key(&self) -> (Arc<str>, Arc<str>) {
        (Arc::from(self.class_name.as_str()), Arc::from(self.name.as_str()))
    }
}

/// One loadable unit.
#[derive(Debug, Clone)]
pub struct LoadDescriptor {
    /// Record layout version.
    pub abi_version: u32,
    /// Selectors referenced by the unit's code, as `(name, types)`.
    pub selectors: Vec<(String, Option<String>)>,
    /// Classes in emission order. A subclass may precede its superclass.
    pub classes: Vec<ClassRecord>,
    /// Categories in emission order.
    pub categories: Vec<CategoryRecord>,
    /// Protocol names declared by the unit.
    pub protocols: Vec<String>,
}

impl Default for LoadDescriptor {
    fn default() -> Self {
        LoadDescriptor {
            abi_version: RECORD_ABI_VERSION,
            selectors: Vec::new(),
            classes: Vec::new(),
            categories: Vec::new(),
            protocols: Vec::new(),
        }
    }
}

impl LoadDescriptor {
    /// An empty descriptor at [`RECORD_ABI_VERSION`].
    #[must_use]
    pub fn new() -> Self {
        LoadDescriptor::default()
    }

    /// Overrides the record ABI version.
    #[must_use]
    pub fn with_abi_version(mut self, abi_version: u32) -> Self {
        self.abi_version = abi_version;
        self
    }

    /// Adds a referenced selector.
    #[must_use]
    pub fn with_selector(mut self, name: impl Into<String>, types: Option<&str>) -> Self {
        self.selectors.push((name.into(), types.map(str::to_string)));
        self
    }

    /// Adds a class.
    #[must_use]
    pub fn with_class(mut self, class: ClassRecord) -> Self {
        self.classes.push(class);
        self
    }

    /// Adds a category.
    #[must_use]
    pub fn with_category(mut self, category: CategoryRecord) -> Self {
        self.categories.push(category);
        self
    }

    /// Declares a protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }
}

/// What a call to [`Runtime::load`] changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Classes newly inserted.
    pub classes_loaded: usize,
    /// Categories attached, including previously parked ones.
    pub categories_attached: usize,
    /// Categories of this unit left parked because their class is not
    /// loaded.
    pub categories_parked: usize,
}

#[derive(Default)]
pub(crate) struct LoaderState {
    abi_version: Option<u32>,
    attached: FxHashSet<(Arc<str>, Arc<str>)>,
    parked: Vec<CategoryRecord>,
    protocols: Vec<Arc<str>>,
}

impl Runtime {
    /// Checks `abi_version` against the units already loaded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleAbi`] if a unit with another version
    /// has been loaded.
    pub fn check_abi(&self, abi_version: u32) -> Result<()> {
        match self.loader.lock().abi_version {
            Some(loaded) if loaded != abi_version => Err(Error::IncompatibleAbi {
                loaded,
                requested: abi_version,
            }),
            _ => Ok(()),
        }
    }

    /// Loads a unit: registers its selectors and protocols, inserts its
    /// classes and attaches its categories.
    ///
    /// Aborts the process if the unit's record ABI differs from units
    /// already loaded.
    pub fn load(&self, descriptor: &LoadDescriptor) -> LoadReport {
        let _guard = self.lock();
        if let Err(e) = self.check_abi(descriptor.abi_version) {
            oxidec_log::fatal!("{e}");
        }
        self.loader.lock().abi_version = Some(descriptor.abi_version);

        for (name, types) in &descriptor.selectors {
            self.selectors.register(name, types.as_deref());
        }
        {
            let mut state = self.loader.lock();
            for protocol in &descriptor.protocols {
                if !state.protocols.iter().any(|known| **known == **protocol) {
                    state.protocols.push(Arc::from(protocol.as_str()));
                }
            }
        }

        let mut report = LoadReport::default();
        for record in &descriptor.classes {
            if self.classes.read().contains(&record.name) {
                oxidec_log::trace!("class {} already loaded", record.name);
                continue;
            }
            match self.insert_class(record) {
                Ok(_) => report.classes_loaded += 1,
                Err(e) => oxidec_log::warn!("{e}"),
            }
        }
        for category in &descriptor.categories {
            if self.attach_category(category) {
                report.categories_attached += 1;
            }
        }

        report.categories_attached += self.drain_parked_categories();
        {
            let state = self.loader.lock();
            report.categories_parked = descriptor
                .categories
                .iter()
                .filter(|category| {
                    let key = category.key();
                    state.parked.iter().any(|parked| parked.key() == key)
                })
                .count();
        }
        oxidec_log::info!(
            "loaded unit: {} classes, {} categories attached, {} parked",
            report.classes_loaded,
            report.categories_attached,
            report.categories_parked
        );
        report
    }

    /// Creates a class pair from `record` and inserts it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn insert_class(&self, record: &ClassRecord) -> Result<Class> {
        let _guard = self.lock();
        if self.classes.read().contains(&record.name) {
            return Err(Error::ClassAlreadyExists {
                name: record.name.clone(),
            });
        }
        let class = Class::new_pair(PairSpec {
            name: Arc::from(record.name.as_str()),
            superclass_name: record.superclass.as_deref().map(Arc::from),
            ivars: record.ivars.clone(),
            instance_methods: Some(Arc::new(self.method_list(&record.instance_methods, None))),
            class_methods: Some(Arc::new(self.method_list(&record.class_methods, None))),
            protocols: record.protocols.iter().map(|p| Arc::from(p.as_str())).collect(),
            flags: ClassFlags::empty(),
        });
        self.insert_class_locked(&class)?;
        self.drain_parked_categories();
        Ok(class)
    }

    /// Attaches `category` to its class, or parks it until the class is
    /// loaded. Returns `true` if it was attached by this call.
    pub fn attach_category(&self, category: &CategoryRecord) -> bool {
        let _guard = self.lock();
        let key = category.key();
        if self.loader.lock().attached.contains(&key) {
            oxidec_log::trace!(
                "category {}({}) already attached",
                category.class_name,
                category.name
            );
            return false;
        }
        let Some(class) = self.class_named(&category.class_name) else {
            let mut state = self.loader.lock();
            if !state.parked.iter().any(|parked| parked.key() == key) {
                oxidec_log::debug!(
                    "parking category {}({}) until its class loads",
                    category.class_name,
                    category.name
                );
                state.parked.push(category.clone());
            }
            return false;
        };

        let name = Some(Arc::clone(&key.1));
        if !category.instance_methods.is_empty() {
            let list = self.method_list(&category.instance_methods, name.clone());
            self.add_method_list(&class, list);
        }
        if !category.class_methods.is_empty() {
            if let Some(meta) = class.metaclass() {
                let list = self.method_list(&category.class_methods, name);
                self.add_method_list(&meta, list);
            }
        }
        let protocols: Vec<Arc<str>> = category
            .protocols
            .iter()
            .map(|p| Arc::from(p.as_str()))
            .collect();
        class.add_protocols(&protocols);

        self.loader.lock().attached.insert(key);
        oxidec_log::debug!("attached category {}({})", category.class_name, category.name);
        true
    }

    /// Attaches parked categories whose class has arrived.
    fn drain_parked_categories(&self) -> usize {
        let _guard = self.lock();
        let ready: Vec<CategoryRecord> = {
            let mut state = self.loader.lock();
            let classes = self.classes.read();
            let (ready, still_parked): (Vec<_>, Vec<_>) = std::mem::take(&mut state.parked)
                .into_iter()
                .partition(|category| classes.contains(&category.class_name));
            state.parked = still_parked;
            ready
        };
        ready.iter().filter(|category| self.attach_category(category)).count()
    }

    /// Protocol names declared by loaded units.
    #[must_use]
    pub fn protocols(&self) -> Vec<Arc<str>> {
        self.loader.lock().protocols.clone()
    }

    /// Categories waiting for their class.
    #[must_use]
    pub fn parked_categories(&self) -> Vec<CategoryRecord> {
        self.loader.lock().parked.clone()
    }

    pub(crate) fn method_list(
        &self,
        records: &[MethodRecord],
        category: Option<Arc<str>>,
    ) -> MethodList {
        let methods = records
            .iter()
            .filter(|record| well_formed(record))
            .map(|record| self.make_method(&record.name, &record.types, record.imp))
            .collect();
        MethodList::new(methods, category)
    }
}

fn well_formed(record: &MethodRecord) -> bool {
    if record.types.is_empty() {
        return true;
    }
    match argument_count(&record.types) {
        Ok(count) => {
            oxidec_log::trace!("method '{}' takes {count} arguments", record.name);
            true
        }
        Err(e) => {
            oxidec_log::warn!("skipping method '{}': {e}", record.name);
            false
        }
    }
}
