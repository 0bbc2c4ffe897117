//! Dispatch table construction and maintenance.
//!
//! Each class's table maps a selector's dispatch key to the most-derived
//! [`Method`] visible from that class. Tables are [`SparseArray`]s shared
//! copy-on-write, so a subclass starts as an O(1) clone of its superclass's
//! table with its own methods overlaid.
//!
//! Every update follows the same shape: clone the current table, modify the
//! clone, publish it with one atomic store. A thread dispatching
//! concurrently sees either the old table or the new one, never a partial
//! overlay.
//!
//! Tie-breaks:
//! - within one method list, the first entry for a selector wins;
//! - across lists, newer lists win (categories over the class's own);
//! - across the hierarchy, the most-derived entry wins.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassFlags, Imp, Method, MethodList};
use crate::runtime::selector::Selector;
use crate::runtime::sparse::SparseArray;
use fxhash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::sync::Arc;

/// A class's selector-to-method map.
pub type DispatchTable = SparseArray<Arc<Method>>;

/// `(key, method before the update, method installed)`.
type Change = (u32, Option<Arc<Method>>, Arc<Method>);

thread_local! {
    /// Classes whose table this thread is constructing.
    static BUILDING: RefCell<Vec<*const ()>> = const { RefCell::new(Vec::new()) };
}

struct BuildGuard(*const ());

impl BuildGuard {
    fn enter(class: &Class) -> BuildGuard {
        let ptr = class.as_ptr();
        BUILDING.with(|building| {
            let mut building = building.borrow_mut();
            if building.contains(&ptr) {
                oxidec_log::fatal!(
                    "dispatch table for {class:?} rebuilt while it is being built"
                );
            }
            building.push(ptr);
        });
        BuildGuard(ptr)
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        BUILDING.with(|building| building.borrow_mut().retain(|&ptr| ptr != self.0));
    }
}

fn same_method(a: Option<&Arc<Method>>, b: Option<&Arc<Method>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Overlays `list` onto `table`, first entry per key winning within the
/// list. Returns what actually changed.
fn overlay(table: &mut DispatchTable, list: &MethodList) -> Vec<Change> {
    let mut seen = FxHashSet::default();
    let mut changes = Vec::new();
    for method in list.methods() {
        for key in method.install_keys() {
            if !seen.insert(key) {
                continue;
            }
            let previous = table.lookup(key).cloned();
            if same_method(previous.as_ref(), Some(method)) {
                continue;
            }
            table.insert(key, Arc::clone(method));
            changes.push((key, previous, Arc::clone(method)));
        }
    }
    changes
}

/// Methods a class declares itself, newest list first, first seen winning.
fn own_methods(class: &Class) -> FxHashMap<u32, Arc<Method>> {
    let mut own = FxHashMap::default();
    for list in class.method_lists() {
        let mut in_list = FxHashSet::default();
        for method in list.methods() {
            for key in method.install_keys() {
                if in_list.insert(key) {
                    own.entry(key).or_insert_with(|| Arc::clone(method));
                }
            }
        }
    }
    own
}

impl Runtime {
    /// Returns the class's dispatch table, building it on first use.
    ///
    /// The fast path is a single atomic load. Otherwise the class goes
    /// through the initialize protocol, which blocks while its superclass
    /// is missing or another thread is running its `+initialize`.
    pub fn create_dispatch_table(&self, class: &Class) -> Arc<DispatchTable> {
        if let Some(table) = class.installed_table() {
            return table;
        }
        self.send_initialize(class);
        self.dtable_for_class(class)
            .unwrap_or_else(|| {
                oxidec_log::fatal!("no dispatch table for {class:?} after initialization")
            })
    }

    /// The table a mutation should start from: installed, or published in
    /// the lookaside while `+initialize` runs. Never blocks.
    pub(crate) fn current_table(&self, class: &Class) -> Option<Arc<DispatchTable>> {
        class.installed_table().or_else(|| self.lookaside_table(class))
    }

    /// Publishes `table` where [`Runtime::current_table`] found the old one.
    pub(crate) fn store_table(&self, class: &Class, table: DispatchTable) {
        let table = Arc::new(table);
        if class.installed_table().is_some() {
            class.install_table(Some(table));
            return;
        }
        let mut lookaside = self.lookaside.lock();
        if let Some(entry) = lookaside.iter_mut().find(|(pending, _)| pending.ptr_eq(class)) {
            entry.1 = table;
        } else {
            drop(lookaside);
            class.install_table(Some(table));
        }
    }

    /// Builds a fresh table for `class` without installing it.
    ///
    /// Starts from `super_table` if given, else from the superclass's
    /// current table, then overlays the class's lists oldest first.
    pub(crate) fn build_table(
        &self,
        class: &Class,
        super_table: Option<&DispatchTable>,
    ) -> DispatchTable {
        let _guard = self.lock();
        let _building = BuildGuard::enter(class);

        let mut table = match (super_table, class.superclass()) {
            (Some(table), _) => table.clone(),
            (None, Some(superclass)) => match self.current_table(&superclass) {
                Some(table) => (*table).clone(),
                None => self.build_table(&superclass, None),
            },
            (None, None) => DispatchTable::new(self.config.initial_table_depth),
        };
        for list in class.method_lists().iter().rev() {
            overlay(&mut table, list);
        }
        self.count_table_built();
        oxidec_log::debug!("built dispatch table for {class:?} ({} entries)", table.len());
        table
    }

    /// Prepends `list` to `class` and brings every materialized table up to
    /// date.
    ///
    /// If the class has a table, only the new methods are overlaid. The
    /// change then flows into each subclass table whose entry still holds
    /// the method the subclass inherited before the update, so subclass
    /// overrides survive.
    pub fn add_method_list(&self, class: &Class, list: MethodList) {
        let _guard = self.lock();
        let list = Arc::new(list);
        class.prepend_method_list(Arc::clone(&list));

        if let Some(current) = self.current_table(class) {
            let mut table = (*current).clone();
            let changes = overlay(&mut table, &list);
            if !changes.is_empty() {
                self.store_table(class, table);
                self.propagate(class, &changes);
            }
        }
        self.bump_version();
    }

    fn propagate(&self, class: &Class, changes: &[Change]) {
        for subclass in class.subclasses() {
            let Some(current) = self.current_table(&subclass) else {
                continue;
            };
            let mut table = (*current).clone();
            let mut installed = Vec::new();
            for (key, previous, method) in changes {
                if same_method(table.lookup(*key), previous.as_ref()) {
                    table.insert(*key, Arc::clone(method));
                    installed.push((*key, previous.clone(), Arc::clone(method)));
                }
            }
            if !installed.is_empty() {
                self.store_table(&subclass, table);
                self.propagate(&subclass, &installed);
            }
        }
    }

    /// Recomputes `class`'s table against `new_super`'s and recurses into
    /// subclasses that have tables.
    ///
    /// Own and category methods are kept; every other key takes the new
    /// superclass's entry, and keys the new superclass lacks are cleared.
    /// Running it twice changes nothing the second time.
    pub fn rebase_on_new_superclass(&self, class: &Class, new_super: &Class) {
        let _guard = self.lock();
        let Some(current) = self.current_table(class) else {
            return;
        };
        let super_table = self
            .current_table(new_super)
            .unwrap_or_else(|| Arc::new(self.build_table(new_super, None)));
        let own = own_methods(class);

        let mut table = (*current).clone();
        for (key, method) in &own {
            if !same_method(table.lookup(*key), Some(method)) {
                table.insert(*key, Arc::clone(method));
            }
        }
        for (key, method) in super_table.iter() {
            if !own.contains_key(&key) && !same_method(table.lookup(key), Some(method)) {
                table.insert(key, Arc::clone(method));
            }
        }
        let stale: Vec<u32> = current
            .iter()
            .map(|(key, _)| key)
            .filter(|key| !own.contains_key(key) && super_table.lookup(*key).is_none())
            .collect();
        for key in stale {
            table.remove(key);
        }

        if !table.ptr_eq(&current) {
            oxidec_log::debug!("rebased dispatch table of {class:?} on {new_super:?}");
            self.store_table(class, table);
        }
        for subclass in class.subclasses() {
            if self.current_table(&subclass).is_some() {
                self.rebase_on_new_superclass(&subclass, class);
            }
        }
        self.bump_version();
    }

    /// Re-parents `class` under `new_super`, relinking back-references for
    /// the class and its metaclass and rebasing both tables.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassNotResolved`] if either class is not linked yet
    /// - [`Error::InheritanceCycle`] if `new_super` descends from `class`
    pub fn set_superclass(&self, class: &Class, new_super: &Class) -> Result<Option<Class>> {
        let class = class.init_owner();
        let new_super = new_super.init_owner();
        for checked in [&class, &new_super] {
            if !checked.is_resolved() {
                return Err(Error::ClassNotResolved {
                    name: checked.name().to_string(),
                });
            }
        }
        if self.is_subclass_of(&new_super, &class) {
            return Err(Error::InheritanceCycle);
        }
        // The rebase reads the new superclass's table, so it must exist.
        if class.installed_table().is_some() {
            self.create_dispatch_table(&new_super);
        }

        let _guard = self.lock();
        let (Some(meta), Some(new_meta)) = (class.metaclass(), new_super.metaclass()) else {
            return Err(Error::ClassNotResolved {
                name: class.name().to_string(),
            });
        };
        let old_super = class.superclass();
        match &old_super {
            Some(old) => {
                old.remove_subclass(&class);
                if let Some(old_meta) = old.metaclass() {
                    old_meta.remove_subclass(&meta);
                }
            }
            None => class.remove_subclass(&meta),
        }
        class.remove_flags(ClassFlags::ROOT);
        meta.remove_flags(ClassFlags::ROOT);

        class.set_superclass_link(Some(new_super.clone()));
        new_super.add_subclass(&class);
        meta.set_superclass_link(Some(new_meta.clone()));
        new_meta.add_subclass(&meta);

        oxidec_log::debug!(
            "{} superclass changed from {} to {}",
            class.name(),
            old_super.as_ref().map_or("<root>", Class::name),
            new_super.name()
        );
        self.rebase_on_new_superclass(&class, &new_super);
        self.rebase_on_new_superclass(&meta, &new_meta);
        self.bump_version();
        Ok(old_super)
    }

    /// Creates a method for `name`/`types`, registering the selector.
    pub(crate) fn make_method(&self, name: &str, types: &str, imp: Imp) -> Arc<Method> {
        let _guard = self.lock();
        let types = (!types.is_empty()).then_some(types);
        let selector = self.selectors.register(name, types);
        let untyped = self.selectors.register(name, None);
        Arc::new(Method::new(selector, untyped, imp, Arc::from(types.unwrap_or(""))))
    }

    /// Adds a method directly to `class`.
    ///
    /// Returns `false`, changing nothing, if the class already declares a
    /// method with that name in any of its lists; use
    /// [`Runtime::replace_method`] to override it.
    pub fn add_method(&self, class: &Class, name: &str, types: &str, imp: Imp) -> bool {
        let _guard = self.lock();
        let method = self.make_method(name, types, imp);
        let declared = class
            .method_lists()
            .iter()
            .flat_map(|list| list.methods().to_vec())
            .any(|existing| existing.untyped_selector() == method.untyped_selector());
        if declared {
            return false;
        }
        self.add_method_list(class, MethodList::new(vec![method], None));
        true
    }

    /// Installs `imp` for `name` on `class`, returning the implementation it
    /// replaces as seen from `class` (declared or inherited), if any.
    pub fn replace_method(&self, class: &Class, name: &str, types: &str, imp: Imp) -> Option<Imp> {
        let _guard = self.lock();
        let method = self.make_method(name, types, imp);
        let previous = self
            .method_in_hierarchy(class, method.selector())
            .map(|found| found.imp());
        self.add_method_list(class, MethodList::new(vec![method], None));
        previous
    }

    /// The method `class` would dispatch `sel` to, from its lists and its
    /// ancestors' lists, without building any table.
    pub(crate) fn method_in_hierarchy(&self, class: &Class, sel: Selector) -> Option<Arc<Method>> {
        if let Some(table) = self.current_table(class) {
            return table.lookup(sel.dispatch_key()).cloned();
        }
        let key = sel.dispatch_key();
        let mut cursor = Some(class.clone());
        while let Some(current) = cursor {
            if let Some(method) = own_methods(&current).remove(&key) {
                return Some(method);
            }
            cursor = current.superclass();
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::class::{Ivar, PairSpec};
    use crate::runtime::object::ObjectPtr;

    unsafe extern "C-unwind" fn imp_one(_: ObjectPtr, _: Selector, _: *const *mut u8, _: *mut u8) {}
    unsafe extern "C-unwind" fn imp_two(_: ObjectPtr, _: Selector, _: *const *mut u8, _: *mut u8) {}

    fn insert(
        runtime: &Runtime,
        name: &str,
        superclass: Option<&str>,
        methods: Vec<Arc<Method>>,
    ) -> Class {
        let class = Class::new_pair(PairSpec {
            name: Arc::from(name),
            superclass_name: superclass.map(Arc::from),
            ivars: Vec::<Ivar>::new(),
            instance_methods: Some(Arc::new(MethodList::new(methods, None))),
            class_methods: None,
            protocols: Vec::new(),
            flags: ClassFlags::empty(),
        });
        runtime.insert_class_locked(&class).unwrap();
        class
    }

    fn entry(table: &DispatchTable, method: &Arc<Method>) -> Option<Arc<Method>> {
        table.lookup(method.selector().dispatch_key()).cloned()
    }

    #[test]
    fn test_first_declared_wins_within_list() {
        let runtime = Runtime::new();
        let first = runtime.make_method("dup", "v@:", imp_one);
        let second = runtime.make_method("dup", "v@:", imp_two);
        let class = insert(&runtime, "Dup", None, vec![Arc::clone(&first), second]);
        let table = runtime.create_dispatch_table(&class);
        assert!(Arc::ptr_eq(&entry(&table, &first).unwrap(), &first));
    }

    #[test]
    fn test_subclass_inherits_and_overrides() {
        let runtime = Runtime::new();
        let base_m = runtime.make_method("m", "v@:", imp_one);
        let other = runtime.make_method("other", "v@:", imp_one);
        let base = insert(&runtime, "Base", None, vec![Arc::clone(&base_m), Arc::clone(&other)]);
        let sub_m = runtime.make_method("m", "v@:", imp_two);
        let sub = insert(&runtime, "Sub", Some("Base"), vec![Arc::clone(&sub_m)]);

        let table = runtime.create_dispatch_table(&sub);
        assert!(Arc::ptr_eq(&entry(&table, &sub_m).unwrap(), &sub_m));
        assert!(Arc::ptr_eq(&entry(&table, &other).unwrap(), &other));
        let base_table = runtime.create_dispatch_table(&base);
        assert!(Arc::ptr_eq(&entry(&base_table, &base_m).unwrap(), &base_m));
    }

    #[test]
    fn test_table_built_once() {
        let runtime = Runtime::new();
        let class = insert(&runtime, "Once", None, Vec::new());
        let first = runtime.create_dispatch_table(&class);
        let built = runtime.stats().tables_built;
        let second = runtime.create_dispatch_table(&class);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runtime.stats().tables_built, built);
    }

    #[test]
    fn test_add_method_list_propagates_unless_overridden() {
        let runtime = Runtime::new();
        let a = insert(&runtime, "A", None, Vec::new());
        let b_override = runtime.make_method("f", "v@:", imp_one);
        let b = insert(&runtime, "B", Some("A"), vec![Arc::clone(&b_override)]);
        let c = insert(&runtime, "C", Some("A"), Vec::new());
        for class in [&a, &b, &c] {
            runtime.create_dispatch_table(class);
        }

        let category = runtime.make_method("f", "v@:", imp_two);
        runtime.add_method_list(
            &a,
            MethodList::new(vec![Arc::clone(&category)], Some(Arc::from("Extra"))),
        );

        let a_table = runtime.create_dispatch_table(&a);
        let b_table = runtime.create_dispatch_table(&b);
        let c_table = runtime.create_dispatch_table(&c);
        assert!(Arc::ptr_eq(&entry(&a_table, &category).unwrap(), &category));
        assert!(Arc::ptr_eq(&entry(&c_table, &category).unwrap(), &category));
        assert!(Arc::ptr_eq(&entry(&b_table, &category).unwrap(), &b_override));
    }

    #[test]
    fn test_add_method_list_without_table_defers() {
        let runtime = Runtime::new();
        let class = insert(&runtime, "Lazy", None, Vec::new());
        let method = runtime.make_method("late", "v@:", imp_one);
        let version = runtime.cache_version();
        runtime.add_method_list(&class, MethodList::new(vec![Arc::clone(&method)], None));
        assert!(class.installed_table().is_none());
        assert!(runtime.cache_version() > version);
        let table = runtime.create_dispatch_table(&class);
        assert!(Arc::ptr_eq(&entry(&table, &method).unwrap(), &method));
    }

    #[test]
    fn test_add_method_refuses_duplicate() {
        let runtime = Runtime::new();
        let class = insert(&runtime, "Adder", None, Vec::new());
        assert!(runtime.add_method(&class, "go", "v@:", imp_one));
        assert!(!runtime.add_method(&class, "go", "v@:", imp_two));
    }

    #[test]
    fn test_replace_method_returns_previous() {
        let runtime = Runtime::new();
        let original = runtime.make_method("swap", "v@:", imp_one);
        let class = insert(&runtime, "Swizzled", None, vec![original]);
        runtime.create_dispatch_table(&class);
        let previous = runtime.replace_method(&class, "swap", "v@:", imp_two);
        assert!(previous.is_some_and(|imp| std::ptr::fn_addr_eq(imp, imp_one as Imp)));
        let sel = runtime.lookup_selector("swap", Some("v@:")).unwrap();
        let table = runtime.create_dispatch_table(&class);
        let found = table.lookup(sel.dispatch_key()).unwrap();
        assert!(std::ptr::fn_addr_eq(found.imp(), imp_two as Imp));
    }

    #[test]
    fn test_rebase_is_idempotent() {
        let runtime = Runtime::new();
        let x = runtime.make_method("x", "v@:", imp_one);
        let y = runtime.make_method("y", "v@:", imp_one);
        let old = insert(&runtime, "Old", None, vec![Arc::clone(&x)]);
        let new = insert(&runtime, "New", None, vec![Arc::clone(&y)]);
        let child = insert(&runtime, "Child", Some("Old"), Vec::new());
        for class in [&old, &new, &child] {
            runtime.create_dispatch_table(class);
        }

        runtime.set_superclass(&child, &new).unwrap();
        let table = runtime.create_dispatch_table(&child);
        assert!(entry(&table, &x).is_none());
        assert!(Arc::ptr_eq(&entry(&table, &y).unwrap(), &y));

        runtime.rebase_on_new_superclass(&child, &new);
        let again = runtime.create_dispatch_table(&child);
        assert!(again.ptr_eq(&table));
    }

    #[test]
    fn test_set_superclass_rejects_cycle() {
        let runtime = Runtime::new();
        let root = insert(&runtime, "Top", None, Vec::new());
        let child = insert(&runtime, "Below", Some("Top"), Vec::new());
        assert_eq!(runtime.set_superclass(&root, &child), Err(Error::InheritanceCycle));
    }
}
