//! The first-dispatch protocol.
//!
//! A class gets its dispatch tables the first time something is sent to it
//! (or to its metaclass). If the metaclass responds to `initialize`, that
//! method runs exactly once before any other thread can dispatch to the
//! class:
//!
//! 1. the class is resolved, waiting for its superclass if necessary;
//! 2. the superclass goes through the protocol first;
//! 3. under the runtime lock, a class already marked `INITIALIZED` means
//!    another thread got there first: wait on the class lock and return;
//! 4. otherwise take the class lock, mark class and metaclass, and build
//!    both tables;
//! 5. without an `initialize` method the tables are installed directly;
//! 6. with one, the tables go into the lookaside list, the runtime lock is
//!    released and `+initialize` runs. Only the initializing thread can see
//!    the tables until a guard installs them, on return or unwind.
//!
//! Other threads that reach the class in the meantime find its entry in
//! the lookaside and block on the class lock.

use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassFlags};
use crate::runtime::dtable::DispatchTable;
use crate::runtime::object::ObjectPtr;
use std::sync::Arc;

/// Selector name of the per-class initializer.
pub const INITIALIZE: &str = "initialize";

/// Moves a class pair's tables from the lookaside into the classes.
struct InstallGuard<'a> {
    runtime: &'a Runtime,
    class: Class,
    meta: Class,
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        let _guard = self.runtime.lock();
        let mut lookaside = self.runtime.lookaside.lock();
        for target in [&self.class, &self.meta] {
            if let Some(index) = lookaside.iter().position(|(pending, _)| pending.ptr_eq(target)) {
                let (_, table) = lookaside.remove(index);
                target.install_table(Some(table));
            }
        }
        drop(lookaside);
        self.runtime.bump_version();
        oxidec_log::debug!("installed dispatch tables for {}", self.class.name());
    }
}

impl Runtime {
    /// Runs the initialize protocol for `class` (or the class a metaclass
    /// describes). Returns once the tables are installed, or immediately
    /// when called re-entrantly from the class's own `+initialize`.
    pub fn initialize_class(&self, class: &Class) {
        self.send_initialize(class);
    }

    pub(crate) fn send_initialize(&self, class: &Class) {
        let class = class.init_owner();
        if class.installed_table().is_some() {
            return;
        }
        self.wait_for_resolution(&class);
        if let Some(superclass) = class.superclass() {
            self.send_initialize(&superclass);
        }

        let runtime_guard = self.lock();
        if class.flags().contains(ClassFlags::INITIALIZED) {
            drop(runtime_guard);
            let _wait = class.init_lock().lock();
            return;
        }
        let class_guard = class.init_lock().lock();
        let Some(meta) = class.metaclass() else {
            return;
        };
        class.insert_flags(ClassFlags::INITIALIZED);
        meta.insert_flags(ClassFlags::INITIALIZED);

        let class_table = self.build_table(&class, None);
        let meta_table = if class.is_root() {
            self.build_table(&meta, Some(&class_table))
        } else {
            self.build_table(&meta, None)
        };

        let initializer = self
            .selectors
            .lookup(INITIALIZE, None)
            .and_then(|sel| meta_table.lookup(sel.dispatch_key()).cloned());
        let Some(initializer) = initializer else {
            class.install_table(Some(Arc::new(class_table)));
            meta.install_table(Some(Arc::new(meta_table)));
            self.bump_version();
            return;
        };

        {
            let mut lookaside = self.lookaside.lock();
            lookaside.push((class.clone(), Arc::new(class_table)));
            lookaside.push((meta.clone(), Arc::new(meta_table)));
        }
        let install = InstallGuard {
            runtime: self,
            class: class.clone(),
            meta,
        };
        drop(runtime_guard);

        oxidec_log::debug!("sending +initialize to {}", class.name());
        let receiver = ObjectPtr::from_class(&class);
        // SAFETY: `initialize` takes no arguments and returns void.
        unsafe {
            (initializer.imp())(
                receiver,
                initializer.selector(),
                std::ptr::null(),
                std::ptr::null_mut(),
            );
        }

        drop(install);
        drop(class_guard);
    }

    pub(crate) fn lookaside_table(&self, class: &Class) -> Option<Arc<DispatchTable>> {
        self.lookaside
            .lock()
            .iter()
            .find(|(pending, _)| pending.ptr_eq(class))
            .map(|(_, table)| Arc::clone(table))
    }

    /// The table dispatch should use for `class`, or `None` if initialization
    /// has not started.
    ///
    /// While `+initialize` runs, the initializing thread gets the lookaside
    /// table and every other thread blocks until it is installed.
    pub(crate) fn dtable_for_class(&self, class: &Class) -> Option<Arc<DispatchTable>> {
        if let Some(table) = class.installed_table() {
            return Some(table);
        }
        self.lookaside_table(class)?;
        let owner = class.init_owner();
        let _wait = owner.init_lock().lock();
        class.installed_table().or_else(|| self.lookaside_table(class))
    }
}
