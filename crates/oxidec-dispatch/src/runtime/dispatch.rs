//! Message lookup: from a receiver and a selector to an implementation.
//!
//! The fast path loads the effective class's installed table and reads one
//! trie slot, with no lock taken. Everything else is the slow path:
//!
//! 1. nil receivers get a zero-returning stub for the call site's type;
//! 2. a selector this runtime never issued is forwarded before any table is
//!    read, as is a small object whose tag has no class;
//! 3. a class without a table goes through the initialize protocol and the
//!    lookup is retried;
//! 4. under the type-strict policy, a method found only under the name's
//!    untyped slot is a type mismatch, handed to the mismatch hook;
//! 5. the forwarding hook may substitute a receiver, retried once;
//! 6. otherwise the send is logged and answered with zero.
//!
//! Each [`Lookup`] carries the cache version read when the lookup started,
//! or [`CACHE_NEVER`] when the result must not be cached.

use crate::error::Error;
use crate::runtime::class::{Class, Imp, Method};
use crate::runtime::encoding::{ReturnKind, return_kind};
use crate::runtime::forwarding::zero_stub;
use crate::runtime::object::Receiver;
use crate::runtime::selector::{DispatchPolicy, Selector};
use crate::runtime::{CACHE_NEVER, Runtime};
use std::sync::Arc;

/// Result of a message lookup.
#[derive(Clone)]
pub struct Lookup {
    /// The implementation to call.
    pub imp: Imp,
    /// Cache version the result is valid for; [`CACHE_NEVER`] for transient
    /// results.
    pub version: u64,
    /// The receiver to pass, which forwarding may have replaced.
    pub receiver: Receiver,
    /// The method found, if the implementation came from a dispatch table.
    pub method: Option<Arc<Method>>,
}

impl Lookup {
    /// Returns `true` if the result may be cached by the caller.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.version != CACHE_NEVER
    }

    /// Calls the implementation.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must match the implementation's type encoding.
    pub unsafe fn invoke(&self, sel: Selector, args: &[*mut u8], ret: *mut u8) {
        // SAFETY: forwarded to the caller.
        unsafe { (self.imp)(self.receiver.as_ptr(), sel, args.as_ptr().cast(), ret) };
    }
}

impl std::fmt::Debug for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookup")
            .field("imp", &format!("{:p}", self.imp as *const ()))
            .field("version", &self.version)
            .field("receiver", &self.receiver)
            .field("method", &self.method)
            .finish()
    }
}

impl Runtime {
    /// Finds the implementation `receiver` uses for `sel`.
    #[must_use]
    pub fn lookup(&self, receiver: &Receiver, sel: Selector) -> Lookup {
        let version = self.cache_version();
        match self.class_of(receiver) {
            Some(class) => self.lookup_from(receiver, &class, sel, version, true),
            None if receiver.is_nil() => self.zero_result(receiver, sel),
            None => self.forward(receiver, None, sel, true),
        }
    }

    /// Finds the implementation for `sel` starting at `class` rather than
    /// at the receiver's own class (a `super` send).
    #[must_use]
    pub fn lookup_super(&self, receiver: &Receiver, class: &Class, sel: Selector) -> Lookup {
        let version = self.cache_version();
        if receiver.is_nil() {
            return self.zero_result(receiver, sel);
        }
        self.lookup_from(receiver, class, sel, version, true)
    }

    /// Looks `sel` up and calls the implementation.
    ///
    /// # Safety
    ///
    /// `args` and `ret` must match the type encoding of whatever method
    /// `sel` resolves to.
    pub unsafe fn send(&self, receiver: &Receiver, sel: Selector, args: &[*mut u8], ret: *mut u8) {
        let lookup = self.lookup(receiver, sel);
        // SAFETY: forwarded to the caller.
        unsafe { lookup.invoke(sel, args, ret) };
    }

    /// Returns `true` if `receiver`'s class has a method for `sel`, without
    /// consulting forwarding.
    #[must_use]
    pub fn responds_to(&self, receiver: &Receiver, sel: Selector) -> bool {
        self.class_of(receiver)
            .is_some_and(|class| self.method_for(&class, sel).is_some())
    }

    /// The implementation instances of `class` use for `sel`, without
    /// forwarding.
    #[must_use]
    pub fn method_implementation(&self, class: &Class, sel: Selector) -> Option<Imp> {
        self.method_for(class, sel).map(|method| method.imp())
    }

    /// Reads `sel`'s slot, building the table if needed.
    pub(crate) fn method_for(&self, class: &Class, sel: Selector) -> Option<Arc<Method>> {
        if !self.selectors.owns(sel) {
            return None;
        }
        let table = match self.dtable_for_class(class) {
            Some(table) => table,
            None => self.create_dispatch_table(class),
        };
        table.lookup(sel.dispatch_key()).cloned()
    }

    fn lookup_from(
        &self,
        receiver: &Receiver,
        class: &Class,
        sel: Selector,
        version: u64,
        may_forward: bool,
    ) -> Lookup {
        if !self.selectors.owns(sel) {
            let e = Error::SelectorNotRegistered { index: sel.index() };
            oxidec_log::warn!("{e}: sent to {class:?} by another runtime");
            return self.forward(receiver, Some(class), sel, may_forward);
        }

        if let Some(table) = class.installed_table() {
            if let Some(method) = table.lookup(sel.dispatch_key()) {
                return Lookup {
                    imp: method.imp(),
                    version,
                    receiver: receiver.clone(),
                    method: Some(Arc::clone(method)),
                };
            }
        }

        if let Some(method) = self.method_for(class, sel) {
            return Lookup {
                imp: method.imp(),
                version,
                receiver: receiver.clone(),
                method: Some(method),
            };
        }

        let info = match self.selector_info(sel) {
            Ok(info) => info,
            Err(e) => {
                oxidec_log::warn!("{e}: sent to {class:?}");
                return self.forward(receiver, Some(class), sel, may_forward);
            }
        };

        let mismatched = match (self.dispatch_policy(), &info.types) {
            (DispatchPolicy::TypeStrict, Some(_)) => self.method_for(class, info.untyped),
            _ => None,
        };
        if let Some(found) = mismatched {
            let imp = match self.type_mismatch_hook() {
                Some(hook) => hook(receiver, sel, &found),
                None => {
                    oxidec_log::warn!(
                        "{class:?} sent '{}' with types '{}' but implements '{}'",
                        info.name,
                        info.types.as_deref().unwrap_or_default(),
                        found.types()
                    );
                    found.imp()
                }
            };
            return Lookup {
                imp,
                version: CACHE_NEVER,
                receiver: receiver.clone(),
                method: Some(found),
            };
        }

        self.forward(receiver, Some(class), sel, may_forward)
    }

    fn forward(
        &self,
        receiver: &Receiver,
        class: Option<&Class>,
        sel: Selector,
        may_forward: bool,
    ) -> Lookup {
        let target = if may_forward {
            self.forwarding_hook().and_then(|hook| hook(receiver, sel))
        } else {
            None
        };
        if let Some(target) = target {
            oxidec_log::debug!(
                "forwarding {:?} from {receiver:?} to {target:?}",
                self.describe(sel)
            );
            let mut lookup = match self.class_of(&target) {
                Some(target_class) => {
                    self.lookup_from(&target, &target_class, sel, CACHE_NEVER, false)
                }
                None if target.is_nil() => self.zero_result(&target, sel),
                None => self.does_not_understand(&target, None, sel),
            };
            lookup.version = CACHE_NEVER;
            return lookup;
        }
        self.does_not_understand(receiver, class, sel)
    }

    fn does_not_understand(
        &self,
        receiver: &Receiver,
        class: Option<&Class>,
        sel: Selector,
    ) -> Lookup {
        oxidec_log::warn!(
            "{} does not recognize selector {}",
            class.map_or_else(|| format!("{receiver:?}"), |class| format!("{class:?}")),
            self.describe(sel)
        );
        Lookup {
            imp: zero_stub(self.return_kind_of(sel)),
            version: CACHE_NEVER,
            receiver: receiver.clone(),
            method: None,
        }
    }

    fn zero_result(&self, receiver: &Receiver, sel: Selector) -> Lookup {
        Lookup {
            imp: zero_stub(self.return_kind_of(sel)),
            version: CACHE_NEVER,
            receiver: receiver.clone(),
            method: None,
        }
    }

    /// Return type a call site sending `sel` expects; untyped selectors
    /// return a word.
    fn return_kind_of(&self, sel: Selector) -> ReturnKind {
        self.selectors
            .types(sel)
            .map_or(ReturnKind::Word, |types| return_kind(&types))
    }

    fn describe(&self, sel: Selector) -> String {
        self.selectors
            .name(sel)
            .map_or_else(|| format!("#{}", sel.index()), |name| name.to_string())
    }
}
