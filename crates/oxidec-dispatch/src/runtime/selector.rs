//! Selector uniquing for the `OxideC` dispatch core.
//!
//! A selector is the runtime identity of a message name, optionally paired
//! with the type signature a call site expects. The [`SelectorTable`]
//! uniques `(name, types)` pairs to small permanent integer handles:
//!
//! - every name has one canonical *untyped* selector, registered first;
//! - each distinct signature registered for that name becomes a *typed*
//!   variant chained under the untyped entry;
//! - signatures are compared with [`types_equal`], so `*` and `^c` unique
//!   to the same variant.
//!
//! # Dispatch identity
//!
//! Which handles share a dispatch-table slot depends on the
//! [`DispatchPolicy`]. Under [`DispatchPolicy::TypeTolerant`] every variant
//! of a name dispatches through the untyped entry's slot. Under
//! [`DispatchPolicy::TypeStrict`] each variant has its own slot. The slot is
//! baked into the [`Selector`] handle at registration, so the send path
//! never consults the table.
//!
//! Handles also carry the identity of the table that issued them. A handle
//! from another runtime is never mistaken for a local one, even when its
//! index and slot coincide with a registered selector.
//!
//! # Thread Safety
//!
//! Lookups take a read lock; registration takes the write lock and
//! re-checks before inserting. Handles are `Copy` and never invalidated.

use crate::runtime::encoding::types_equal;
use fxhash::FxHashMap;
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_TABLE_ID: AtomicU32 = AtomicU32::new(1);

/// How typed variants of a selector name map onto dispatch-table slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchPolicy {
    /// All variants of a name share the untyped selector's slot.
    TypeTolerant,
    /// Every signature is dispatched independently; calls whose signature
    /// disagrees with the installed method go to the type-mismatch hook.
    TypeStrict,
}

impl Default for DispatchPolicy {
    /// The policy chosen at build time: strict with the `type-strict`
    /// feature, tolerant otherwise.
    fn default() -> Self {
        if cfg!(feature = "type-strict") {
            DispatchPolicy::TypeStrict
        } else {
            DispatchPolicy::TypeTolerant
        }
    }
}

impl std::str::FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tolerant" | "type-tolerant" => Ok(DispatchPolicy::TypeTolerant),
            "strict" | "type-strict" => Ok(DispatchPolicy::TypeStrict),
            _ => Err(format!("invalid dispatch policy: {s}")),
        }
    }
}

/// A uniqued message identifier.
///
/// The handle carries its permanent index, the dispatch-table key it was
/// assigned under the runtime's [`DispatchPolicy`] and the id of the issuing
/// table. Two handles are equal exactly when the same table returned them
/// for the same `(name, types)` pair.
#[repr(C)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Selector {
    index: u32,
    key: u32,
    table: u32,
}

impl Selector {
    /// Permanent, unique index of this selector.
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Key of the dispatch-table slot this selector is sent through.
    #[inline]
    #[must_use]
    pub const fn dispatch_key(self) -> u32 {
        self.key
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector(#{}", self.index)?;
        if self.key != self.index {
            write!(f, " -> #{}", self.key)?;
        }
        write!(f, ")")
    }
}

/// Everything the table knows about one selector.
#[derive(Debug, Clone)]
pub struct SelectorInfo {
    /// Message name, e.g. `"setValue:forKey:"`.
    pub name: Arc<str>,
    /// Signature for typed variants, `None` for the canonical entry.
    pub types: Option<Arc<str>>,
    /// The canonical untyped selector for `name`.
    pub untyped: Selector,
    /// This selector's own handle.
    pub selector: Selector,
}

/// Variants registered under one name; `untyped` always exists.
struct TypeChain {
    untyped: Selector,
    typed: Vec<Selector>,
}

struct Entry {
    name: Arc<str>,
    types: Option<Arc<str>>,
    untyped: Selector,
}

#[derive(Default)]
struct TableInner {
    entries: Vec<Entry>,
    by_name: FxHashMap<Arc<str>, TypeChain>,
}

impl TableInner {
    fn find(&self, name: &str, types: Option<&str>) -> Option<Selector> {
        let chain = self.by_name.get(name)?;
        match types {
            None => Some(chain.untyped),
            Some(types) => chain.typed.iter().copied().find(|sel| {
                self.entries[sel.index as usize]
                    .types
                    .as_deref()
                    .is_some_and(|registered| types_equal(registered, types))
            }),
        }
    }

    fn next_index(&self) -> u32 {
        u32::try_from(self.entries.len())
            .unwrap_or_else(|_| oxidec_log::fatal!("selector index space exhausted"))
    }
}

/// Runtime-wide selector registry.
pub struct SelectorTable {
    id: u32,
    policy: DispatchPolicy,
    inner: RwLock<TableInner>,
}

impl SelectorTable {
    /// Creates an empty table dispatching under `policy`.
    #[must_use]
    pub fn new(policy: DispatchPolicy) -> Self {
        SelectorTable {
            id: NEXT_TABLE_ID.fetch_add(1, Ordering::Relaxed),
            policy,
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// The dispatch policy handles from this table were assigned under.
    #[must_use]
    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Returns the selector for `(name, types)`, registering it if needed.
    ///
    /// Registering a typed variant first registers the untyped selector for
    /// `name`. Repeated registration of an equal pair returns the same
    /// handle.
    pub fn register(&self, name: &str, types: Option<&str>) -> Selector {
        if let Some(sel) = self.inner.read().find(name, types) {
            return sel;
        }

        let mut inner = self.inner.write();
        if let Some(sel) = inner.find(name, types) {
            return sel;
        }

        let untyped = match inner.by_name.get(name) {
            Some(chain) => chain.untyped,
            None => {
                let index = inner.next_index();
                let sel = Selector {
                    index,
                    key: index,
                    table: self.id,
                };
                let name: Arc<str> = Arc::from(name);
                inner.entries.push(Entry {
                    name: Arc::clone(&name),
                    types: None,
                    untyped: sel,
                });
                inner.by_name.insert(
                    name,
                    TypeChain {
                        untyped: sel,
                        typed: Vec::new(),
                    },
                );
                oxidec_log::trace!(
                    "registered selector #{index} '{}'",
                    inner.entries[index as usize].name
                );
                sel
            }
        };

        let Some(types) = types else {
            return untyped;
        };

        let index = inner.next_index();
        let key = match self.policy {
            DispatchPolicy::TypeTolerant => untyped.key,
            DispatchPolicy::TypeStrict => index,
        };
        let sel = Selector {
            index,
            key,
            table: self.id,
        };
        let name = Arc::clone(&inner.entries[untyped.index as usize].name);
        inner.entries.push(Entry {
            name: Arc::clone(&name),
            types: Some(Arc::from(types)),
            untyped,
        });
        if let Some(chain) = inner.by_name.get_mut(&*name) {
            chain.typed.push(sel);
        }
        oxidec_log::trace!("registered selector #{index} '{name}' with types '{types}'");
        sel
    }

    /// Finds an already registered selector without registering it.
    #[must_use]
    pub fn lookup(&self, name: &str, types: Option<&str>) -> Option<Selector> {
        self.inner.read().find(name, types)
    }

    /// Returns `true` if `sel` carries this table's id. Takes no lock.
    #[inline]
    #[must_use]
    pub fn owns(&self, sel: Selector) -> bool {
        sel.table == self.id
    }

    /// Returns `true` if `sel` was issued by this table.
    #[must_use]
    pub fn is_registered(&self, sel: Selector) -> bool {
        if !self.owns(sel) {
            return false;
        }
        let inner = self.inner.read();
        inner.entries.get(sel.index as usize).is_some_and(|entry| {
            let expected = match (self.policy, &entry.types) {
                (DispatchPolicy::TypeTolerant, _) | (_, None) => entry.untyped.key,
                (DispatchPolicy::TypeStrict, Some(_)) => sel.index,
            };
            expected == sel.key
        })
    }

    /// Name of `sel`, or `None` for a foreign handle.
    #[must_use]
    pub fn name(&self, sel: Selector) -> Option<Arc<str>> {
        self.info(sel).map(|info| info.name)
    }

    /// Signature of `sel`; `None` for untyped or foreign handles.
    #[must_use]
    pub fn types(&self, sel: Selector) -> Option<Arc<str>> {
        self.info(sel).and_then(|info| info.types)
    }

    /// The canonical untyped selector for `sel`'s name.
    #[must_use]
    pub fn untyped(&self, sel: Selector) -> Option<Selector> {
        self.info(sel).map(|info| info.untyped)
    }

    /// Name, signature and chain information for `sel`.
    #[must_use]
    pub fn info(&self, sel: Selector) -> Option<SelectorInfo> {
        if !self.is_registered(sel) {
            return None;
        }
        let inner = self.inner.read();
        let entry = inner.entries.get(sel.index as usize)?;
        Some(SelectorInfo {
            name: Arc::clone(&entry.name),
            types: entry.types.clone(),
            untyped: entry.untyped,
            selector: sel,
        })
    }

    /// Every signature registered for `name`, in registration order.
    #[must_use]
    pub fn types_for_name(&self, name: &str) -> Vec<Arc<str>> {
        let inner = self.inner.read();
        inner.by_name.get(name).map_or_else(Vec::new, |chain| {
            chain
                .typed
                .iter()
                .filter_map(|sel| inner.entries[sel.index as usize].types.clone())
                .collect()
        })
    }

    /// Number of registered selectors, typed variants included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Returns `true` if nothing has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SelectorTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectorTable")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_untyped_registration_is_idempotent() {
        let table = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let first = table.register("init", None);
        let second = table.register("init", None);
        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_typed_variant_is_distinct_but_same_name() {
        let table = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let untyped = table.register("foo", None);
        let typed = table.register("foo", Some("v@:i"));

        assert_ne!(untyped, typed);
        assert_eq!(table.name(untyped), table.name(typed));
        assert_eq!(table.types(untyped), None);
        assert_eq!(table.types(typed).as_deref(), Some("v@:i"));
        assert_eq!(table.untyped(typed), Some(untyped));
    }

    #[test]
    fn test_typed_registration_creates_untyped_first() {
        let table = SelectorTable::new(DispatchPolicy::TypeStrict);
        let typed = table.register("bar:", Some("v@:@"));
        let untyped = table.lookup("bar:", None).unwrap();
        assert!(untyped.index() < typed.index());
        assert_eq!(table.register("bar:", Some("v16@0:8@16")), typed);
    }

    #[test]
    fn test_c_string_shorthand_uniques_together() {
        let table = SelectorTable::new(DispatchPolicy::TypeStrict);
        let a = table.register("log:", Some("v@:*"));
        let b = table.register("log:", Some("v@:^c"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_tolerant_policy_shares_dispatch_key() {
        let table = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let untyped = table.register("count", None);
        let int = table.register("count", Some("i@:"));
        let long = table.register("count", Some("q@:"));
        assert_eq!(int.dispatch_key(), untyped.dispatch_key());
        assert_eq!(long.dispatch_key(), untyped.dispatch_key());
        assert_eq!(table.info(int).unwrap().untyped, untyped);
    }

    #[test]
    fn test_strict_policy_separates_dispatch_keys() {
        let table = SelectorTable::new(DispatchPolicy::TypeStrict);
        let untyped = table.register("count", None);
        let int = table.register("count", Some("i@:"));
        let long = table.register("count", Some("q@:"));
        assert_ne!(int.dispatch_key(), long.dispatch_key());
        assert_ne!(int.dispatch_key(), untyped.dispatch_key());
        assert_eq!(int.dispatch_key(), int.index());
        assert_eq!(untyped.dispatch_key(), untyped.index());
    }

    #[test]
    fn test_types_for_name_enumerates_variants() {
        let table = SelectorTable::new(DispatchPolicy::TypeTolerant);
        table.register("value", Some("i@:"));
        table.register("value", Some("d@:"));
        table.register("value", Some("i16@0:8"));
        let types: Vec<String> = table
            .types_for_name("value")
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(types, vec!["i@:", "d@:"]);
        assert!(table.types_for_name("missing").is_empty());
    }

    #[test]
    fn test_foreign_handle_is_not_registered() {
        let ours = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let theirs = SelectorTable::new(DispatchPolicy::TypeTolerant);
        for i in 0..4 {
            theirs.register(&format!("sel{i}"), None);
        }
        let foreign = theirs.register("onlyThere", None);
        assert!(!ours.is_registered(foreign));
        assert!(ours.name(foreign).is_none());
    }

    #[test]
    fn test_foreign_handle_with_local_index_is_not_registered() {
        let ours = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let theirs = SelectorTable::new(DispatchPolicy::TypeTolerant);
        let local = ours.register("here", None);
        let foreign = theirs.register("there", None);
        assert_eq!(foreign.index(), local.index());
        assert_eq!(foreign.dispatch_key(), local.dispatch_key());
        assert_ne!(foreign, local);
        assert!(ours.owns(local));
        assert!(!ours.owns(foreign));
        assert!(ours.info(foreign).is_none());
    }

    #[test]
    fn test_concurrent_registration_uniques() {
        let table = Arc::new(SelectorTable::new(DispatchPolicy::TypeTolerant));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    (0..50)
                        .map(|i| table.register(&format!("shared{i}:"), Some("v@:@")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<Selector>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
        // 50 untyped names plus one typed variant each.
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("strict".parse(), Ok(DispatchPolicy::TypeStrict));
        assert_eq!("Type-Tolerant".parse(), Ok(DispatchPolicy::TypeTolerant));
        assert!("loose".parse::<DispatchPolicy>().is_err());
    }
}
