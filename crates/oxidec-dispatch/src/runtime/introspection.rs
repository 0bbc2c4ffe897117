//! Runtime introspection and dynamic class creation.
//!
//! This module provides:
//!
//! - **Class enumeration**: registered classes, subclasses, hierarchy walks
//! - **Method enumeration**: declared methods and installed table contents
//! - **Conformance**: protocol names adopted along the hierarchy
//! - **Dynamic classes**: allocate, register and dispose class pairs

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::runtime::class::{Class, ClassFlags, Ivar, Method, PairSpec};
use crate::runtime::selector::Selector;
use fxhash::FxHashSet;
use std::sync::Arc;

// ============================================================================
// Class Enumeration
// ============================================================================

impl Runtime {
    /// Every registered class, in insertion order.
    #[must_use]
    pub fn all_classes(&self) -> Vec<Class> {
        self.classes.read().all()
    }

    /// Direct subclasses of `class`. A root metaclass is not reported as a
    /// subclass of its root class.
    #[must_use]
    pub fn subclasses(&self, class: &Class) -> Vec<Class> {
        let meta = class.metaclass();
        class
            .subclasses()
            .into_iter()
            .filter(|sub| Some(sub) != meta.as_ref())
            .collect()
    }

    /// `class` followed by its superclasses up to the root.
    #[must_use]
    pub fn class_hierarchy(&self, class: &Class) -> Vec<Class> {
        let mut chain = vec![class.clone()];
        let mut cursor = class.superclass();
        while let Some(current) = cursor {
            // A root metaclass's chain ends at the root class.
            if chain.contains(&current) {
                break;
            }
            cursor = current.superclass();
            chain.push(current);
        }
        chain
    }

    /// Returns `true` if `class` is `ancestor` or inherits from it.
    #[must_use]
    pub fn is_subclass_of(&self, class: &Class, ancestor: &Class) -> bool {
        self.class_hierarchy(class).contains(ancestor)
    }

    /// Returns `true` if `class` or a superclass adopts `protocol`.
    #[must_use]
    pub fn conforms_to(&self, class: &Class, protocol: &str) -> bool {
        self.class_hierarchy(&class.init_owner())
            .iter()
            .any(|current| current.protocols().iter().any(|adopted| &**adopted == protocol))
    }

    // ========================================================================
    // Method Enumeration
    // ========================================================================

    /// Methods declared directly on `class`, newest list first, one per
    /// selector: the one dispatch would pick among them.
    #[must_use]
    pub fn class_methods(&self, class: &Class) -> Vec<Arc<Method>> {
        let mut seen = FxHashSet::default();
        class
            .method_lists()
            .iter()
            .flat_map(|list| list.methods().to_vec())
            .filter(|method| seen.insert(method.selector()))
            .collect()
    }

    /// Contents of `class`'s dispatch table as `(key, method)` pairs in key
    /// order, building the table first if needed.
    #[must_use]
    pub fn table_methods(&self, class: &Class) -> Vec<(u32, Arc<Method>)> {
        self.create_dispatch_table(class)
            .iter()
            .map(|(key, method)| (key, Arc::clone(method)))
            .collect()
    }

    /// Returns `true` if instances of `class` respond to `sel`.
    #[must_use]
    pub fn instances_respond_to(&self, class: &Class, sel: Selector) -> bool {
        self.method_implementation(class, sel).is_some()
    }

    // ========================================================================
    // Dynamic Classes
    // ========================================================================

    /// Creates an unregistered class pair named `name` under `superclass`.
    ///
    /// Add methods with [`Runtime::add_method`], then make the class
    /// visible with [`Runtime::register_class_pair`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClassAlreadyExists`] if the name is taken.
    pub fn allocate_class_pair(
        &self,
        superclass: Option<&Class>,
        name: &str,
        ivars: Vec<Ivar>,
    ) -> Result<Class> {
        if self.classes.read().contains(name) {
            return Err(Error::ClassAlreadyExists { name: name.to_string() });
        }
        let superclass_name = superclass.map(|class| Arc::from(class.init_owner().name()));
        Ok(Class::new_pair(PairSpec {
            name: Arc::from(name),
            superclass_name,
            ivars,
            instance_methods: None,
            class_methods: None,
            protocols: Vec::new(),
            flags: ClassFlags::USER_CREATED,
        }))
    }

    /// Inserts a class pair created by [`Runtime::allocate_class_pair`].
    ///
    /// # Errors
    ///
    /// - [`Error::ClassAlreadyRegistered`] if the pair is already registered
    /// - [`Error::ClassAlreadyExists`] if another class took the name
    pub fn register_class_pair(&self, class: &Class) -> Result<()> {
        let class = class.init_owner();
        if class.flags().contains(ClassFlags::REGISTERED) {
            return Err(Error::ClassAlreadyRegistered);
        }
        self.insert_class_locked(&class)
    }

    /// Removes a class pair from the runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::ClassHasSubclasses`] while any class inherits from it
    /// - [`Error::ClassNotFound`] if it is not registered
    pub fn dispose_class_pair(&self, class: &Class) -> Result<()> {
        let class = class.init_owner();
        let _guard = self.lock();
        if !self.subclasses(&class).is_empty() {
            return Err(Error::ClassHasSubclasses {
                name: class.name().to_string(),
            });
        }
        if !self.classes.read().get(class.name()).is_some_and(|registered| registered == class) {
            return Err(Error::ClassNotFound {
                name: class.name().to_string(),
            });
        }

        self.classes.write().remove(&class);
        let meta = class.metaclass();
        if let Some(superclass) = class.superclass() {
            superclass.remove_subclass(&class);
        }
        if let Some(meta) = &meta {
            match meta.superclass() {
                Some(super_meta) if super_meta != class => super_meta.remove_subclass(meta),
                _ => class.remove_subclass(meta),
            }
        }
        for slot in &self.small_classes {
            let current = slot.load_full();
            if current.is_some_and(|inner| Arc::ptr_eq(&inner, &class.inner)) {
                slot.store(None);
            }
        }
        for target in std::iter::once(&class).chain(meta.as_ref()) {
            target.unlink_for_teardown();
            target.remove_flags(
                ClassFlags::REGISTERED | ClassFlags::RESOLVED | ClassFlags::INITIALIZED,
            );
        }
        self.bump_version();
        oxidec_log::debug!("disposed class {}", class.name());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::object::ObjectPtr;
    use crate::runtime::{CategoryRecord, ClassRecord, LoadDescriptor, MethodRecord};

    unsafe extern "C-unwind" fn noop(_: ObjectPtr, _: Selector, _: *const *mut u8, _: *mut u8) {}

    fn loaded() -> Runtime {
        let runtime = Runtime::new();
        runtime.load(
            &LoadDescriptor::new()
                .with_class(ClassRecord::root("Object").with_protocol("Equatable"))
                .with_class(
                    ClassRecord::new("Shape", "Object")
                        .with_instance_method(MethodRecord::new("area", "d@:", noop))
                        .with_instance_method(MethodRecord::new("area", "d@:", noop)),
                )
                .with_class(ClassRecord::new("Circle", "Shape"))
                .with_category(
                    CategoryRecord::new("Shape", "Drawing")
                        .with_instance_method(MethodRecord::new("draw", "v@:", noop)),
                ),
        );
        runtime
    }

    #[test]
    fn test_hierarchy_and_subclasses() {
        let runtime = loaded();
        let object = runtime.class_named("Object").unwrap();
        let shape = runtime.class_named("Shape").unwrap();
        let circle = runtime.class_named("Circle").unwrap();
        assert_eq!(runtime.all_classes().len(), 3);
        assert_eq!(runtime.subclasses(&object), vec![shape.clone()]);
        assert_eq!(
            runtime.class_hierarchy(&circle),
            vec![circle.clone(), shape.clone(), object.clone()]
        );
        assert!(runtime.is_subclass_of(&circle, &object));
        assert!(!runtime.is_subclass_of(&object, &circle));
        assert!(runtime.conforms_to(&circle, "Equatable"));
        assert!(!runtime.conforms_to(&circle, "Hashable"));
    }

    #[test]
    fn test_root_metaclass_hierarchy_ends_at_root() {
        let runtime = loaded();
        let object = runtime.class_named("Object").unwrap();
        let meta = object.metaclass().unwrap();
        assert_eq!(runtime.class_hierarchy(&meta), vec![meta.clone(), object.clone()]);
    }

    #[test]
    fn test_class_methods_deduplicated_newest_first() {
        let runtime = loaded();
        let shape = runtime.class_named("Shape").unwrap();
        let names: Vec<String> = runtime
            .class_methods(&shape)
            .iter()
            .map(|method| runtime.selector_name(method.selector()).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["draw", "area"]);
    }

    #[test]
    fn test_table_methods_include_inherited() {
        let runtime = loaded();
        let circle = runtime.class_named("Circle").unwrap();
        let area = runtime.lookup_selector("area", Some("d@:")).unwrap();
        let keys: Vec<u32> = runtime.table_methods(&circle).iter().map(|(key, _)| *key).collect();
        assert!(keys.contains(&area.dispatch_key()));
        assert!(runtime.instances_respond_to(&circle, area));
    }

    #[test]
    fn test_dynamic_class_lifecycle() {
        let runtime = loaded();
        let object = runtime.class_named("Object").unwrap();
        let dynamic = runtime.allocate_class_pair(Some(&object), "Dynamic", Vec::new()).unwrap();
        assert!(runtime.add_method(&dynamic, "ping", "v@:", noop));
        assert!(runtime.class_named("Dynamic").is_none());

        runtime.register_class_pair(&dynamic).unwrap();
        assert_eq!(runtime.register_class_pair(&dynamic), Err(Error::ClassAlreadyRegistered));
        assert!(dynamic.is_resolved());
        assert!(dynamic.flags().contains(ClassFlags::USER_CREATED));
        let ping = runtime.lookup_selector("ping", Some("v@:")).unwrap();
        assert!(runtime.instances_respond_to(&dynamic, ping));

        assert!(matches!(
            runtime.allocate_class_pair(Some(&object), "Dynamic", Vec::new()),
            Err(Error::ClassAlreadyExists { .. })
        ));
        runtime.dispose_class_pair(&dynamic).unwrap();
        assert!(runtime.class_named("Dynamic").is_none());
        assert!(!runtime.subclasses(&object).contains(&dynamic));
    }

    #[test]
    fn test_dispose_refused_with_subclasses() {
        let runtime = loaded();
        let shape = runtime.class_named("Shape").unwrap();
        assert_eq!(
            runtime.dispose_class_pair(&shape),
            Err(Error::ClassHasSubclasses { name: "Shape".into() })
        );
    }
}
