//! Message receivers.
//!
//! A [`Receiver`] says explicitly what a message is sent to: nothing, a
//! small immediate value, a heap object, or a class. The effective class for
//! dispatch is, respectively: none (nil handling), the class registered for
//! the small-object tag, the object's `isa`, or the class's metaclass.
//!
//! Implementations receive the receiver as an [`ObjectPtr`], an opaque
//! pointer-sized word.

use crate::error::{Error, Result};
use crate::runtime::class::{Class, ClassInner};
use crate::runtime::{Runtime, SMALL_OBJECT_SLOTS};
use arc_swap::ArcSwap;
use std::ffi::c_void;
use std::fmt;
use std::sync::Arc;

/// Low bits of an [`ObjectPtr`] that carry a small-object tag.
const TAG_MASK: usize = 0b111;
const TAG_BITS: u32 = 3;

/// Opaque receiver word passed to implementations.
///
/// For heap objects and classes this is the address of the runtime's
/// metadata; for small objects it is `payload << 3 | tag`; for nil it is
/// null.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectPtr(*const c_void);

impl ObjectPtr {
    /// The nil receiver.
    pub const NULL: ObjectPtr = ObjectPtr(std::ptr::null());

    pub(crate) fn from_class(class: &Class) -> ObjectPtr {
        ObjectPtr(class.as_ptr().cast())
    }

    /// Returns `true` for the nil receiver.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// The raw word.
    #[must_use]
    pub fn as_raw(self) -> *const c_void {
        self.0
    }

    /// Tag and payload if this word encodes a small object.
    #[must_use]
    pub fn small_object(self) -> Option<SmallObject> {
        let word = self.0 as usize;
        #[allow(clippy::cast_possible_truncation)]
        let tag = (word & TAG_MASK) as u8;
        (tag != 0).then(|| SmallObject {
            tag,
            payload: word >> TAG_BITS,
        })
    }
}

impl fmt::Debug for ObjectPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectPtr({:p})", self.0)
    }
}

/// An immediate value whose class is selected by a 3-bit tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallObject {
    tag: u8,
    payload: usize,
}

impl SmallObject {
    /// Creates a small object.
    ///
    /// The payload keeps its low `usize::BITS - 3` bits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSmallObjectTag`] unless `tag` is in `1..=7`.
    pub fn new(tag: u8, payload: usize) -> Result<Self> {
        if tag == 0 || usize::from(tag) >= SMALL_OBJECT_SLOTS {
            return Err(Error::InvalidSmallObjectTag { tag });
        }
        Ok(SmallObject {
            tag,
            payload: payload & (usize::MAX >> TAG_BITS),
        })
    }

    /// The class-selecting tag.
    #[must_use]
    pub fn tag(self) -> u8 {
        self.tag
    }

    /// The immediate value.
    #[must_use]
    pub fn payload(self) -> usize {
        self.payload
    }

    /// The tagged word handed to implementations.
    #[must_use]
    pub fn as_ptr(self) -> ObjectPtr {
        ObjectPtr(((self.payload << TAG_BITS) | usize::from(self.tag)) as *const c_void)
    }
}

struct ObjectInner {
    isa: ArcSwap<ClassInner>,
}

/// A heap-allocated instance.
///
/// Clones share the instance. The class pointer can be swapped at runtime
/// with [`Object::set_class`]; concurrent sends see either class.
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    /// Creates an instance of `class`.
    #[must_use]
    pub fn new(class: &Class) -> Self {
        Object {
            inner: Arc::new(ObjectInner {
                isa: ArcSwap::new(Arc::clone(&class.inner)),
            }),
        }
    }

    /// The object's current class.
    #[must_use]
    pub fn class(&self) -> Class {
        Class::from_inner(self.inner.isa.load_full())
    }

    /// Replaces the object's class, returning the previous one.
    pub fn set_class(&self, class: &Class) -> Class {
        Class::from_inner(self.inner.isa.swap(Arc::clone(&class.inner)))
    }

    /// Number of handles sharing this instance.
    #[must_use]
    pub fn refcount(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns `true` if both handles share one instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The receiver word handed to implementations.
    #[must_use]
    pub fn as_ptr(&self) -> ObjectPtr {
        ObjectPtr(Arc::as_ptr(&self.inner).cast())
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}: {:p}>", self.class().name(), Arc::as_ptr(&self.inner))
    }
}

/// The target of a message send.
#[derive(Debug, Clone, Default)]
pub enum Receiver {
    /// Messages to nil return zero.
    #[default]
    Nil,
    /// An immediate value.
    Small(SmallObject),
    /// A heap instance.
    Object(Object),
    /// A class, dispatched through its metaclass.
    Class(Class),
}

impl Receiver {
    /// Returns `true` for [`Receiver::Nil`].
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Receiver::Nil)
    }

    /// The word handed to implementations.
    #[must_use]
    pub fn as_ptr(&self) -> ObjectPtr {
        match self {
            Receiver::Nil => ObjectPtr::NULL,
            Receiver::Small(small) => small.as_ptr(),
            Receiver::Object(object) => object.as_ptr(),
            Receiver::Class(class) => ObjectPtr::from_class(class),
        }
    }
}

impl From<Object> for Receiver {
    fn from(object: Object) -> Self {
        Receiver::Object(object)
    }
}

impl From<SmallObject> for Receiver {
    fn from(small: SmallObject) -> Self {
        Receiver::Small(small)
    }
}

impl From<Class> for Receiver {
    fn from(class: Class) -> Self {
        Receiver::Class(class)
    }
}

impl Runtime {
    /// Registers the class used for small objects carrying `tag`.
    ///
    /// Returns the class previously registered for the tag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSmallObjectTag`] unless `tag` is in `1..=7`.
    pub fn register_small_object_class(&self, tag: u8, class: &Class) -> Result<Option<Class>> {
        SmallObject::new(tag, 0)?;
        let _guard = self.lock();
        let previous = self.small_classes[usize::from(tag)].swap(Some(Arc::clone(&class.inner)));
        self.bump_version();
        oxidec_log::debug!("small object tag {tag} now dispatches to {}", class.name());
        Ok(previous.map(Class::from_inner))
    }

    /// The class dispatch starts from for `receiver`, or `None` for nil and
    /// for small objects whose tag has no class.
    #[must_use]
    pub fn class_of(&self, receiver: &Receiver) -> Option<Class> {
        match receiver {
            Receiver::Nil => None,
            Receiver::Small(small) => self.small_classes[usize::from(small.tag())]
                .load_full()
                .map(Class::from_inner),
            Receiver::Object(object) => Some(object.class()),
            Receiver::Class(class) => class.metaclass(),
        }
    }
}
