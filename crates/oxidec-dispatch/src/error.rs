//! Error types for the `OxideC` dispatch core.
//!
//! Only the management surface (selector and class registration, dynamic
//! class creation, queries) reports errors through [`Result`]. The message
//! send path has no error channel: a missing method is resolved through
//! forwarding, and anything that leaves shared structures inconsistent is
//! fatal (see [`oxidec_log::fatal!`]).

use std::fmt;

/// Errors reported by the runtime's management APIs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A class with this name is already registered.
    ClassAlreadyExists {
        /// The clashing class name.
        name: String,
    },

    /// No class with this name is registered.
    ClassNotFound {
        /// The requested class name.
        name: String,
    },

    /// The class is not linked into the hierarchy yet.
    ClassNotResolved {
        /// The unresolved class name.
        name: String,
    },

    /// The class still has registered subclasses and cannot be disposed.
    ClassHasSubclasses {
        /// The class that was to be disposed.
        name: String,
    },

    /// A dynamically allocated class was registered twice.
    ClassAlreadyRegistered,

    /// Setting this superclass would make the class its own ancestor.
    InheritanceCycle,

    /// The selector handle was issued by another runtime.
    SelectorNotRegistered {
        /// Index of the rejected handle.
        index: u32,
    },

    /// Small-object tags must be in `1..=7`.
    InvalidSmallObjectTag {
        /// The rejected tag.
        tag: u8,
    },

    /// A load descriptor was built for a different record ABI than the one
    /// already loaded.
    IncompatibleAbi {
        /// ABI version of the records already loaded.
        loaded: u32,
        /// ABI version of the rejected descriptor.
        requested: u32,
    },

    /// A type encoding string could not be parsed.
    InvalidEncoding {
        /// The offending encoding.
        encoding: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ClassAlreadyExists { name } => {
                write!(f, "Class '{name}' already exists in registry")
            }
            Error::ClassNotFound { name } => {
                write!(f, "Class '{name}' not found")
            }
            Error::ClassNotResolved { name } => {
                write!(f, "Class '{name}' is not resolved")
            }
            Error::ClassHasSubclasses { name } => {
                write!(f, "Class '{name}' still has subclasses")
            }
            Error::ClassAlreadyRegistered => {
                write!(f, "Class pair already registered")
            }
            Error::InheritanceCycle => write!(f, "Inheritance cycle detected"),
            Error::SelectorNotRegistered { index } => {
                write!(f, "Selector #{index} is not registered")
            }
            Error::InvalidSmallObjectTag { tag } => {
                write!(f, "Invalid small object tag {tag}: expected 1..=7")
            }
            Error::IncompatibleAbi { loaded, requested } => {
                write!(
                    f,
                    "Incompatible record ABI: loaded v{loaded}, requested v{requested}"
                )
            }
            Error::InvalidEncoding { encoding } => {
                write!(f, "Invalid type encoding string '{encoding}'")
            }
        }
    }
}

impl std::error::Error for Error {}

/// Result type for `OxideC` dispatch-core operations.
pub type Result<T> = std::result::Result<T, Error>;
