//! Error taxonomy.
//!
//! Every failure this crate reports is one of these variants. Errors are
//! raised where they are detected and never recovered internally.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors raised by the allocator, the reference protocol and configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Storage could not be obtained, or a reference count would overflow.
    #[error("NoStorageException: {0}")]
    NoStorage(String),

    /// An empty [`Ref`](crate::Ref) was dereferenced.
    #[error("NullPointerException: {0}")]
    NullPointer(&'static str),

    /// `compare()` was invoked against an incompatible concrete type.
    #[error("CompareCastException: {left} cannot compare to {right}")]
    CompareCast {
        /// Type name of the receiver.
        left: String,
        /// Type name of the argument.
        right: String,
    },

    /// An allocator consistency check failed.
    #[error("allocator corrupted: {0}")]
    Corrupted(String),

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn no_storage(what: impl Into<String>) -> Self {
        Error::NoStorage(what.into())
    }

    pub(crate) fn corrupted(what: impl Into<String>) -> Self {
        Error::Corrupted(what.into())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

// Exceptions are Objects too: they can be held through a Ref.
impl crate::object::Object for Error {
    fn string(&self) -> String {
        self.to_string()
    }
}
