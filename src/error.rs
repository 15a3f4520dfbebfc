//! Error type shared by all objects of the library.
use thiserror::Error;

/// Library-wide error type.
///
/// Every fallible operation either completes its documented postcondition or returns one of
/// these. After an error, the synchronization state of any buffer touched by the failed
/// operation is unspecified.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid dimensions, out-of-range indices, unresolvable resources or missing kernel sources.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Conflicting access to a buffer, unset bindings and other misuse of the API.
    #[error("usage error: {0}")]
    Usage(String),
    /// Failure reported by an execution backend, carrying the backend's own diagnostic.
    #[error("backend error ({backend}): {message}")]
    Backend { backend: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn usage(message: impl Into<String>) -> Self {
        Self::Usage(message.into())
    }

    pub(crate) fn backend(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, Self::Usage(_))
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend { .. })
    }
}

impl From<matfree_quadrature::Error> for Error {
    fn from(err: matfree_quadrature::Error) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Returns a configuration error unless the condition holds.
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Configuration(format!($($arg)+)));
        }
    };
}

/// Returns a usage error unless the condition holds.
macro_rules! ensure_usage {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Usage(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
pub(crate) use ensure_usage;
