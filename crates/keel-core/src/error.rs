//! Error types and result aliases shared by keel crates.
//!
//! Errors are structured for programmatic handling: callers match on the
//! variant, operators read the message.

use std::fmt;

/// The result type used throughout keel-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by identifiers and the persistence contract.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An identifier could not be parsed or validated.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// What made the identifier invalid.
        message: String,
    },

    /// A persistence operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A keyed resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The kind of resource looked up.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// An internal invariant was violated.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a storage error with a source cause.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a resource-not-found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true when the error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "zk session expired");
        let err = Error::storage_with_source("failed to read record", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn resource_not_found_is_classified() {
        let err = Error::resource_not_found("instance", "web.instance-1");
        assert!(err.is_not_found());
        assert!(err.to_string().contains("web.instance-1"));
        assert!(!Error::storage("boom").is_not_found());
    }
}
