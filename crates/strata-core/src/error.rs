//! Error types shared across the Strata storage engine.
//!
//! The taxonomy separates caller mistakes (`NotFound`, `AlreadyExists`) from
//! deployment problems (`BackendUnavailable`, `SchemaMismatch`, `Config`) and
//! from storage-layer bugs (`InvariantViolation`, which is always fatal).

/// The result type used throughout Strata.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A requested entity is absent and the operation requires it to exist.
    ///
    /// Pure lookups return `Ok(None)` instead; this variant is reserved for
    /// updates and explicit deletes that expected the entity to be present.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// The kind of entity that was requested (e.g. "run", "tick").
        entity: &'static str,
        /// The key that was looked up.
        key: String,
    },

    /// Creation of an entity whose unique key is already present.
    #[error("{entity} already exists: {key}")]
    AlreadyExists {
        /// The kind of entity being created.
        entity: &'static str,
        /// The conflicting key.
        key: String,
    },

    /// A transient backend connectivity or transaction failure.
    ///
    /// Never swallowed by the stores; the caller owns retry policy.
    #[error("backend unavailable: {message}")]
    BackendUnavailable {
        /// Description of the backend failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backend data shape does not match the expected schema version.
    ///
    /// Fatal until `migrate` is run against the backend.
    #[error("schema mismatch: found version {found}, expected {expected}")]
    SchemaMismatch {
        /// The schema version found in the backend.
        found: i64,
        /// The schema version this build expects.
        expected: i64,
    },

    /// A defensive check inside the storage layer failed.
    ///
    /// Always indicates a storage bug rather than caller misuse.
    #[error("storage invariant violated: {message}")]
    InvariantViolation {
        /// Description of the violated invariant.
        message: String,
    },

    /// A serialization or deserialization failure.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Invalid or unresolvable storage configuration.
    ///
    /// Surfaced at startup when resolving backend specifications.
    #[error("config error: {message}")]
    Config {
        /// Description of the configuration problem.
        message: String,
    },

    /// An identifier failed to parse.
    #[error("invalid id: {message}")]
    InvalidId {
        /// Description of the parse failure.
        message: String,
    },
}

impl Error {
    /// Creates a `NotFound` error for the given entity kind and key.
    #[must_use]
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Creates an `AlreadyExists` error for the given entity kind and key.
    #[must_use]
    pub fn already_exists(entity: &'static str, key: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity,
            key: key.into(),
        }
    }

    /// Creates a `BackendUnavailable` error without a source.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a `BackendUnavailable` error with an underlying cause.
    #[must_use]
    pub fn backend_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::BackendUnavailable {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an `InvariantViolation` error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    /// Creates a `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a `Config` error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns true if this error is a `NotFound`.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this error is an `AlreadyExists`.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
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
    fn not_found_display() {
        let err = Error::not_found("run", "abc123");
        assert_eq!(err.to_string(), "run not found: abc123");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
    }

    #[test]
    fn already_exists_display() {
        let err = Error::already_exists("instigator state", "origin/selector");
        assert!(err.to_string().contains("already exists"));
        assert!(err.is_already_exists());
    }

    #[test]
    fn backend_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::backend_with_source("failed to open database", source);
        assert!(err.to_string().contains("backend unavailable"));
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn schema_mismatch_display() {
        let err = Error::SchemaMismatch {
            found: 2,
            expected: 1,
        };
        assert!(err.to_string().contains("found version 2"));
    }
}
