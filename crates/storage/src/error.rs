//! Collaborator error types and result alias.
//!
//! Every collaborator (persistence, cache store) maps its internal failures
//! onto [`StorageError`]. The variants are split into two groups:
//!
//! - **Transient**: [`Connection`](StorageError::Connection),
//!   [`Timeout`](StorageError::Timeout), [`LockContention`](StorageError::LockContention). Retrying
//!   the same call may succeed.
//! - **Permanent**: everything else. Retrying cannot change the outcome.
//!
//! # Example
//!
//! ```
//! use priorauth_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! assert!(!lookup("authz:1").unwrap_err().is_transient());
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for collaborator operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur when talking to an external collaborator.
///
/// Errors preserve their source chain via the `#[source]` attribute.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested record or key does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// The key or identifier that was not found.
        key: String,
    },

    /// Optimistic concurrency check failed: the stored version moved on.
    #[error("Version conflict")]
    Conflict,

    /// Connection or network error.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The collaborator did not answer in time.
    #[error("Operation timeout")]
    Timeout,

    /// Deadlock or lock contention inside the collaborator.
    #[error("Lock contention: {message}")]
    LockContention {
        /// Description of the contended resource.
        message: String,
    },

    /// The caller is not allowed to perform the operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Why the collaborator refused.
        message: String,
    },

    /// Data could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for collaborator-specific failures.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `LockContention` error.
    #[must_use]
    pub fn lock_contention(message: impl Into<String>) -> Self {
        Self::LockContention { message: message.into() }
    }

    /// Creates a new `PermissionDenied` error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied { message: message.into() }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns `true` when retrying the same call could plausibly succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout | Self::LockContention { .. })
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_with_source(err.to_string(), err)
    }
}

/// Errors produced while validating configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its allowed minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// The rejected value, rendered for display.
        value: String,
        /// The minimum allowed value, rendered for display.
        min: String,
    },

    /// A field holds a value that is structurally invalid.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::connection(StorageError::connection("refused"), true)]
    #[case::timeout(StorageError::timeout(), true)]
    #[case::lock_contention(StorageError::lock_contention("row 7"), true)]
    #[case::not_found(StorageError::not_found("authz:7"), false)]
    #[case::conflict(StorageError::conflict(), false)]
    #[case::permission(StorageError::permission_denied("no role"), false)]
    #[case::serialization(StorageError::serialization("bad json"), false)]
    #[case::internal(StorageError::internal("boom"), false)]
    fn transient_classification(#[case] err: StorageError, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient, "{err}");
    }

    #[test]
    fn source_chain_is_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = StorageError::connection_with_source("db down", io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "reset by peer");
    }

    #[test]
    fn serde_json_errors_map_to_serialization() {
        let err: StorageError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, StorageError::Serialization { .. }));
    }

    #[test]
    fn config_error_display() {
        let err = ConfigError::BelowMinimum {
            field: "max_retries",
            value: "0".into(),
            min: "1".into(),
        };
        assert_eq!(err.to_string(), "max_retries must be at least 1, got 0");
    }
}
