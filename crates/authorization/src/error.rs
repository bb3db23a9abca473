//! Error types for authorization operations.
//!
//! Every failure surfaced by [`AuthorizationService`](crate::AuthorizationService)
//! is an [`AuthorizationError`]. Each variant has a fixed [`ErrorClass`] that
//! the retry executor uses to decide whether another attempt is worthwhile.
//!
//! # Classification
//!
//! | Variant | Class |
//! |---------|-------|
//! | `Connection`, `Timeout`, `LockContention` | retryable |
//! | `Storage` with a transient source | retryable |
//! | everything else | non-retryable |
//!
//! [`RetriesExhausted`](AuthorizationError::RetriesExhausted) is non-retryable
//! so nested executors never multiply attempts.

use std::time::Duration;

use priorauth_storage::{BoxError, StorageError};
use thiserror::Error;

use crate::{model::AuthorizationStatus, retry::RetryError};

/// Result type alias for authorization operations.
pub type AuthorizationResult<T> = Result<T, AuthorizationError>;

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The same call may succeed if repeated.
    Retryable,
    /// Repeating the call cannot change the outcome.
    NonRetryable,
}

/// Errors returned by authorization operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum AuthorizationError {
    /// The input failed validation.
    #[error("Validation failed: {message}")]
    Validation {
        /// What was wrong with the input.
        message: String,
    },

    /// No authorization exists with this id.
    #[error("Authorization not found: {id}")]
    NotFound {
        /// The id or key that was looked up.
        id: String,
    },

    /// The caller may not perform this operation.
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// Reason reported by the collaborator.
        message: String,
    },

    /// The requested status change is not an edge of the lifecycle.
    #[error("Invalid transition from {current} to {attempted}")]
    InvalidTransition {
        /// Status the record was in.
        current: AuthorizationStatus,
        /// Status the caller asked for.
        attempted: AuthorizationStatus,
    },

    /// The record changed since it was read.
    #[error("Authorization was modified concurrently")]
    Conflict,

    /// A collaborator could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A collaborator did not answer in time.
    #[error("Operation timeout")]
    Timeout,

    /// A collaborator reported lock contention.
    #[error("Lock contention: {message}")]
    LockContention {
        /// Description of the contention.
        message: String,
    },

    /// A retryable failure persisted through every allowed attempt.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// Name of the retried operation.
        operation: String,
        /// Total attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<AuthorizationError>,
    },

    /// A batch call exceeded the configured maximum size. Nothing ran.
    #[error("Batch of {size} items exceeds the maximum of {max}")]
    BatchTooLarge {
        /// Number of items submitted.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A batch item was still pending when the batch deadline elapsed.
    #[error("Batch item {index} did not complete within {deadline:?}")]
    DeadlineExceeded {
        /// Position of the item in the input.
        index: usize,
        /// The batch deadline.
        deadline: Duration,
    },

    /// Any other collaborator failure.
    #[error(transparent)]
    Storage(StorageError),
}

impl AuthorizationError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a connection error without a source.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Classifies this error for retry decisions.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Connection { .. } | Self::Timeout | Self::LockContention { .. } => {
                ErrorClass::Retryable
            },
            Self::Storage(err) if err.is_transient() => ErrorClass::Retryable,
            _ => ErrorClass::NonRetryable,
        }
    }

    /// Returns `true` if [`class`](Self::class) is [`ErrorClass::Retryable`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }

    /// Number of attempts made, if this error records it.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::RetriesExhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The innermost error, looking through [`RetriesExhausted`](Self::RetriesExhausted).
    #[must_use]
    pub fn root_cause(&self) -> &AuthorizationError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<StorageError> for AuthorizationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { key } => Self::NotFound { id: key },
            StorageError::Conflict => Self::Conflict,
            StorageError::Connection { message, source } => Self::Connection { message, source },
            StorageError::Timeout => Self::Timeout,
            StorageError::LockContention { message } => Self::LockContention { message },
            StorageError::PermissionDenied { message } => Self::PermissionDenied { message },
            other => Self::Storage(other),
        }
    }
}

impl From<RetryError<AuthorizationError>> for AuthorizationError {
    fn from(err: RetryError<AuthorizationError>) -> Self {
        match err {
            RetryError::Aborted { source, .. } => source,
            RetryError::Exhausted { operation, attempts, source }
            | RetryError::Cancelled { operation, attempts, source } => {
                Self::RetriesExhausted { operation, attempts, source: Box::new(source) }
            },
        }
    }
}
