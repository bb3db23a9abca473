//! Retry executor with exponential backoff.
//!
//! [`RetryExecutor`] runs an async operation, classifies each failure through
//! a pluggable [`Classify`] implementation, and retries retryable failures
//! after `base_delay * backoff_factor^attempt`. Non-retryable failures are
//! returned on the attempt that produced them.
//!
//! Every attempt emits exactly one [`AttemptEvent`] to the configured
//! [`EventSink`].
//!
//! The executor is generic over the error type; nothing here depends on
//! authorization records.
//!
//! ```
//! use std::time::Duration;
//!
//! use priorauth_authorization::{RetryConfig, RetryExecutor, transient_storage};
//! use priorauth_storage::StorageError;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let executor =
//!     RetryExecutor::new(RetryConfig::builder().base_delay(Duration::from_millis(1)).build()?);
//! let mut calls = 0;
//! let value = executor
//!     .run("flaky", &transient_storage, || {
//!         calls += 1;
//!         let ok = calls > 1;
//!         async move { if ok { Ok(7) } else { Err(StorageError::timeout()) } }
//!     })
//!     .await?;
//! assert_eq!(value, 7);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use fail::fail_point;
use priorauth_storage::{AttemptEvent, AttemptOutcome, EventSink, NoopSink, StorageError};
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{config::RetryConfig, error::ErrorClass};

/// Decides whether an error is worth retrying.
///
/// Implemented for any `Fn(&E) -> ErrorClass`, so plain functions such as
/// [`AuthorizationError::class`](crate::AuthorizationError::class) work
/// directly.
pub trait Classify<E: ?Sized>: Send + Sync {
    /// Classifies `err`.
    fn classify(&self, err: &E) -> ErrorClass;
}

impl<E: ?Sized, F> Classify<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, err: &E) -> ErrorClass {
        self(err)
    }
}

/// Classifier for raw [`StorageError`]s based on [`StorageError::is_transient`].
#[must_use]
pub fn transient_storage(err: &StorageError) -> ErrorClass {
    if err.is_transient() { ErrorClass::Retryable } else { ErrorClass::NonRetryable }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The classifier marked the error non-retryable.
    #[error("{operation} failed: {source}")]
    Aborted {
        /// Name of the operation.
        operation: String,
        /// Attempts made, including the failing one.
        attempts: u32,
        /// The non-retryable error.
        #[source]
        source: E,
    },

    /// Every allowed attempt failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        /// Name of the operation.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        #[source]
        source: E,
    },

    /// The cancellation token fired before another attempt could start.
    #[error("{operation} cancelled after {attempts} attempts: {source}")]
    Cancelled {
        /// Name of the operation.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Error from the last completed attempt.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Aborted { attempts, .. }
            | Self::Exhausted { attempts, .. }
            | Self::Cancelled { attempts, .. } => *attempts,
        }
    }

    /// The error from the last attempt.
    #[must_use]
    pub fn last_error(&self) -> &E {
        match self {
            Self::Aborted { source, .. }
            | Self::Exhausted { source, .. }
            | Self::Cancelled { source, .. } => source,
        }
    }

    /// Consumes `self`, returning the error from the last attempt.
    #[must_use]
    pub fn into_last_error(self) -> E {
        match self {
            Self::Aborted { source, .. }
            | Self::Exhausted { source, .. }
            | Self::Cancelled { source, .. } => source,
        }
    }
}

/// Runs operations with classification-driven retries.
///
/// Cloning is cheap; clones share the event sink.
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates an executor that discards attempt events.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config, sink: Arc::new(NoopSink) }
    }

    /// Sends attempt events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The executor's configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay scheduled after the zero-based `attempt` fails.
    ///
    /// Equals `base_delay * backoff_factor^attempt`, capped at `max_backoff`,
    /// plus up to 50% jitter when enabled.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let cap = self.config.max_backoff();
        let capped = self
            .config
            .backoff_factor()
            .checked_pow(attempt)
            .and_then(|multiplier| self.config.base_delay().checked_mul(multiplier))
            .map_or(cap, |delay| delay.min(cap));

        if !self.config.jitter() {
            return capped;
        }
        let jitter_range = u64::try_from(capped.as_millis()).unwrap_or(u64::MAX) / 2;
        if jitter_range > 0 {
            let jitter = rand::rng().random_range(0..=jitter_range);
            capped.saturating_add(Duration::from_millis(jitter))
        } else {
            capped
        }
    }

    /// Runs `op` until it succeeds, fails non-retryably, or exhausts retries.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::Aborted`] or [`RetryError::Exhausted`].
    pub async fn run<T, E, C, F, Fut>(
        &self,
        operation: &str,
        classifier: &C,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        C: Classify<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(operation, classifier, None, op).await
    }

    /// Like [`run`](Self::run), but stops before starting a new attempt once
    /// `cancel` fires. An attempt already in flight is never interrupted.
    ///
    /// # Errors
    ///
    /// Additionally returns [`RetryError::Cancelled`].
    pub async fn run_cancellable<T, E, C, F, Fut>(
        &self,
        operation: &str,
        classifier: &C,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, RetryError<E>>
    where
        C: Classify<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(operation, classifier, Some(cancel), op).await
    }

    /// Binds an operation and classifier into a reusable retrying callable.
    pub fn wrap<C, F>(&self, operation: impl Into<String>, classifier: C, op: F) -> Retrying<C, F> {
        Retrying { executor: self.clone(), operation: operation.into(), classifier, op }
    }

    #[tracing::instrument(
        name = "retry",
        skip_all,
        fields(operation = operation, max_retries = self.config.max_retries())
    )]
    pub(crate) async fn execute<T, E, C, F, Fut>(
        &self,
        operation: &str,
        classifier: &C,
        cancel: Option<&CancellationToken>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        C: Classify<E> + ?Sized,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_retries = self.config.max_retries();
        let mut attempt: u32 = 0;

        loop {
            let started = Instant::now();
            let result = op().await;
            let elapsed = started.elapsed();

            let err = match result {
                Ok(value) => {
                    self.emit(operation, attempt, AttemptOutcome::Success, elapsed, None);
                    if attempt > 0 {
                        tracing::debug!(
                            operation,
                            attempt = attempt + 1,
                            "operation succeeded after retry",
                        );
                    }
                    return Ok(value);
                },
                Err(err) => err,
            };
            let attempts = attempt + 1;

            if classifier.classify(&err) == ErrorClass::NonRetryable {
                self.emit(operation, attempt, AttemptOutcome::NonRetryableFailure, elapsed, None);
                return Err(RetryError::Aborted {
                    operation: operation.to_owned(),
                    attempts,
                    source: err,
                });
            }

            if attempt >= max_retries {
                self.emit(operation, attempt, AttemptOutcome::Exhausted, elapsed, None);
                tracing::warn!(operation, attempts, error = %err, "retries exhausted");
                return Err(RetryError::Exhausted {
                    operation: operation.to_owned(),
                    attempts,
                    source: err,
                });
            }

            if cancel.is_some_and(CancellationToken::is_cancelled) {
                self.emit(operation, attempt, AttemptOutcome::Cancelled, elapsed, None);
                return Err(RetryError::Cancelled {
                    operation: operation.to_owned(),
                    attempts,
                    source: err,
                });
            }

            let delay = self.backoff_for(attempt);
            self.emit(operation, attempt, AttemptOutcome::RetryableFailure, elapsed, Some(delay));
            tracing::debug!(
                operation,
                attempt = attempts,
                max_attempts = max_retries + 1,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "retryable error, retrying after backoff",
            );

            fail_point!("retry-before-sleep");
            match cancel {
                Some(token) => {
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {},
                        () = token.cancelled() => {
                            tracing::debug!(operation, attempts, "cancelled during backoff");
                            return Err(RetryError::Cancelled {
                                operation: operation.to_owned(),
                                attempts,
                                source: err,
                            });
                        },
                    }
                },
                None => tokio::time::sleep(delay).await,
            }

            attempt += 1;
        }
    }

    fn emit(
        &self,
        operation: &str,
        attempt: u32,
        outcome: AttemptOutcome,
        elapsed: Duration,
        backoff: Option<Duration>,
    ) {
        self.sink.record_attempt(&AttemptEvent {
            operation: operation.to_owned(),
            attempt,
            outcome,
            elapsed,
            backoff,
        });
    }
}

/// An operation bound to a [`RetryExecutor`] and classifier.
///
/// Created by [`RetryExecutor::wrap`]. Each [`call`](Self::call) is an
/// independent retried execution.
pub struct Retrying<C, F> {
    executor: RetryExecutor,
    operation: String,
    classifier: C,
    op: F,
}

impl<C, F> Retrying<C, F> {
    /// Runs the bound operation with retries.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::run`].
    pub async fn call<T, E, Fut>(&self) -> Result<T, RetryError<E>>
    where
        C: Classify<E>,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.executor.run(&self.operation, &self.classifier, || (self.op)()).await
    }
}
