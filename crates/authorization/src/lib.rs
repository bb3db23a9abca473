//! Reliability layer for prior-authorization records.
//!
//! This crate owns the authorization lifecycle and everything that keeps it
//! consistent under load and partial failure:
//!
//! - [`transition`] validates every status change against a fixed lifecycle.
//! - [`AuthorizationCache`] serves reads from a TTL-bounded cache-aside
//!   projection and is invalidated after every committed write.
//! - [`RetryExecutor`] retries transient collaborator failures with
//!   exponential backoff.
//! - [`BatchOrchestrator`] runs many independent operations with bounded
//!   parallelism under a deadline.
//! - [`AuthorizationService`] composes them behind one façade.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    AuthorizationService                      │
//! ├───────────────┬──────────────────┬───────────────────────────┤
//! │ transition    │ cache            │ BatchOrchestrator         │
//! │ validation    │                  │                           │
//! ├───────────────┴──────────┬───────┴───────────────────────────┤
//! │        RetryExecutor     │  AuthorizationRepository          │
//! ├──────────────────────────┴───────────────────────────────────┤
//! │         priorauth-storage: CacheStore │ Clock │ EventSink    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! DRAFT ─► SUBMITTED ─┬─► IN_REVIEW ◄──► PENDING_INFO
//!                     │       │               │
//!                     │       ├─► DENIED ◄────┘
//!                     │       └─► APPROVED ─┬─► EXPIRED
//!                     └─► REJECTED          └─► REVOKED
//! ```
//!
//! See [`transition`] for the full edge table.
//!
//! # Error Handling
//!
//! Every public operation returns [`AuthorizationResult<T>`]. Failures that
//! outlast the retry policy surface as
//! [`AuthorizationError::RetriesExhausted`] carrying the attempt count and
//! the last underlying error.
//!
//! # Feature Flags
//!
//! - **`failpoints`**: Enables the `fail` crate's injection points
//!   (`retry-before-sleep`, `batch-worker-before-item`,
//!   `authorization-before-save`) for fault-injection tests.

#![deny(unsafe_code)]

pub mod batch;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod repository;
pub mod retry;
pub mod service;
pub mod transition;
pub mod validation;

pub use batch::{BatchOrchestrator, BatchResult};
pub use cache::{AuthorizationCache, CheckGeneration, CheckLookup};
pub use config::{BatchConfig, CacheConfig, RetryConfig, ServiceConfig};
pub use error::{AuthorizationError, AuthorizationResult, ErrorClass};
pub use model::{
    Authorization, AuthorizationId, AuthorizationRequest, AuthorizationStatus, CheckCriteria,
    CheckResult, NormalizedCriteria, ParseEnumError, PolicyId, ServiceType,
};
pub use repository::{AuthorizationRepository, MemoryAuthorizationRepository};
pub use retry::{Classify, RetryError, RetryExecutor, Retrying, transient_storage};
pub use service::AuthorizationService;
pub use transition::{allowed_transitions, apply_transition, can_transition};
pub use validation::validate_request;
