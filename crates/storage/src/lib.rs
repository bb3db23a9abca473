//! Collaborator seams for prior-authorization services.
//!
//! This crate provides the abstractions the authorization reliability layer
//! consumes but does not own: a key-value [`CacheStore`], a [`Clock`], and an
//! observability [`EventSink`]. Each seam ships with an in-memory reference
//! implementation suitable for tests and single-process deployments.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 priorauth-authorization                     │
//! │   TransitionGuard │ AuthorizationCache │ RetryExecutor      │
//! │          BatchOrchestrator │ AuthorizationService           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   priorauth-storage                         │
//! │     CacheStore    │     Clock     │     EventSink           │
//! ├───────────────────┼───────────────┼─────────────────────────┤
//! │ MemoryCacheStore  │  SystemClock  │  Metrics / NoopSink     │
//! │  (moka, per-key   │  ManualClock  │                         │
//! │      TTL)         │               │                         │
//! └───────────────────┴───────────────┴─────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::time::Duration;
//!
//! use bytes::Bytes;
//! use priorauth_storage::{CacheStore, MemoryCacheStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemoryCacheStore::new();
//!
//!     store.set("authz:entity:7", Bytes::from_static(b"{}"), Duration::from_secs(60)).await?;
//!     assert!(store.get("authz:entity:7").await?.is_some());
//!
//!     store.delete("authz:entity:7").await?;
//!     assert!(store.get("authz:entity:7").await?.is_none());
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! All collaborator operations return [`StorageResult<T>`]. Implementations map
//! their internal failures onto [`StorageError`]; [`StorageError::is_transient`]
//! tells callers which failures are worth retrying.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with shared test helpers (recording sink,
//!   counting cache store). Enable this in `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]

pub mod cache_store;
pub mod clock;
pub mod error;
pub mod metrics;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;

pub use cache_store::{CacheStore, DEFAULT_MAX_ENTRIES, MemoryCacheStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BoxError, ConfigError, StorageError, StorageResult};
pub use metrics::{
    AttemptEvent, AttemptOutcome, BatchSummary, CacheOutcome, EventSink, LatencyPercentiles,
    Metrics, MetricsSnapshot, NoopSink,
};
