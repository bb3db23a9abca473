//! Shared test utilities for collaborator seams.
//!
//! Feature-gated behind `testutil` so nothing here leaks into production
//! builds.
//!
//! ```toml
//! [dev-dependencies]
//! priorauth-storage = { path = "../storage", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
    cache_store::CacheStore,
    error::{StorageError, StorageResult},
    metrics::{AttemptEvent, BatchSummary, CacheOutcome, EventSink},
};

/// [`EventSink`] that keeps every event it receives, in arrival order.
#[derive(Clone, Default)]
pub struct RecordingSink {
    attempts: Arc<Mutex<Vec<AttemptEvent>>>,
    cache: Arc<Mutex<Vec<(&'static str, CacheOutcome)>>>,
    batches: Arc<Mutex<Vec<BatchSummary>>>,
    events: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt events recorded so far.
    #[must_use]
    pub fn attempts(&self) -> Vec<AttemptEvent> {
        self.attempts.lock().clone()
    }

    /// Attempt events for one operation name.
    #[must_use]
    pub fn attempts_for(&self, operation: &str) -> Vec<AttemptEvent> {
        self.attempts.lock().iter().filter(|e| e.operation == operation).cloned().collect()
    }

    /// Cache events recorded so far as `(namespace, outcome)` pairs.
    #[must_use]
    pub fn cache_events(&self) -> Vec<(&'static str, CacheOutcome)> {
        self.cache.lock().clone()
    }

    /// Number of cache events with the given outcome in `namespace`.
    #[must_use]
    pub fn cache_count(&self, namespace: &str, outcome: CacheOutcome) -> usize {
        self.cache.lock().iter().filter(|(ns, o)| *ns == namespace && *o == outcome).count()
    }

    /// Batch summaries recorded so far.
    #[must_use]
    pub fn batches(&self) -> Vec<BatchSummary> {
        self.batches.lock().clone()
    }

    /// Named events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().clone()
    }
}

impl EventSink for RecordingSink {
    fn record_attempt(&self, event: &AttemptEvent) {
        self.attempts.lock().push(event.clone());
    }

    fn record_cache(&self, namespace: &'static str, outcome: CacheOutcome) {
        self.cache.lock().push((namespace, outcome));
    }

    fn record_batch(&self, summary: &BatchSummary) {
        self.batches.lock().push(summary.clone());
    }

    fn record_event(&self, name: &'static str) {
        self.events.lock().push(name);
    }
}

/// Wraps a [`CacheStore`] and counts calls per operation.
///
/// Setting a failure with [`fail_with`](Self::fail_with) makes every
/// subsequent call return that error until [`heal`](Self::heal) is called.
#[derive(Clone)]
pub struct CountingCacheStore<S> {
    inner: S,
    gets: Arc<AtomicUsize>,
    sets: Arc<AtomicUsize>,
    deletes: Arc<AtomicUsize>,
    set_keys: Arc<Mutex<Vec<String>>>,
    fail_with: Arc<Mutex<Option<StorageError>>>,
}

impl<S: CacheStore> CountingCacheStore<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            gets: Arc::new(AtomicUsize::new(0)),
            sets: Arc::new(AtomicUsize::new(0)),
            deletes: Arc::new(AtomicUsize::new(0)),
            set_keys: Arc::new(Mutex::new(Vec::new())),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    /// Number of `get` calls.
    #[must_use]
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    /// Number of `set` calls.
    #[must_use]
    pub fn sets(&self) -> usize {
        self.sets.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls.
    #[must_use]
    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Keys passed to `set`, in call order.
    #[must_use]
    pub fn set_keys(&self) -> Vec<String> {
        self.set_keys.lock().clone()
    }

    /// Makes every following call fail with `err`.
    pub fn fail_with(&self, err: StorageError) {
        *self.fail_with.lock() = Some(err);
    }

    /// Stops injecting failures.
    pub fn heal(&self) {
        *self.fail_with.lock() = None;
    }

    fn injected(&self) -> StorageResult<()> {
        match self.fail_with.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<S: CacheStore> CacheStore for CountingCacheStore<S> {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.set_keys.lock().push(key.to_owned());
        self.injected()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.injected()?;
        self.inner.delete(key).await
    }
}
