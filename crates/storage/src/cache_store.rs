//! Key-value cache store abstraction.
//!
//! [`CacheStore`] is the shared, externally synchronized store the cache
//! layer writes projections into. Implementations must make `get`, `set` and
//! `delete` individually atomic; callers never lock around them.
//!
//! [`MemoryCacheStore`] is an in-process implementation built on
//! [`moka`] with a per-entry time-to-live.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use moka::{Expiry, future::Cache};
use tracing::trace;

use crate::error::StorageResult;

/// Default maximum number of entries held by [`MemoryCacheStore`].
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

/// Byte-oriented key-value store with per-entry expiry.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](CacheStore::get) | Fetch a value, `None` on miss or expiry |
/// | [`set`](CacheStore::set) | Store a value with a TTL, overwriting unconditionally |
/// | [`delete`](CacheStore::delete) | Remove a key; absent keys are a no-op |
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Retrieves the value stored under `key`.
    ///
    /// Returns `Ok(None)` when the key is absent or its TTL elapsed.
    #[must_use = "cache operations may fail and errors must be handled"]
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>>;

    /// Stores `value` under `key` for at most `ttl`.
    ///
    /// Any existing entry is replaced, including its expiry.
    #[must_use = "cache operations may fail and errors must be handled"]
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()>;

    /// Removes `key`. Deleting an absent key succeeds.
    #[must_use = "cache operations may fail and errors must be handled"]
    async fn delete(&self, key: &str) -> StorageResult<()>;
}

/// A value together with the TTL it was written with.
#[derive(Clone)]
struct Entry {
    value: Bytes,
    ttl: Duration,
}

/// Expires each entry according to the TTL it was last written with.
struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Entry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// In-process [`CacheStore`] backed by a bounded [`moka`] cache.
///
/// # Cloning
///
/// `MemoryCacheStore` is cheaply cloneable; all clones share the same entries.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use bytes::Bytes;
/// use priorauth_storage::{CacheStore, MemoryCacheStore};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = MemoryCacheStore::with_capacity(100);
/// store.set("k", Bytes::from("v"), Duration::from_secs(5)).await.unwrap();
/// assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from("v")));
/// # });
/// ```
#[derive(Clone)]
pub struct MemoryCacheStore {
    cache: Cache<String, Entry>,
    max_entries: u64,
}

impl MemoryCacheStore {
    /// Creates a store holding at most [`DEFAULT_MAX_ENTRIES`] entries.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Creates a store holding at most `max_entries` entries.
    #[must_use]
    pub fn with_capacity(max_entries: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).expire_after(PerEntryTtl).build();
        Self { cache, max_entries }
    }

    /// Returns `(current_entries, max_entries)`.
    ///
    /// The entry count is approximate until pending maintenance has run.
    pub fn stats(&self) -> (u64, u64) {
        (self.cache.entry_count(), self.max_entries)
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.cache.invalidate_all();
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        let hit = self.cache.get(key).await.map(|entry| entry.value);
        trace!(key, hit = hit.is_some(), "cache store get");
        Ok(hit)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> StorageResult<()> {
        self.cache.insert(key.to_owned(), Entry { value, ttl }).await;
        trace!(key, ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX), "cache store set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.cache.invalidate(key).await;
        trace!(key, "cache store delete");
        Ok(())
    }
}
