//! Cache layer for authorization reads.
//!
//! Two namespaces share one [`CacheStore`]:
//!
//! - `authz:entity:{id}` holds single records for the entity TTL.
//! - `authz:check:{policy}:{generation}:{digest}` holds coverage-check results
//!   for the check TTL. `digest` covers every criterion, so distinct queries
//!   never share an entry.
//!
//! Check results are invalidated per policy by rotating the generation stored
//! at `authz:check:{policy}:gen`; older entries become unreachable and age out
//! on their own.
//!
//! Entries are wrapped with an expiry computed from the injected [`Clock`]. A
//! read whose expiry has passed is reported as stale and treated as a miss,
//! independent of the store's own eviction.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use priorauth_storage::{
    CacheOutcome, CacheStore, Clock, EventSink, NoopSink, StorageError, StorageResult,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    config::CacheConfig,
    model::{Authorization, AuthorizationId, CheckResult, PolicyId},
};

/// Namespace label for single-record entries.
pub const ENTITY_NAMESPACE: &str = "entity";

/// Namespace label for coverage-check entries.
pub const CHECK_NAMESPACE: &str = "check";

const KEY_PREFIX: &str = "authz";

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    expires_at: DateTime<Utc>,
    value: T,
}

/// Generation of a policy's check entries at the time it was read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckGeneration(String);

impl CheckGeneration {
    fn initial() -> Self {
        Self("0".to_owned())
    }
}

/// Result of [`AuthorizationCache::get_check`].
#[derive(Debug, Clone)]
pub struct CheckLookup {
    /// Fresh cached result, if any.
    pub hit: Option<CheckResult>,
    /// Generation the lookup read.
    pub generation: CheckGeneration,
}

/// Cache-aside projection of authorization records and check results.
#[derive(Clone)]
pub struct AuthorizationCache {
    store: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    config: CacheConfig,
}

impl fmt::Debug for AuthorizationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCache")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AuthorizationCache {
    /// Creates a cache layer over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        Self { store, clock, sink: Arc::new(NoopSink), config }
    }

    /// Sends hit, miss and invalidation events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Key of the entity entry for `id`.
    #[must_use]
    pub fn entity_key(id: AuthorizationId) -> String {
        format!("{KEY_PREFIX}:{ENTITY_NAMESPACE}:{id}")
    }

    fn generation_key(policy_id: PolicyId) -> String {
        format!("{KEY_PREFIX}:{CHECK_NAMESPACE}:{policy_id}:gen")
    }

    fn check_key(policy_id: PolicyId, generation: &str, digest: &str) -> String {
        format!("{KEY_PREFIX}:{CHECK_NAMESPACE}:{policy_id}:{generation}:{digest}")
    }

    /// Fetches a fresh cached record.
    ///
    /// # Errors
    ///
    /// Returns the store's error if it cannot be reached.
    pub async fn get(&self, id: AuthorizationId) -> StorageResult<Option<Authorization>> {
        if !self.config.enabled() {
            return Ok(None);
        }
        self.read(ENTITY_NAMESPACE, &Self::entity_key(id)).await
    }

    /// Stores `value` under `id` for `ttl`, replacing any existing entry.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the write fails.
    pub async fn put(
        &self,
        id: AuthorizationId,
        value: &Authorization,
        ttl: Duration,
    ) -> StorageResult<()> {
        if !self.config.enabled() {
            return Ok(());
        }
        self.write(ENTITY_NAMESPACE, &Self::entity_key(id), value, ttl).await
    }

    /// Removes the entry for `id`. Absent entries are not an error.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the delete fails.
    pub async fn invalidate(&self, id: AuthorizationId) -> StorageResult<()> {
        if !self.config.enabled() {
            return Ok(());
        }
        self.store.delete(&Self::entity_key(id)).await?;
        self.sink.record_cache(ENTITY_NAMESPACE, CacheOutcome::Invalidate);
        tracing::trace!(%id, "entity entry invalidated");
        Ok(())
    }

    /// Fetches a fresh cached check result for `digest` under `policy_id`.
    ///
    /// The returned [`CheckLookup::generation`] is the one the lookup ran
    /// against. A result computed after this call must be stored with it, so
    /// a write committed in between leaves the result unreachable.
    ///
    /// # Errors
    ///
    /// Returns the store's error if it cannot be reached.
    pub async fn get_check(&self, policy_id: PolicyId, digest: &str) -> StorageResult<CheckLookup> {
        if !self.config.enabled() {
            return Ok(CheckLookup { hit: None, generation: CheckGeneration::initial() });
        }
        let generation = self.generation(policy_id).await?;
        let hit =
            self.read(CHECK_NAMESPACE, &Self::check_key(policy_id, &generation.0, digest)).await?;
        Ok(CheckLookup { hit, generation })
    }

    /// Stores a check result under `generation`.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the write fails.
    pub async fn put_check(
        &self,
        policy_id: PolicyId,
        generation: &CheckGeneration,
        digest: &str,
        value: &CheckResult,
        ttl: Duration,
    ) -> StorageResult<()> {
        if !self.config.enabled() {
            return Ok(());
        }
        self.write(CHECK_NAMESPACE, &Self::check_key(policy_id, &generation.0, digest), value, ttl)
            .await
    }

    /// Makes every cached check result for `policy_id` unreachable.
    ///
    /// # Errors
    ///
    /// Returns the store's error if the generation cannot be rotated.
    pub async fn invalidate_checks(&self, policy_id: PolicyId) -> StorageResult<()> {
        if !self.config.enabled() {
            return Ok(());
        }
        let generation = rand::random::<u64>().to_string();
        self.store
            .set(&Self::generation_key(policy_id), Bytes::from(generation), self.config.check_ttl())
            .await?;
        self.sink.record_cache(CHECK_NAMESPACE, CacheOutcome::Invalidate);
        tracing::trace!(%policy_id, "check entries invalidated");
        Ok(())
    }

    async fn generation(&self, policy_id: PolicyId) -> StorageResult<CheckGeneration> {
        let raw = self.store.get(&Self::generation_key(policy_id)).await?;
        Ok(raw.map_or_else(CheckGeneration::initial, |b| {
            CheckGeneration(String::from_utf8_lossy(&b).into_owned())
        }))
    }

    async fn read<T: DeserializeOwned>(
        &self,
        namespace: &'static str,
        key: &str,
    ) -> StorageResult<Option<T>> {
        let Some(raw) = self.store.get(key).await? else {
            self.sink.record_cache(namespace, CacheOutcome::Miss);
            return Ok(None);
        };

        let envelope: Envelope<T> = match serde_json::from_slice(&raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(key, error = %err, "discarding undecodable cache entry");
                self.store.delete(key).await?;
                self.sink.record_cache(namespace, CacheOutcome::Miss);
                return Ok(None);
            },
        };

        if self.clock.now() >= envelope.expires_at {
            tracing::trace!(key, "stale cache entry");
            self.store.delete(key).await?;
            self.sink.record_cache(namespace, CacheOutcome::Stale);
            return Ok(None);
        }

        tracing::trace!(key, "cache hit");
        self.sink.record_cache(namespace, CacheOutcome::Hit);
        Ok(Some(envelope.value))
    }

    async fn write<T: Serialize>(
        &self,
        namespace: &'static str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> StorageResult<()> {
        let lifetime = TimeDelta::from_std(ttl)
            .map_err(|e| StorageError::internal(format!("cache ttl out of range: {e}")))?;
        let expires_at =
            self.clock.now().checked_add_signed(lifetime).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let bytes = serde_json::to_vec(&Envelope { expires_at, value })?;
        self.store.set(key, Bytes::from(bytes), ttl).await?;
        self.sink.record_cache(namespace, CacheOutcome::Put);
        Ok(())
    }
}
