//! Persistence trait for authorization records.
//!
//! [`AuthorizationRepository`] is the system of record. Writes use optimistic
//! concurrency: a save succeeds only when the stored version equals the
//! version the caller read, and the committed record carries the next
//! version.
//!
//! # Idempotent replays
//!
//! A retried save whose first attempt committed but whose response was lost
//! is recognized by content: if the stored record is exactly the saved record
//! at the next version, the save returns the stored record instead of
//! [`StorageError::Conflict`].

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use parking_lot::RwLock;
use priorauth_storage::{StorageError, StorageResult};

use crate::model::{Authorization, AuthorizationId, PolicyId};

/// System of record for [`Authorization`]s.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`allocate_id`](Self::allocate_id) | Reserve a fresh identifier |
/// | [`load`](Self::load) | Fetch one record |
/// | [`save`](Self::save) | Compare-and-set write |
/// | [`find_by_policy`](Self::find_by_policy) | All records of a policy |
#[async_trait]
pub trait AuthorizationRepository: Send + Sync {
    /// Reserves a new, never reused identifier.
    async fn allocate_id(&self) -> StorageResult<AuthorizationId>;

    /// Loads the record with `id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no record exists.
    async fn load(&self, id: AuthorizationId) -> StorageResult<Authorization>;

    /// Writes `record` if its version matches the stored one (zero for a new
    /// record). Returns the committed record at the next version.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] on a version mismatch that is not an
    /// identical replay.
    async fn save(&self, record: &Authorization) -> StorageResult<Authorization>;

    /// Every record belonging to `policy_id`, in id order.
    async fn find_by_policy(&self, policy_id: PolicyId) -> StorageResult<Vec<Authorization>>;
}

/// In-memory [`AuthorizationRepository`] for tests and embedding.
///
/// Clones share the same records.
#[derive(Debug, Clone)]
pub struct MemoryAuthorizationRepository {
    records: Arc<RwLock<BTreeMap<AuthorizationId, Authorization>>>,
    next_id: Arc<AtomicI64>,
}

impl MemoryAuthorizationRepository {
    /// Creates an empty repository whose first id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
        }
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Default for MemoryAuthorizationRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthorizationRepository for MemoryAuthorizationRepository {
    async fn allocate_id(&self) -> StorageResult<AuthorizationId> {
        Ok(AuthorizationId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    #[tracing::instrument(skip(self))]
    async fn load(&self, id: AuthorizationId) -> StorageResult<Authorization> {
        self.records.read().get(&id).cloned().ok_or_else(|| StorageError::not_found(id.to_string()))
    }

    #[tracing::instrument(
        skip(self, record),
        fields(id = %record.id(), version = record.version())
    )]
    async fn save(&self, record: &Authorization) -> StorageResult<Authorization> {
        let mut records = self.records.write();
        let next_version = record.version() + 1;

        match records.get(&record.id()) {
            None if record.version() == 0 => {},
            Some(stored) if stored.version() == record.version() => {},
            Some(stored)
                if stored.version() == next_version
                    && *stored == record.clone().with_version(next_version) =>
            {
                tracing::debug!("identical save replayed");
                return Ok(stored.clone());
            },
            _ => return Err(StorageError::conflict()),
        }

        let committed = record.clone().with_version(next_version);
        records.insert(committed.id(), committed.clone());
        Ok(committed)
    }

    #[tracing::instrument(skip(self))]
    async fn find_by_policy(&self, policy_id: PolicyId) -> StorageResult<Vec<Authorization>> {
        Ok(self.records.read().values().filter(|r| r.policy_id() == policy_id).cloned().collect())
    }
}
