//! Authorization service façade.
//!
//! [`AuthorizationService`] is the public entry point. Every collaborator call
//! goes through the retry executor; every committed write is followed by
//! cache invalidation for the record and its policy's check results.
//!
//! # Read path
//!
//! ```text
//! get_authorization(id)
//!     │
//!     ├─► cache hit (fresh) ──────────────────────────► return
//!     │
//!     └─► miss / stale ─► load (retried) ─► cache put ─► return
//! ```
//!
//! # Write path
//!
//! ```text
//! validate ─► read current ─► transition guard ─► save (retried, CAS)
//!                                                      │
//!                          return ◄─ invalidate entity + policy checks
//! ```
//!
//! Updates read the current status cache-aside. If the save conflicts, or the
//! guard rejects a status that came from cache, the update is repeated once
//! against persistence.
//!
//! Cache read and populate failures are logged and bypassed; they never fail
//! a read. Invalidation failures after a commit are retried and, if they
//! persist, returned to the caller.

use std::{future::Future, sync::Arc};

use chrono::NaiveDate;
use fail::fail_point;
use priorauth_storage::{CacheStore, Clock, EventSink, NoopSink, SystemClock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    batch::{BatchOrchestrator, BatchResult},
    cache::{AuthorizationCache, CheckLookup},
    config::ServiceConfig,
    error::{AuthorizationError, AuthorizationResult},
    model::{
        Authorization, AuthorizationId, AuthorizationRequest, AuthorizationStatus, CheckCriteria,
        CheckResult, PolicyId,
    },
    repository::AuthorizationRepository,
    retry::RetryExecutor,
    transition::apply_transition,
    validation::validate_request,
};

fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopSink)
}

struct Inner {
    repository: Arc<dyn AuthorizationRepository>,
    cache: AuthorizationCache,
    retry: RetryExecutor,
    batch: BatchOrchestrator,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    config: ServiceConfig,
}

/// Public façade over the authorization subsystem.
///
/// Cloning is cheap; clones share collaborators.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use chrono::NaiveDate;
/// use priorauth_authorization::{
///     AuthorizationRequest, AuthorizationService, AuthorizationStatus,
///     MemoryAuthorizationRepository, PolicyId, ServiceType,
/// };
/// use priorauth_storage::MemoryCacheStore;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let service = AuthorizationService::builder()
///     .repository(Arc::new(MemoryAuthorizationRepository::new()))
///     .cache_store(Arc::new(MemoryCacheStore::new()))
///     .build();
///
/// let request = AuthorizationRequest::builder()
///     .policy_id(PolicyId(1))
///     .service_type(ServiceType::Surgery)
///     .start_date(NaiveDate::from_ymd_opt(2024, 9, 1).unwrap())
///     .end_date(NaiveDate::from_ymd_opt(2024, 9, 30).unwrap())
///     .diagnosis_codes(["M17.11"])
///     .procedure_codes(["27447"])
///     .build();
///
/// let created = service.request_authorization(request).await?;
/// assert_eq!(created.status(), AuthorizationStatus::Submitted);
///
/// let reviewed = service
///     .update_authorization_status(created.id(), AuthorizationStatus::InReview)
///     .await?;
/// assert_eq!(service.get_authorization(created.id()).await?, reviewed);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct AuthorizationService {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AuthorizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationService")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl AuthorizationService {
    /// Wires the service to its collaborators.
    ///
    /// `clock` defaults to the system clock, `sink` discards events, and
    /// `config` uses [`ServiceConfig::default`].
    #[builder]
    pub fn new(
        repository: Arc<dyn AuthorizationRepository>,
        cache_store: Arc<dyn CacheStore>,
        #[builder(default = system_clock())] clock: Arc<dyn Clock>,
        #[builder(default = noop_sink())] sink: Arc<dyn EventSink>,
        #[builder(default)] config: ServiceConfig,
    ) -> Self {
        let retry = RetryExecutor::new(config.retry.clone()).with_sink(Arc::clone(&sink));
        let cache = AuthorizationCache::new(cache_store, Arc::clone(&clock), config.cache.clone())
            .with_sink(Arc::clone(&sink));
        let batch =
            BatchOrchestrator::new(config.batch.clone(), retry.clone()).with_sink(Arc::clone(&sink));

        Self { inner: Arc::new(Inner { repository, cache, retry, batch, clock, sink, config }) }
    }
}

impl AuthorizationService {
    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// The cache layer, for inspection and manual invalidation.
    #[must_use]
    pub fn cache(&self) -> &AuthorizationCache {
        &self.inner.cache
    }

    /// Validates `request`, creates a record and submits it.
    ///
    /// The returned record is in [`AuthorizationStatus::Submitted`].
    ///
    /// # Errors
    ///
    /// - [`AuthorizationError::Validation`] if the request is malformed.
    /// - [`AuthorizationError::RetriesExhausted`] if persistence stays
    ///   unavailable.
    #[tracing::instrument(
        skip(self, request),
        fields(policy_id = %request.policy_id, service_type = %request.service_type)
    )]
    pub async fn request_authorization(
        &self,
        request: AuthorizationRequest,
    ) -> AuthorizationResult<Authorization> {
        validate_request(&request)?;
        self.create(request, None).await
    }

    /// Moves authorization `id` to `new_status`.
    ///
    /// # Errors
    ///
    /// - [`AuthorizationError::NotFound`] if `id` does not exist.
    /// - [`AuthorizationError::InvalidTransition`] for an illegal edge.
    /// - [`AuthorizationError::Conflict`] if the record keeps changing
    ///   underneath the update.
    #[tracing::instrument(skip(self), fields(id = %id, status = %new_status))]
    pub async fn update_authorization_status(
        &self,
        id: AuthorizationId,
        new_status: AuthorizationStatus,
    ) -> AuthorizationResult<Authorization> {
        self.update(id, new_status, None).await
    }

    /// Returns authorization `id`, served from cache when fresh.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::NotFound`] if `id` does not exist.
    #[tracing::instrument(skip(self), fields(id = %id))]
    pub async fn get_authorization(&self, id: AuthorizationId) -> AuthorizationResult<Authorization> {
        self.load(id, None).await
    }

    /// Evaluates whether `policy_id` has active approvals matching `criteria`.
    ///
    /// Results are cached per policy and full criteria for the check TTL.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::RetriesExhausted`] if persistence stays
    /// unavailable.
    #[tracing::instrument(skip(self, criteria), fields(policy_id = %policy_id))]
    pub async fn check_authorization(
        &self,
        policy_id: PolicyId,
        criteria: &CheckCriteria,
    ) -> AuthorizationResult<CheckResult> {
        let cache = &self.inner.cache;
        let normalized = criteria.normalized(self.inner.clock.now().date_naive());
        let digest = normalized.digest(policy_id);

        let generation = match cache.get_check(policy_id, &digest).await {
            Ok(CheckLookup { hit: Some(hit), .. }) => return Ok(hit),
            Ok(CheckLookup { hit: None, generation }) => Some(generation),
            Err(err) => {
                warn!(error = %err, "check cache read failed, evaluating directly");
                None
            },
        };

        let records = self.find_by_policy(policy_id, None).await?;
        let result = CheckResult::evaluate(policy_id, &normalized, &records);
        self.inner.sink.record_event("authorization.checked");

        if let Some(generation) = generation {
            let ttl = self.inner.config.cache.check_ttl();
            if let Err(err) = cache.put_check(policy_id, &generation, &digest, &result, ttl).await {
                warn!(error = %err, "check cache write failed");
            }
        }
        debug!(authorized = result.authorized, matched = result.authorizations.len(), "checked");
        Ok(result)
    }

    /// Submits many requests with bounded parallelism.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::BatchTooLarge`] if `requests` exceeds the batch
    /// maximum; nothing is created in that case. Per-item failures are in the
    /// returned [`BatchResult`].
    #[tracing::instrument(skip_all, fields(size = requests.len()))]
    pub async fn request_authorizations_batch(
        &self,
        requests: Vec<AuthorizationRequest>,
    ) -> AuthorizationResult<BatchResult<Authorization>> {
        let service = self.clone();
        self.inner
            .batch
            .execute("request_authorization", requests, move |request, cancel| {
                let service = service.clone();
                async move {
                    validate_request(&request)?;
                    service.create(request, Some(&cancel)).await
                }
            })
            .await
    }

    /// Applies many status changes with bounded parallelism.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::BatchTooLarge`] if `updates` exceeds the batch
    /// maximum.
    #[tracing::instrument(skip_all, fields(size = updates.len()))]
    pub async fn update_authorization_statuses_batch(
        &self,
        updates: Vec<(AuthorizationId, AuthorizationStatus)>,
    ) -> AuthorizationResult<BatchResult<Authorization>> {
        let service = self.clone();
        self.inner
            .batch
            .execute("update_authorization_status", updates, move |(id, status), cancel| {
                let service = service.clone();
                async move { service.update(id, status, Some(&cancel)).await }
            })
            .await
    }

    /// Moves every approved authorization of `policy_id` whose window ended
    /// before `as_of` to [`AuthorizationStatus::Expired`].
    ///
    /// Large sweeps are split into consecutive batches.
    ///
    /// # Errors
    ///
    /// [`AuthorizationError::RetriesExhausted`] if the policy's records
    /// cannot be listed.
    #[tracing::instrument(skip(self), fields(policy_id = %policy_id, as_of = %as_of))]
    pub async fn expire_lapsed_authorizations(
        &self,
        policy_id: PolicyId,
        as_of: NaiveDate,
    ) -> AuthorizationResult<BatchResult<Authorization>> {
        let lapsed: Vec<_> = self
            .find_by_policy(policy_id, None)
            .await?
            .into_iter()
            .filter(|r| r.status() == AuthorizationStatus::Approved && r.end_date() < as_of)
            .map(|r| (r.id(), AuthorizationStatus::Expired))
            .collect();

        let mut result = BatchResult::default();
        for chunk in lapsed.chunks(self.inner.config.batch.max_batch_size().max(1)) {
            result.extend(self.update_authorization_statuses_batch(chunk.to_vec()).await?);
        }
        info!(expired = result.success_count(), failed = result.failure_count(), "expiry sweep");
        Ok(result)
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: Option<&CancellationToken>,
        op: F,
    ) -> AuthorizationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AuthorizationResult<T>>,
    {
        self.inner
            .retry
            .execute(operation, &AuthorizationError::class, cancel, op)
            .await
            .map_err(AuthorizationError::from)
    }

    async fn create(
        &self,
        request: AuthorizationRequest,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        let repository = &self.inner.repository;
        let id = self
            .with_retry("allocate_authorization_id", cancel, || async move {
                repository.allocate_id().await.map_err(AuthorizationError::from)
            })
            .await?;

        let now = self.inner.clock.now();
        let mut record = Authorization::draft(id, request, now);
        apply_transition(&mut record, AuthorizationStatus::Submitted, now)?;

        let saved = self.commit(&record, cancel).await?;
        self.inner.sink.record_event("authorization.created");
        info!(
            id = %saved.id(),
            number = saved.authorization_number(),
            policy_id = %saved.policy_id(),
            "authorization submitted",
        );
        Ok(saved)
    }

    async fn update(
        &self,
        id: AuthorizationId,
        new_status: AuthorizationStatus,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        let (current, cached) = self.read(id, cancel).await?;
        match self.transition_and_commit(current, new_status, cancel).await {
            Err(AuthorizationError::Conflict) => self.reconcile(id, new_status, cancel).await,
            Err(AuthorizationError::InvalidTransition { .. }) if cached => {
                self.reconcile(id, new_status, cancel).await
            },
            other => other,
        }
    }

    /// Drops the cached copy and repeats the transition once against
    /// persistence.
    async fn reconcile(
        &self,
        id: AuthorizationId,
        new_status: AuthorizationStatus,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        debug!(%id, "stale read, retrying against persistence");
        if let Err(err) = self.inner.cache.invalidate(id).await {
            warn!(%id, error = %err, "cache invalidation failed");
        }
        let fresh = self.load_fresh(id, cancel).await?;
        self.transition_and_commit(fresh, new_status, cancel).await
    }

    async fn transition_and_commit(
        &self,
        mut record: Authorization,
        next: AuthorizationStatus,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        let previous = record.status();
        apply_transition(&mut record, next, self.inner.clock.now())?;

        let saved = self.commit(&record, cancel).await?;
        self.inner.sink.record_event("authorization.status_changed");
        info!(id = %saved.id(), from = %previous, to = %next, "authorization status changed");
        Ok(saved)
    }

    /// Saves `record` and then invalidates every cache entry it can affect.
    async fn commit(
        &self,
        record: &Authorization,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        let repository = &self.inner.repository;
        let saved = self
            .with_retry("save_authorization", cancel, || async move {
                fail_point!("authorization-before-save", |_| {
                    Err(AuthorizationError::connection("injected save failure"))
                });
                repository.save(record).await.map_err(AuthorizationError::from)
            })
            .await?;

        let cache = &self.inner.cache;
        let (id, policy_id) = (saved.id(), saved.policy_id());
        self.with_retry("invalidate_cache", cancel, || async move {
            cache.invalidate(id).await?;
            cache.invalidate_checks(policy_id).await?;
            Ok::<_, AuthorizationError>(())
        })
        .await?;

        Ok(saved)
    }

    async fn load(
        &self,
        id: AuthorizationId,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        self.read(id, cancel).await.map(|(record, _)| record)
    }

    /// Cache-aside read. The flag is `true` when the record came from cache.
    async fn read(
        &self,
        id: AuthorizationId,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<(Authorization, bool)> {
        let cache = &self.inner.cache;
        match cache.get(id).await {
            Ok(Some(hit)) => return Ok((hit, true)),
            Ok(None) => {},
            Err(err) => warn!(%id, error = %err, "cache read failed, loading from persistence"),
        }

        let record = self.load_fresh(id, cancel).await?;
        if let Err(err) = cache.put(id, &record, self.inner.config.cache.entity_ttl()).await {
            warn!(%id, error = %err, "cache populate failed");
        }
        Ok((record, false))
    }

    async fn load_fresh(
        &self,
        id: AuthorizationId,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Authorization> {
        let repository = &self.inner.repository;
        self.with_retry("load_authorization", cancel, || async move {
            repository.load(id).await.map_err(AuthorizationError::from)
        })
        .await
    }

    async fn find_by_policy(
        &self,
        policy_id: PolicyId,
        cancel: Option<&CancellationToken>,
    ) -> AuthorizationResult<Vec<Authorization>> {
        let repository = &self.inner.repository;
        self.with_retry("find_authorizations_by_policy", cancel, || async move {
            repository.find_by_policy(policy_id).await.map_err(AuthorizationError::from)
        })
        .await
    }
}
