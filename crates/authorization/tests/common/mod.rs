//! Shared fixtures for authorization integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use priorauth_authorization::{
    Authorization, AuthorizationId, AuthorizationRepository, AuthorizationRequest,
    AuthorizationService, AuthorizationStatus, MemoryAuthorizationRepository, PolicyId,
    RetryConfig, ServiceConfig, ServiceType,
};
use priorauth_storage::{
    ManualClock, MemoryCacheStore, StorageError, StorageResult,
    testutil::{CountingCacheStore, RecordingSink},
};

/// Memory repository that counts calls and can inject failures or latency.
#[derive(Default)]
pub struct InstrumentedRepository {
    inner: MemoryAuthorizationRepository,
    allocations: AtomicUsize,
    loads: AtomicUsize,
    saves: AtomicUsize,
    finds: AtomicUsize,
    save_failures: Mutex<VecDeque<StorageError>>,
    load_failures: Mutex<VecDeque<StorageError>>,
    save_delay: Mutex<Duration>,
}

impl InstrumentedRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> usize {
        self.inner.len()
    }

    /// The next `errors.len()` saves fail with these errors, in order.
    pub fn fail_saves(&self, errors: impl IntoIterator<Item = StorageError>) {
        self.save_failures.lock().extend(errors);
    }

    /// The next `errors.len()` loads fail with these errors, in order.
    pub fn fail_loads(&self, errors: impl IntoIterator<Item = StorageError>) {
        self.load_failures.lock().extend(errors);
    }

    /// Every save sleeps for `delay` before committing.
    pub fn delay_saves(&self, delay: Duration) {
        *self.save_delay.lock() = delay;
    }

    /// Writes `record` straight to the backing store, bypassing the service.
    pub async fn save_directly(&self, record: &Authorization) -> Authorization {
        self.inner.save(record).await.unwrap()
    }

    /// Reads straight from the backing store.
    pub async fn load_directly(&self, id: AuthorizationId) -> Authorization {
        self.inner.load(id).await.unwrap()
    }
}

#[async_trait]
impl AuthorizationRepository for InstrumentedRepository {
    async fn allocate_id(&self) -> StorageResult<AuthorizationId> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        self.inner.allocate_id().await
    }

    async fn load(&self, id: AuthorizationId) -> StorageResult<Authorization> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.load_failures.lock().pop_front() {
            return Err(err);
        }
        self.inner.load(id).await
    }

    async fn save(&self, record: &Authorization) -> StorageResult<Authorization> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let injected = self.save_failures.lock().pop_front();
        if let Some(err) = injected {
            return Err(err);
        }
        let delay = *self.save_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.save(record).await
    }

    async fn find_by_policy(&self, policy_id: PolicyId) -> StorageResult<Vec<Authorization>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        self.inner.find_by_policy(policy_id).await
    }
}

pub struct Harness {
    pub service: AuthorizationService,
    pub repository: Arc<InstrumentedRepository>,
    pub store: CountingCacheStore<MemoryCacheStore>,
    pub clock: ManualClock,
    pub sink: RecordingSink,
}

/// Defaults with a short retry delay so paused-time tests stay readable.
pub fn fast_config() -> ServiceConfig {
    ServiceConfig {
        retry: RetryConfig::builder().base_delay(Duration::from_millis(10)).build().unwrap(),
        ..ServiceConfig::default()
    }
}

pub fn harness(config: ServiceConfig) -> Harness {
    let repository = Arc::new(InstrumentedRepository::new());
    let store = CountingCacheStore::new(MemoryCacheStore::new());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 14, 30, 0).unwrap());
    let sink = RecordingSink::new();

    let service = AuthorizationService::builder()
        .repository(repository.clone())
        .cache_store(Arc::new(store.clone()))
        .clock(Arc::new(clock.clone()))
        .sink(Arc::new(sink.clone()))
        .config(config)
        .build();

    Harness { service, repository, store, clock, sink }
}

pub fn date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

/// A valid request covering May 2024.
pub fn request(policy_id: i64, service_type: ServiceType) -> AuthorizationRequest {
    AuthorizationRequest::builder()
        .policy_id(PolicyId(policy_id))
        .service_type(service_type)
        .start_date(date(2024, 5, 1))
        .end_date(date(2024, 5, 31))
        .diagnosis_codes(["E11.9"])
        .procedure_codes(["99214", "83036"])
        .build()
}

/// Submits a request and walks it to `APPROVED`.
pub async fn approved(service: &AuthorizationService, request: AuthorizationRequest) -> Authorization {
    let created = service.request_authorization(request).await.unwrap();
    service.update_authorization_status(created.id(), AuthorizationStatus::InReview).await.unwrap();
    service.update_authorization_status(created.id(), AuthorizationStatus::Approved).await.unwrap()
}
