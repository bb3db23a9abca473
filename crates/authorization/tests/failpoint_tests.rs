#![cfg(feature = "failpoints")]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p priorauth-authorization --features failpoints --test failpoint_tests
//! ```

mod common;

use std::time::Duration;

use common::{fast_config, harness, request};
use priorauth_authorization::{AuthorizationError, BatchConfig, ServiceConfig, ServiceType};
use priorauth_storage::AttemptOutcome;

#[tokio::test(start_paused = true)]
async fn save_failpoint_exhausts_retries() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("authorization-before-save", "return").expect("failed to configure fail point");

    let h = harness(fast_config());
    let err = h.service.request_authorization(request(1, ServiceType::Imaging)).await.unwrap_err();

    assert!(
        matches!(&err, AuthorizationError::RetriesExhausted { attempts: 4, .. }),
        "got {err:?}"
    );
    assert!(matches!(err.root_cause(), AuthorizationError::Connection { .. }));
    assert_eq!(h.repository.saves(), 0, "injected failure fires before the repository");
    assert_eq!(h.repository.stored(), 0);

    scenario.teardown();
}

#[tokio::test(start_paused = true)]
async fn save_failpoint_recovers_when_it_stops_firing() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("authorization-before-save", "2*return").expect("failed to configure fail point");

    let h = harness(fast_config());
    let created = h.service.request_authorization(request(1, ServiceType::Imaging)).await.unwrap();

    let outcomes: Vec<_> =
        h.sink.attempts_for("save_authorization").into_iter().map(|a| a.outcome).collect();
    assert_eq!(
        outcomes,
        vec![
            AttemptOutcome::RetryableFailure,
            AttemptOutcome::RetryableFailure,
            AttemptOutcome::Success,
        ]
    );
    assert_eq!(h.repository.load_directly(created.id()).await, created);

    scenario.teardown();
}

#[tokio::test(start_paused = true)]
async fn save_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();
    // No fail point configured; the save should go straight through.

    let h = harness(fast_config());
    h.service.request_authorization(request(1, ServiceType::Imaging)).await.unwrap();

    assert_eq!(h.sink.attempts_for("save_authorization").len(), 1);

    scenario.teardown();
}

#[tokio::test(start_paused = true)]
async fn delayed_backoff_still_completes_batch() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("authorization-before-save", "1*return").expect("failed to configure fail point");
    fail::cfg("retry-before-sleep", "sleep(50)").expect("failed to configure fail point");

    let h = harness(fast_config());
    let requests = (0..4).map(|_| request(2, ServiceType::Surgery)).collect();
    let result = h.service.request_authorizations_batch(requests).await.unwrap();

    assert!(result.is_complete_success());
    assert_eq!(h.repository.stored(), 4);

    scenario.teardown();
}

#[tokio::test(start_paused = true)]
async fn crashed_workers_leave_failed_slots() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("batch-worker-before-item", "panic").expect("failed to configure fail point");

    let config = ServiceConfig {
        batch: BatchConfig::builder()
            .parallel_workers(2)
            .deadline(Duration::from_secs(5))
            .build()
            .unwrap(),
        ..fast_config()
    };
    let h = harness(config);
    let requests = (0..5).map(|_| request(3, ServiceType::Pharmacy)).collect();
    let result = h.service.request_authorizations_batch(requests).await.unwrap();

    assert_eq!(result.failure_count(), 5);
    assert_eq!(result.timed_out_count(), 0, "workers exited before the deadline");
    assert!(result.outcomes().iter().all(|o| matches!(o, Err(AuthorizationError::Storage(_)))));
    assert_eq!(h.repository.allocations(), 0);

    scenario.teardown();
}
