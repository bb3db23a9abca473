//! Batch entry points of `AuthorizationService`: size limits, ordering,
//! partial failure and the batch deadline.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::{collections::HashSet, time::Duration};

use common::{approved, date, fast_config, harness, request};
use priorauth_authorization::{
    AuthorizationError, AuthorizationRequest, AuthorizationStatus, BatchConfig, PolicyId,
    ServiceConfig, ServiceType,
};
use priorauth_storage::StorageError;

fn requests(n: usize) -> Vec<AuthorizationRequest> {
    (0..n).map(|i| request(1, ServiceType::ALL[i % ServiceType::ALL.len()])).collect()
}

#[tokio::test(start_paused = true)]
async fn full_batch_succeeds_in_input_order() {
    let h = harness(fast_config());
    let input = requests(100);

    let result = h.service.request_authorizations_batch(input.clone()).await.unwrap();

    assert_eq!(result.len(), 100);
    assert!(result.is_complete_success());
    let mut ids = HashSet::new();
    for (request, outcome) in input.iter().zip(result.outcomes()) {
        let record = outcome.as_ref().unwrap();
        assert_eq!(record.service_type(), request.service_type);
        assert_eq!(record.status(), AuthorizationStatus::Submitted);
        assert!(ids.insert(record.id()), "ids must be unique");
    }
    assert_eq!(h.repository.stored(), 100);

    let summary = h.sink.batches();
    assert_eq!(summary.len(), 1);
    assert_eq!((summary[0].total, summary[0].succeeded, summary[0].failed), (100, 100, 0));
}

#[tokio::test(start_paused = true)]
async fn oversized_batch_is_rejected_before_any_work() {
    let h = harness(fast_config());

    let err = h.service.request_authorizations_batch(requests(101)).await.unwrap_err();

    assert!(matches!(err, AuthorizationError::BatchTooLarge { size: 101, max: 100 }));
    assert_eq!(h.repository.allocations(), 0);
    assert_eq!(h.repository.saves(), 0);
    assert!(h.sink.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invalid_item_fails_alone() {
    let h = harness(fast_config());
    let mut input = requests(10);
    input[5].procedure_codes.clear();

    let result = h.service.request_authorizations_batch(input).await.unwrap();

    assert_eq!(result.success_count(), 9);
    assert_eq!(result.failure_count(), 1);
    assert_eq!(result.failed_indices(), vec![5]);
    assert!(matches!(result.get(5), Some(Err(AuthorizationError::Validation { .. }))));
    assert_eq!(h.repository.stored(), 9);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_inside_a_batch_are_retried() {
    let h = harness(fast_config());
    h.repository.fail_saves([StorageError::timeout(), StorageError::lock_contention("row")]);

    let result = h.service.request_authorizations_batch(requests(8)).await.unwrap();

    assert!(result.is_complete_success());
    assert_eq!(h.repository.stored(), 8);
    assert_eq!(h.repository.saves(), 10);
}

#[tokio::test(start_paused = true)]
async fn status_batch_isolates_one_illegal_edge() {
    let h = harness(fast_config());
    let created = h.service.request_authorizations_batch(requests(10)).await.unwrap();
    let ids: Vec<_> = created.outcomes().iter().map(|o| o.as_ref().unwrap().id()).collect();

    // The fifth item asks for SUBMITTED -> APPROVED, which skips review.
    let updates: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| match i {
            4 => (*id, AuthorizationStatus::Approved),
            _ => (*id, AuthorizationStatus::InReview),
        })
        .collect();

    let result = h.service.update_authorization_statuses_batch(updates).await.unwrap();

    assert_eq!(result.success_count(), 9);
    assert_eq!(result.failure_count(), 1);
    assert_eq!(result.failed_indices(), vec![4]);
    assert!(matches!(
        result.get(4),
        Some(Err(AuthorizationError::InvalidTransition {
            current: AuthorizationStatus::Submitted,
            attempted: AuthorizationStatus::Approved,
        }))
    ));
    for (i, id) in ids.iter().enumerate() {
        let record = h.service.get_authorization(*id).await.unwrap();
        let expected =
            if i == 4 { AuthorizationStatus::Submitted } else { AuthorizationStatus::InReview };
        assert_eq!(record.status(), expected, "item {i}");
    }
}

#[tokio::test(start_paused = true)]
async fn deadline_times_out_pending_items() {
    let config = ServiceConfig {
        batch: BatchConfig::builder()
            .parallel_workers(2)
            .deadline(Duration::from_secs(1))
            .build()
            .unwrap(),
        ..fast_config()
    };
    let h = harness(config);
    h.repository.delay_saves(Duration::from_millis(600));

    let result = h.service.request_authorizations_batch(requests(6)).await.unwrap();

    assert_eq!(result.len(), 6);
    assert!(result.get(0).unwrap().is_ok());
    assert!(result.get(1).unwrap().is_ok());
    for index in 2..6 {
        assert!(
            matches!(
                result.get(index),
                Some(Err(AuthorizationError::DeadlineExceeded { index: i, .. })) if *i == index
            ),
            "item {index}: {:?}",
            result.get(index)
        );
    }
    assert_eq!(result.timed_out_count(), 4);
    assert_eq!(h.repository.allocations(), 4, "items 4 and 5 never started");

    let summary = &h.sink.batches()[0];
    assert_eq!((summary.succeeded, summary.failed, summary.timed_out), (2, 4, 4));
}

#[tokio::test(start_paused = true)]
async fn expiry_sweep_spans_multiple_batches() {
    let config = ServiceConfig {
        batch: BatchConfig::builder().max_batch_size(4).build().unwrap(),
        ..fast_config()
    };
    let h = harness(config);
    for _ in 0..10 {
        approved(&h.service, request(3, ServiceType::Rehabilitation)).await;
    }
    let still_open = h.service.request_authorization(request(3, ServiceType::Imaging)).await.unwrap();

    let result = h
        .service
        .expire_lapsed_authorizations(PolicyId(3), date(2024, 6, 1))
        .await
        .unwrap();

    assert_eq!(result.len(), 10);
    assert!(result.is_complete_success());
    assert_eq!(h.sink.batches().len(), 3);
    for outcome in result.outcomes() {
        assert_eq!(outcome.as_ref().unwrap().status(), AuthorizationStatus::Expired);
    }
    let untouched = h.service.get_authorization(still_open.id()).await.unwrap();
    assert_eq!(untouched.status(), AuthorizationStatus::Submitted);
}
