//! Verifies that service operations produce the expected span hierarchy.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::{Arc, Mutex};

use common::{fast_config, harness, request};
use priorauth_authorization::{CheckCriteria, PolicyId, ServiceType};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records (span, parent) pairs as spans are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl SpanCollector {
    fn names(&self) -> Vec<String> {
        self.spans.lock().expect("lock poisoned").iter().map(|(name, _)| name.clone()).collect()
    }

    fn has_child(&self, parent: &str, child: &str) -> bool {
        self.spans
            .lock()
            .expect("lock poisoned")
            .iter()
            .any(|(name, p)| name == child && p.as_deref() == Some(parent))
    }
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            let parent = span.parent().map(|p| p.name().to_owned());
            self.spans.lock().expect("lock poisoned").push((span.name().to_owned(), parent));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn request_wraps_retried_save() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(fast_config());
    h.service.request_authorization(request(1, ServiceType::Imaging)).await.unwrap();

    assert!(
        collector.has_child("request_authorization", "retry"),
        "expected retry under request_authorization, got: {:?}",
        collector.names()
    );
    assert!(collector.has_child("retry", "save"), "got: {:?}", collector.names());
}

#[tokio::test]
async fn get_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(fast_config());
    let _ = h.service.get_authorization(priorauth_authorization::AuthorizationId(1)).await;

    let names = collector.names();
    assert!(names.iter().any(|s| s == "get_authorization"), "got: {names:?}");
    assert!(collector.has_child("retry", "load"), "got: {names:?}");
}

#[tokio::test]
async fn check_creates_span() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(fast_config());
    h.service.check_authorization(PolicyId(1), &CheckCriteria::default()).await.unwrap();

    assert!(collector.has_child("check_authorization", "retry"), "got: {:?}", collector.names());
    assert!(collector.has_child("retry", "find_by_policy"), "got: {:?}", collector.names());
}

#[tokio::test]
async fn batch_creates_span_under_entry_point() {
    let collector = SpanCollector::default();
    let subscriber = tracing_subscriber::registry().with(collector.clone());
    let _guard = tracing::subscriber::set_default(subscriber);

    let h = harness(fast_config());
    let requests = (0..3).map(|_| request(1, ServiceType::Surgery)).collect();
    h.service.request_authorizations_batch(requests).await.unwrap();

    assert!(
        collector.has_child("request_authorizations_batch", "batch"),
        "got: {:?}",
        collector.names()
    );
}
