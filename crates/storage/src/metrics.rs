//! Observability events and the in-process metrics collector.
//!
//! The reliability layer never talks to a metrics backend directly. It emits
//! events into an [`EventSink`]; exporters (Prometheus, OTLP, logs) implement
//! the trait. This module ships two sinks:
//!
//! - [`Metrics`]: lock-free counters plus a bounded latency window for attempt
//!   percentiles. Cheap to clone, suitable for the hot path.
//! - [`NoopSink`]: discards everything.
//!
//! # Memory Ordering
//!
//! All counters use `Ordering::Relaxed`. Each counter is independent and
//! monotonically increasing; a snapshot may observe counters at slightly
//! different points in time, which is acceptable for telemetry.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//!
//! use priorauth_storage::{AttemptEvent, AttemptOutcome, EventSink, Metrics};
//!
//! let metrics = Metrics::new();
//! metrics.record_attempt(&AttemptEvent {
//!     operation: "save_authorization".into(),
//!     attempt: 0,
//!     outcome: AttemptOutcome::Success,
//!     elapsed: Duration::from_micros(100),
//!     backoff: None,
//! });
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.attempt_count, 1);
//! assert_eq!(snapshot.attempt_percentiles.p50, 100);
//! ```

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tracing::warn;

/// Default number of latency samples retained.
const DEFAULT_HISTOGRAM_WINDOW_SIZE: usize = 1024;

// ── Events ──────────────────────────────────────────────────────────────

/// How a single attempt of a retried operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptOutcome {
    /// The attempt produced a value.
    Success,
    /// The attempt failed with a retryable error and another attempt follows.
    RetryableFailure,
    /// The attempt failed with an error that must not be retried.
    NonRetryableFailure,
    /// The attempt failed with a retryable error and no attempts remain.
    Exhausted,
    /// The attempt failed with a retryable error but the caller's deadline
    /// forbids starting another one.
    Cancelled,
}

impl AttemptOutcome {
    /// Stable lowercase label for exporters.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RetryableFailure => "retryable_failure",
            Self::NonRetryableFailure => "non_retryable_failure",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One attempt of a retried operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptEvent {
    /// Name of the wrapped operation.
    pub operation: String,
    /// Zero-based attempt index.
    pub attempt: u32,
    /// How the attempt ended.
    pub outcome: AttemptOutcome,
    /// Time spent inside the operation for this attempt.
    pub elapsed: Duration,
    /// Delay scheduled before the next attempt, if one follows.
    pub backoff: Option<Duration>,
}

/// Result of a cache lookup or maintenance action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOutcome {
    /// A fresh entry was served.
    Hit,
    /// No entry existed.
    Miss,
    /// An entry existed but its TTL had elapsed; treated as a miss.
    Stale,
    /// An entry was written.
    Put,
    /// An entry was removed.
    Invalidate,
}

/// Aggregate outcome of one batch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    /// Name of the batch operation.
    pub operation: String,
    /// Number of input items.
    pub total: usize,
    /// Items that produced a value.
    pub succeeded: usize,
    /// Items that produced an error (including deadline expiry).
    pub failed: usize,
    /// Items that were still pending when the deadline elapsed.
    pub timed_out: usize,
    /// Wall-clock duration of the batch.
    pub elapsed: Duration,
}

/// Receiver for observability events.
///
/// Implementations must be cheap and non-blocking; they are called on the hot
/// path of every attempt.
pub trait EventSink: Send + Sync {
    /// Records one attempt of a retried operation.
    fn record_attempt(&self, event: &AttemptEvent);

    /// Records a cache interaction in the given key namespace.
    fn record_cache(&self, namespace: &'static str, outcome: CacheOutcome);

    /// Records the summary of a finished batch.
    fn record_batch(&self, summary: &BatchSummary);

    /// Records a named domain event (for example `authorization.created`).
    fn record_event(&self, name: &'static str);
}

/// [`EventSink`] that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn record_attempt(&self, _event: &AttemptEvent) {}

    fn record_cache(&self, _namespace: &'static str, _outcome: CacheOutcome) {}

    fn record_batch(&self, _summary: &BatchSummary) {}

    fn record_event(&self, _name: &'static str) {}
}

// ── LatencyPercentiles / LatencyHistogram ───────────────────────────────

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// 50th percentile (median) latency in microseconds.
    pub p50: u64,
    /// 95th percentile latency in microseconds.
    pub p95: u64,
    /// 99th percentile latency in microseconds.
    pub p99: u64,
}

/// A bounded circular buffer of latency samples.
///
/// Older values are overwritten once the buffer is full. Percentiles are
/// computed on demand by sorting a copy of the buffer.
pub(crate) struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
    capacity: usize,
}

impl LatencyHistogram {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(HistogramInner {
                buf: Vec::with_capacity(capacity),
                pos: 0,
                capacity,
            }),
        }
    }

    pub(crate) fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < inner.capacity {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % inner.capacity;
    }

    pub(crate) fn percentiles(&self) -> LatencyPercentiles {
        let inner = self.inner.lock();
        if inner.buf.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted = inner.buf.clone();
        drop(inner);
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }

    pub(crate) fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.buf.clear();
        inner.pos = 0;
    }
}

fn saturating_u64(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    if len == 0 {
        return 0;
    }
    let rank = u64::from(percentile).saturating_mul(saturating_u64(len)).div_ceil(100);
    usize::try_from(rank).unwrap_or(usize::MAX).saturating_sub(1).min(len - 1)
}

// ── MetricsSnapshot ─────────────────────────────────────────────────────

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Total attempts across all retried operations.
    pub attempt_count: u64,
    /// Attempts that failed and were followed by a backoff and retry.
    pub retry_count: u64,
    /// Operations that ran out of attempts.
    pub retry_exhausted_count: u64,
    /// Attempts that failed with a non-retryable error.
    pub non_retryable_count: u64,
    /// Retry loops stopped early by a caller deadline.
    pub cancelled_count: u64,
    /// Attempt latency percentiles.
    pub attempt_percentiles: LatencyPercentiles,

    /// Fresh cache entries served.
    pub cache_hits: u64,
    /// Lookups that found nothing.
    pub cache_misses: u64,
    /// Lookups that found an expired entry.
    pub cache_stale: u64,
    /// Cache writes.
    pub cache_puts: u64,
    /// Cache invalidations.
    pub cache_invalidations: u64,

    /// Batches executed.
    pub batch_count: u64,
    /// Items across all batches.
    pub batch_items: u64,
    /// Batch items that succeeded.
    pub batch_succeeded: u64,
    /// Batch items that failed.
    pub batch_failed: u64,
    /// Batch items cut off by the batch deadline.
    pub batch_timed_out: u64,

    /// Named domain events, keyed by name.
    pub events: BTreeMap<&'static str, u64>,
}

impl MetricsSnapshot {
    /// Returns the cache hit rate (0.0 - 1.0). Stale reads count as misses.
    #[must_use]
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses + self.cache_stale;
        if total == 0 { 0.0 } else { self.cache_hits as f64 / total as f64 }
    }

    /// Returns the fraction of batch items that failed (0.0 - 1.0).
    #[must_use]
    pub fn batch_failure_rate(&self) -> f64 {
        if self.batch_items == 0 {
            0.0
        } else {
            self.batch_failed as f64 / self.batch_items as f64
        }
    }

    /// Returns the count recorded for a named event, or zero.
    #[must_use]
    pub fn event_count(&self, name: &str) -> u64 {
        self.events.get(name).copied().unwrap_or(0)
    }
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Lock-free [`EventSink`] that aggregates events into counters.
///
/// Clones share the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    attempt_count: AtomicU64,
    retry_count: AtomicU64,
    retry_exhausted_count: AtomicU64,
    non_retryable_count: AtomicU64,
    cancelled_count: AtomicU64,
    attempt_histogram: LatencyHistogram,

    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_stale: AtomicU64,
    cache_puts: AtomicU64,
    cache_invalidations: AtomicU64,

    batch_count: AtomicU64,
    batch_items: AtomicU64,
    batch_succeeded: AtomicU64,
    batch_failed: AtomicU64,
    batch_timed_out: AtomicU64,

    events: Mutex<BTreeMap<&'static str, u64>>,
}

impl Metrics {
    /// Creates a new metrics collector.
    #[must_use]
    pub fn new() -> Self {
        Self::with_window(DEFAULT_HISTOGRAM_WINDOW_SIZE)
    }

    /// Creates a collector that keeps the last `window` attempt latencies.
    #[must_use]
    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                attempt_count: AtomicU64::new(0),
                retry_count: AtomicU64::new(0),
                retry_exhausted_count: AtomicU64::new(0),
                non_retryable_count: AtomicU64::new(0),
                cancelled_count: AtomicU64::new(0),
                attempt_histogram: LatencyHistogram::new(window),
                cache_hits: AtomicU64::new(0),
                cache_misses: AtomicU64::new(0),
                cache_stale: AtomicU64::new(0),
                cache_puts: AtomicU64::new(0),
                cache_invalidations: AtomicU64::new(0),
                batch_count: AtomicU64::new(0),
                batch_items: AtomicU64::new(0),
                batch_succeeded: AtomicU64::new(0),
                batch_failed: AtomicU64::new(0),
                batch_timed_out: AtomicU64::new(0),
                events: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    /// Returns a snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let i = &self.inner;
        MetricsSnapshot {
            attempt_count: i.attempt_count.load(Ordering::Relaxed),
            retry_count: i.retry_count.load(Ordering::Relaxed),
            retry_exhausted_count: i.retry_exhausted_count.load(Ordering::Relaxed),
            non_retryable_count: i.non_retryable_count.load(Ordering::Relaxed),
            cancelled_count: i.cancelled_count.load(Ordering::Relaxed),
            attempt_percentiles: i.attempt_histogram.percentiles(),
            cache_hits: i.cache_hits.load(Ordering::Relaxed),
            cache_misses: i.cache_misses.load(Ordering::Relaxed),
            cache_stale: i.cache_stale.load(Ordering::Relaxed),
            cache_puts: i.cache_puts.load(Ordering::Relaxed),
            cache_invalidations: i.cache_invalidations.load(Ordering::Relaxed),
            batch_count: i.batch_count.load(Ordering::Relaxed),
            batch_items: i.batch_items.load(Ordering::Relaxed),
            batch_succeeded: i.batch_succeeded.load(Ordering::Relaxed),
            batch_failed: i.batch_failed.load(Ordering::Relaxed),
            batch_timed_out: i.batch_timed_out.load(Ordering::Relaxed),
            events: i.events.lock().clone(),
        }
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        let i = &self.inner;
        for counter in [
            &i.attempt_count,
            &i.retry_count,
            &i.retry_exhausted_count,
            &i.non_retryable_count,
            &i.cancelled_count,
            &i.cache_hits,
            &i.cache_misses,
            &i.cache_stale,
            &i.cache_puts,
            &i.cache_invalidations,
            &i.batch_count,
            &i.batch_items,
            &i.batch_succeeded,
            &i.batch_failed,
            &i.batch_timed_out,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        i.attempt_histogram.reset();
        i.events.lock().clear();
    }

    /// Logs current metrics at INFO level.
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();

        if snapshot.attempt_count == 0 && snapshot.batch_count == 0 {
            return;
        }

        tracing::info!(
            attempt_count = snapshot.attempt_count,
            retry_count = snapshot.retry_count,
            retry_exhausted_count = snapshot.retry_exhausted_count,
            non_retryable_count = snapshot.non_retryable_count,
            attempt_p50_us = snapshot.attempt_percentiles.p50,
            attempt_p99_us = snapshot.attempt_percentiles.p99,
            cache_hit_rate = snapshot.cache_hit_rate(),
            batch_count = snapshot.batch_count,
            batch_failure_rate = snapshot.batch_failure_rate(),
            "Authorization metrics snapshot"
        );

        if snapshot.batch_failure_rate() > 0.05 {
            warn!(
                batch_failure_rate = snapshot.batch_failure_rate(),
                batch_failed = snapshot.batch_failed,
                batch_items = snapshot.batch_items,
                "High batch item failure rate detected"
            );
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for Metrics {
    fn record_attempt(&self, event: &AttemptEvent) {
        let i = &self.inner;
        i.attempt_count.fetch_add(1, Ordering::Relaxed);
        let elapsed_us = u64::try_from(event.elapsed.as_micros()).unwrap_or(u64::MAX);
        i.attempt_histogram.record(elapsed_us);
        match event.outcome {
            AttemptOutcome::Success => {},
            AttemptOutcome::RetryableFailure => {
                i.retry_count.fetch_add(1, Ordering::Relaxed);
            },
            AttemptOutcome::NonRetryableFailure => {
                i.non_retryable_count.fetch_add(1, Ordering::Relaxed);
            },
            AttemptOutcome::Exhausted => {
                i.retry_exhausted_count.fetch_add(1, Ordering::Relaxed);
            },
            AttemptOutcome::Cancelled => {
                i.cancelled_count.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    fn record_cache(&self, _namespace: &'static str, outcome: CacheOutcome) {
        let i = &self.inner;
        let counter = match outcome {
            CacheOutcome::Hit => &i.cache_hits,
            CacheOutcome::Miss => &i.cache_misses,
            CacheOutcome::Stale => &i.cache_stale,
            CacheOutcome::Put => &i.cache_puts,
            CacheOutcome::Invalidate => &i.cache_invalidations,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_batch(&self, summary: &BatchSummary) {
        let i = &self.inner;
        i.batch_count.fetch_add(1, Ordering::Relaxed);
        i.batch_items.fetch_add(saturating_u64(summary.total), Ordering::Relaxed);
        i.batch_succeeded.fetch_add(saturating_u64(summary.succeeded), Ordering::Relaxed);
        i.batch_failed.fetch_add(saturating_u64(summary.failed), Ordering::Relaxed);
        i.batch_timed_out.fetch_add(saturating_u64(summary.timed_out), Ordering::Relaxed);
    }

    fn record_event(&self, name: &'static str) {
        *self.inner.events.lock().entry(name).or_insert(0) += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(outcome: AttemptOutcome, elapsed_us: u64) -> AttemptEvent {
        AttemptEvent {
            operation: "op".into(),
            attempt: 0,
            outcome,
            elapsed: Duration::from_micros(elapsed_us),
            backoff: None,
        }
    }

    #[test]
    fn test_histogram_empty_percentiles() {
        let h = LatencyHistogram::new(16);
        assert_eq!(h.percentiles(), LatencyPercentiles::default());
    }

    #[test]
    fn test_histogram_known_distribution() {
        let h = LatencyHistogram::new(1024);
        for v in 1..=100 {
            h.record(v);
        }
        let p = h.percentiles();
        assert_eq!(p.p50, 50);
        assert_eq!(p.p95, 95);
        assert_eq!(p.p99, 99);
    }

    #[test]
    fn test_histogram_circular_eviction() {
        let h = LatencyHistogram::new(10);
        for v in 1..=20 {
            h.record(v);
        }
        let p = h.percentiles();
        assert_eq!(p.p50, 15);
        assert_eq!(p.p99, 20);
    }

    proptest::proptest! {
        #[test]
        fn prop_percentiles_are_ordered_samples(
            samples in proptest::collection::vec(0u64..1_000_000, 1..200),
            capacity in 1usize..64,
        ) {
            let h = LatencyHistogram::new(capacity);
            for v in &samples {
                h.record(*v);
            }
            let p = h.percentiles();
            proptest::prop_assert!(p.p50 <= p.p95 && p.p95 <= p.p99);
            let window = &samples[samples.len().saturating_sub(capacity)..];
            proptest::prop_assert!(window.contains(&p.p50));
            proptest::prop_assert!(p.p99 <= window.iter().copied().max().unwrap_or(0));
        }
    }

    #[test]
    fn test_percentile_index_edge_cases() {
        assert_eq!(percentile_index(0, 50), 0);
        assert_eq!(percentile_index(1, 99), 0);
        assert_eq!(percentile_index(100, 50), 49);
        assert_eq!(percentile_index(100, 99), 98);
        assert!(percentile_index(usize::MAX, 99) < usize::MAX);
    }

    #[test]
    fn test_attempt_outcomes_feed_counters() {
        let metrics = Metrics::new();
        metrics.record_attempt(&attempt(AttemptOutcome::RetryableFailure, 10));
        metrics.record_attempt(&attempt(AttemptOutcome::RetryableFailure, 10));
        metrics.record_attempt(&attempt(AttemptOutcome::Exhausted, 10));
        metrics.record_attempt(&attempt(AttemptOutcome::NonRetryableFailure, 10));
        metrics.record_attempt(&attempt(AttemptOutcome::Success, 10));
        metrics.record_attempt(&attempt(AttemptOutcome::Cancelled, 10));

        let s = metrics.snapshot();
        assert_eq!(s.attempt_count, 6);
        assert_eq!(s.retry_count, 2);
        assert_eq!(s.retry_exhausted_count, 1);
        assert_eq!(s.non_retryable_count, 1);
        assert_eq!(s.cancelled_count, 1);
    }

    #[test]
    fn test_cache_hit_rate_counts_stale_as_miss() {
        let metrics = Metrics::new();
        metrics.record_cache("entity", CacheOutcome::Hit);
        metrics.record_cache("entity", CacheOutcome::Miss);
        metrics.record_cache("entity", CacheOutcome::Stale);
        metrics.record_cache("entity", CacheOutcome::Hit);

        let s = metrics.snapshot();
        assert!((s.cache_hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_batch_and_event_counters() {
        let metrics = Metrics::new();
        metrics.record_batch(&BatchSummary {
            operation: "request_authorizations_batch".into(),
            total: 10,
            succeeded: 9,
            failed: 1,
            timed_out: 0,
            elapsed: Duration::from_millis(5),
        });
        metrics.record_event("authorization.created");
        metrics.record_event("authorization.created");

        let s = metrics.snapshot();
        assert_eq!(s.batch_count, 1);
        assert_eq!(s.batch_items, 10);
        assert!((s.batch_failure_rate() - 0.1).abs() < 1e-9);
        assert_eq!(s.event_count("authorization.created"), 2);
        assert_eq!(s.event_count("never"), 0);
    }

    #[test]
    fn test_reset_clears_everything() {
        let metrics = Metrics::new();
        metrics.record_attempt(&attempt(AttemptOutcome::Success, 10));
        metrics.record_cache("entity", CacheOutcome::Hit);
        metrics.record_event("x");

        metrics.reset();

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = Metrics::new();
        let clone = metrics.clone();
        clone.record_event("x");
        assert_eq!(metrics.snapshot().event_count("x"), 1);
    }
}
