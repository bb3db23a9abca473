//! Bounded-parallel batch execution.
//!
//! [`BatchOrchestrator::execute`] feeds items to a fixed pool of worker tasks
//! over a channel and collects `(index, outcome)` messages back, so results
//! line up with inputs no matter which item finishes first.
//!
//! # Deadline
//!
//! When the batch deadline elapses, the shared [`CancellationToken`] fires and
//! the orchestrator returns at once. Items that had not finished get
//! [`AuthorizationError::DeadlineExceeded`]. Workers are detached rather than
//! aborted: an attempt already in flight runs to completion, but no new
//! attempt or item is started.
//!
//! ```text
//!  items ──► [task channel] ──► worker 0..N ──► [result channel] ──► slots[index]
//!                                   │                                    │
//!                                   └──── CancellationToken ◄── deadline ┘
//! ```

use std::{future::Future, sync::Arc, time::Duration};

use fail::fail_point;
use priorauth_storage::{BatchSummary, EventSink, NoopSink, StorageError};
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{config::BatchConfig, error::AuthorizationError, retry::RetryExecutor};

/// Per-item results of one batch call, in input order.
#[derive(Debug)]
pub struct BatchResult<T> {
    outcomes: Vec<Result<T, AuthorizationError>>,
    succeeded: usize,
    timed_out: usize,
    elapsed: Duration,
}

impl<T> BatchResult<T> {
    fn new(
        outcomes: Vec<Result<T, AuthorizationError>>,
        timed_out: usize,
        elapsed: Duration,
    ) -> Self {
        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        Self { outcomes, succeeded, timed_out, elapsed }
    }

    /// Outcomes, one per input item, in input order.
    #[must_use]
    pub fn outcomes(&self) -> &[Result<T, AuthorizationError>] {
        &self.outcomes
    }

    /// Consumes the result, returning the outcomes.
    #[must_use]
    pub fn into_outcomes(self) -> Vec<Result<T, AuthorizationError>> {
        self.outcomes
    }

    /// Outcome of the item at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Result<T, AuthorizationError>> {
        self.outcomes.get(index)
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns `true` for an empty batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Items that produced a value.
    #[must_use]
    pub fn success_count(&self) -> usize {
        self.succeeded
    }

    /// Items that produced an error, including deadline expiry.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.outcomes.len() - self.succeeded
    }

    /// Items still pending when the deadline elapsed.
    #[must_use]
    pub fn timed_out_count(&self) -> usize {
        self.timed_out
    }

    /// Positions of failed items.
    #[must_use]
    pub fn failed_indices(&self) -> Vec<usize> {
        self.outcomes.iter().enumerate().filter(|(_, o)| o.is_err()).map(|(i, _)| i).collect()
    }

    /// Returns `true` if every item succeeded.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.succeeded == self.outcomes.len()
    }

    /// Wall-clock time the batch took.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Appends another batch's outcomes after this one's.
    pub fn extend(&mut self, other: BatchResult<T>) {
        self.outcomes.extend(other.outcomes);
        self.succeeded += other.succeeded;
        self.timed_out += other.timed_out;
        self.elapsed += other.elapsed;
    }
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self::new(Vec::new(), 0, Duration::ZERO)
    }
}

/// Runs batches of independent items on a bounded worker pool.
#[derive(Clone)]
pub struct BatchOrchestrator {
    config: BatchConfig,
    retry: RetryExecutor,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    /// Creates an orchestrator that retries each item through `retry`.
    #[must_use]
    pub fn new(config: BatchConfig, retry: RetryExecutor) -> Self {
        Self { config, retry, sink: Arc::new(NoopSink) }
    }

    /// Sends a [`BatchSummary`] per call to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The orchestrator's configuration.
    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Runs `op` once per item with at most `parallel_workers` in flight.
    ///
    /// `op` receives the item and the batch's cancellation token. Each item
    /// is retried through the orchestrator's [`RetryExecutor`] using
    /// [`AuthorizationError::class`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::BatchTooLarge`] before running anything
    /// if `items` exceeds `max_batch_size`. Per-item failures are reported in
    /// the returned [`BatchResult`].
    #[tracing::instrument(
        name = "batch",
        skip_all,
        fields(operation = operation, size = items.len(), workers = self.config.parallel_workers())
    )]
    pub async fn execute<I, T, F, Fut>(
        &self,
        operation: &'static str,
        items: Vec<I>,
        op: F,
    ) -> Result<BatchResult<T>, AuthorizationError>
    where
        I: Clone + Send + Sync + 'static,
        T: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, AuthorizationError>> + Send + 'static,
    {
        let total = items.len();
        let max = self.config.max_batch_size();
        if total > max {
            warn!(size = total, max, "batch rejected");
            return Err(AuthorizationError::BatchTooLarge { size: total, max });
        }

        let started = Instant::now();
        let deadline = self.config.deadline();
        let cancel = CancellationToken::new();

        let (task_tx, task_rx) = mpsc::unbounded_channel::<(usize, I)>();
        for entry in items.into_iter().enumerate() {
            if task_tx.send(entry).is_err() {
                break;
            }
        }
        drop(task_tx);
        let task_rx = Arc::new(Mutex::new(task_rx));

        let (result_tx, mut result_rx) =
            mpsc::unbounded_channel::<(usize, Result<T, AuthorizationError>)>();
        let op = Arc::new(op);

        for worker in 0..self.config.parallel_workers().min(total) {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let op = Arc::clone(&op);
            let cancel = cancel.clone();
            let retry = self.retry.clone();

            tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let next = task_rx.lock().await.recv().await;
                    let Some((index, item)) = next else { break };
                    if cancel.is_cancelled() {
                        break;
                    }

                    fail_point!("batch-worker-before-item");
                    let outcome = retry
                        .run_cancellable(operation, &AuthorizationError::class, &cancel, || {
                            op(item.clone(), cancel.clone())
                        })
                        .await
                        .map_err(AuthorizationError::from);

                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
                debug!(worker, "batch worker finished");
            });
        }
        drop(result_tx);

        let mut slots: Vec<Option<Result<T, AuthorizationError>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut pending = total;
        let expiry = match started.checked_add(deadline) {
            Some(at) => tokio::time::sleep_until(at),
            None => tokio::time::sleep(deadline),
        };
        tokio::pin!(expiry);

        while pending > 0 {
            tokio::select! {
                biased;
                received = result_rx.recv() => match received {
                    Some((index, outcome)) => {
                        if let Some(slot) = slots.get_mut(index)
                            && slot.replace(outcome).is_none()
                        {
                            pending -= 1;
                        }
                    },
                    None => break,
                },
                () = &mut expiry => {
                    warn!(
                        pending,
                        deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "batch deadline elapsed",
                    );
                    break;
                },
            }
        }
        cancel.cancel();

        let deadline_hit = pending > 0 && started.elapsed() >= deadline;
        let mut timed_out = 0;
        let outcomes: Vec<_> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    if deadline_hit {
                        timed_out += 1;
                        Err(AuthorizationError::DeadlineExceeded { index, deadline })
                    } else {
                        Err(AuthorizationError::Storage(StorageError::internal(
                            "batch worker exited before reporting",
                        )))
                    }
                })
            })
            .collect();

        let result = BatchResult::new(outcomes, timed_out, started.elapsed());
        self.sink.record_batch(&BatchSummary {
            operation: operation.to_owned(),
            total,
            succeeded: result.success_count(),
            failed: result.failure_count(),
            timed_out,
            elapsed: result.elapsed(),
        });
        info!(
            total,
            succeeded = result.success_count(),
            failed = result.failure_count(),
            timed_out,
            elapsed_ms = u64::try_from(result.elapsed().as_millis()).unwrap_or(u64::MAX),
            "batch completed",
        );
        Ok(result)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use priorauth_storage::testutil::RecordingSink;

    use super::*;
    use crate::config::RetryConfig;

    fn orchestrator(workers: usize, deadline: Duration) -> BatchOrchestrator {
        let config = BatchConfig::builder()
            .parallel_workers(workers)
            .deadline(deadline)
            .build()
            .unwrap();
        BatchOrchestrator::new(config, RetryExecutor::new(RetryConfig::default()))
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_is_empty_result() {
        let result = orchestrator(5, Duration::from_secs(30))
            .execute("noop", Vec::<u32>::new(), |n, _| async move { Ok(n) })
            .await
            .unwrap();

        assert!(result.is_empty());
        assert_eq!((result.success_count(), result.failure_count()), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batch_runs_nothing() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let err = orchestrator(5, Duration::from_secs(30))
            .execute("big", (0..101).collect::<Vec<u32>>(), move |n, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AuthorizationError::BatchTooLarge { size: 101, max: 100 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn outcomes_follow_input_order() {
        let result = orchestrator(4, Duration::from_secs(30))
            .execute("ordered", (0..20u64).collect(), |n, _| async move {
                tokio::time::sleep(Duration::from_millis(100 - n * 5)).await;
                Ok(n * 10)
            })
            .await
            .unwrap();

        let values: Vec<u64> = result.into_outcomes().into_iter().map(Result::unwrap).collect();
        assert_eq!(values, (0..20).map(|n| n * 10).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn parallelism_never_exceeds_worker_count() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (current, max_seen) = (Arc::clone(&in_flight), Arc::clone(&peak));

        orchestrator(3, Duration::from_secs(30))
            .execute("bounded", (0..12).collect::<Vec<u32>>(), move |n, _| {
                let current = Arc::clone(&current);
                let max_seen = Arc::clone(&max_seen);
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_isolated_per_item() {
        let result = orchestrator(5, Duration::from_secs(30))
            .execute("mixed", (0..10).collect::<Vec<u32>>(), |n, _| async move {
                if n == 5 { Err(AuthorizationError::validation("five")) } else { Ok(n) }
            })
            .await
            .unwrap();

        assert_eq!(result.success_count(), 9);
        assert_eq!(result.failure_count(), 1);
        assert_eq!(result.failed_indices(), vec![5]);
        assert!(matches!(result.get(5), Some(Err(AuthorizationError::Validation { .. }))));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_item_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = orchestrator(1, Duration::from_secs(30))
            .execute("flaky", vec![()], move |(), _| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { if n == 0 { Err(AuthorizationError::Timeout) } else { Ok(n) } }
            })
            .await
            .unwrap();

        assert!(result.is_complete_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_marks_pending_items() {
        let sink = RecordingSink::new();
        let result = orchestrator(2, Duration::from_secs(1))
            .with_sink(Arc::new(sink.clone()))
            .execute("slow", (0..6u64).collect(), |n, _| async move {
                let delay = if n < 2 { 100 } else { 5_000 };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(n)
            })
            .await
            .unwrap();

        assert_eq!(result.success_count(), 2);
        assert_eq!(result.timed_out_count(), 4);
        for index in 2..6 {
            assert!(matches!(
                result.get(index),
                Some(Err(AuthorizationError::DeadlineExceeded { index: i, .. })) if *i == index
            ));
        }
        assert!(result.elapsed() < Duration::from_secs(2));

        let summary = &sink.batches()[0];
        assert_eq!((summary.total, summary.succeeded, summary.timed_out), (6, 2, 4));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_stops_workers_from_starting_new_items() {
        let started = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&started);

        orchestrator(1, Duration::from_millis(150))
            .execute("slow", (0..5u32).collect(), move |n, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(n)
                }
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(started.load(Ordering::SeqCst), 2, "second item finishes, no third starts");
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_deadline_runs_batch_to_completion() {
        let result = orchestrator(2, Duration::MAX)
            .execute("unbounded", (0..4u32).collect(), |n, _| async move {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(n)
            })
            .await
            .unwrap();

        assert!(result.is_complete_success());
        assert_eq!(result.timed_out_count(), 0);
    }

    #[test]
    fn counts_track_outcomes() {
        let result = BatchResult::new(
            vec![Ok(1), Err(AuthorizationError::validation("bad")), Ok(3), Ok(4)],
            0,
            Duration::ZERO,
        );

        assert_eq!((result.success_count(), result.failure_count()), (3, 1));
        assert!(!result.is_complete_success());
        assert!(BatchResult::<u32>::default().is_complete_success());
    }

    #[test]
    fn extend_concatenates_in_order() {
        let mut a = BatchResult::new(vec![Ok(1)], 0, Duration::from_millis(5));
        let expired = AuthorizationError::DeadlineExceeded { index: 0, deadline: Duration::ZERO };
        let b = BatchResult::new(vec![Err(expired), Ok(3)], 1, Duration::from_millis(7));

        a.extend(b);

        assert_eq!(a.len(), 3);
        assert_eq!(a.failed_indices(), vec![1]);
        assert_eq!((a.success_count(), a.failure_count()), (2, 1));
        assert_eq!(a.timed_out_count(), 1);
        assert_eq!(a.elapsed(), Duration::from_millis(12));
    }
}
