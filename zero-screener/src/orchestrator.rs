//! Bounded-concurrency task orchestration.
//!
//! Runs one async unit of work per item with:
//! - a fixed worker budget (semaphore permits)
//! - a per-item timeout
//! - an overall deadline shared by every batch of a call
//! - caller cancellation through a [`CancellationToken`]
//! - panic capture, so one bad item never takes the run down
//! - a progress callback fired from the collector on a fixed tick
//!
//! When the deadline passes or the token is cancelled the call returns
//! immediately: in-flight tasks are detached (their results are discarded)
//! and every unfinished item is reported as [`TaskError::Cancelled`].

use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;

// ============================================================================
// Results
// ============================================================================

/// Why an item did not produce a value.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    #[error("Task exceeded its timeout")]
    Timeout,

    #[error("Task cancelled before completion")]
    Cancelled,

    #[error("Task panicked")]
    Panicked,

    #[error("Task failed: {0}")]
    Failed(E),
}

impl<E> TaskError<E> {
    /// Short kind used for grouping.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
            Self::Failed(_) => "failed",
        }
    }
}

/// A failed item together with its error.
#[derive(Debug)]
pub struct TaskFailure<T, E> {
    pub item: T,
    pub error: TaskError<E>,
}

/// Aggregate outcome of a `process` call.
#[derive(Debug)]
pub struct ProcessingResult<T, R, E> {
    pub successes: Vec<R>,
    pub errors: Vec<TaskFailure<T, E>>,
    /// Items submitted
    pub total: usize,
    /// Items that finished, successfully or not (cancelled items excluded)
    pub completed: usize,
    pub elapsed: Duration,
    pub deadline_exceeded: bool,
    pub cancelled: bool,
}

impl<T, R, E> ProcessingResult<T, R, E> {
    fn empty(total: usize) -> Self {
        Self {
            successes: Vec::new(),
            errors: Vec::new(),
            total,
            completed: 0,
            elapsed: Duration::ZERO,
            deadline_exceeded: false,
            cancelled: false,
        }
    }

    /// Error counts grouped by [`TaskError::kind`].
    pub fn error_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for failure in &self.errors {
            *counts.entry(failure.error.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// True when the call stopped early.
    pub fn stopped_early(&self) -> bool {
        self.deadline_exceeded || self.cancelled
    }

    fn merge(&mut self, other: Self) {
        self.successes.extend(other.successes);
        self.errors.extend(other.errors);
        self.completed += other.completed;
        self.deadline_exceeded |= other.deadline_exceeded;
        self.cancelled |= other.cancelled;
    }

    fn cancel_all(&mut self, items: impl IntoIterator<Item = T>) {
        self.errors.extend(items.into_iter().map(|item| TaskFailure {
            item,
            error: TaskError::Cancelled,
        }));
    }
}

// ============================================================================
// Progress
// ============================================================================

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub completed: usize,
    pub total: usize,
    pub successes: usize,
}

/// Progress callback. Invoked from the collector, never from workers.
pub type ProgressCallback = Arc<dyn Fn(ProgressUpdate) + Send + Sync>;

/// Running counters across the batches of one call.
struct Progress {
    total: usize,
    completed: usize,
    successes: usize,
}

impl Progress {
    fn update(&self) -> ProgressUpdate {
        ProgressUpdate {
            completed: self.completed,
            total: self.total,
            successes: self.successes,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86_400 * 365 * 30)
}

/// Reusable bounded-concurrency executor.
pub struct TaskOrchestrator {
    max_workers: usize,
    item_timeout: Duration,
    total_timeout: Duration,
    progress_interval: Duration,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl TaskOrchestrator {
    pub fn new(max_workers: usize, item_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            item_timeout,
            total_timeout,
            progress_interval: Duration::from_secs(2),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(
            config.max_workers,
            Duration::from_secs(config.item_timeout_secs),
            Duration::from_secs(config.total_timeout_secs),
        )
        .with_progress_interval(Duration::from_millis(config.progress_interval_ms))
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn with_progress<C>(mut self, callback: C) -> Self
    where
        C: Fn(ProgressUpdate) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Token that stops every current and future call on this orchestrator.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Process every item with `f`, all under one deadline.
    pub async fn process<T, R, E, F, Fut>(&self, items: Vec<T>, f: F) -> ProcessingResult<T, R, E>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let batch_size = items.len().max(1);
        self.process_batches(items, batch_size, f).await
    }

    /// Process items in sequential chunks of `batch_size`, bounding peak
    /// in-flight work. All chunks share one overall deadline; chunks that
    /// never start are reported cancelled in bulk.
    pub async fn process_batches<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        batch_size: usize,
        f: F,
    ) -> ProcessingResult<T, R, E>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let started = Instant::now();
        let deadline = started
            .checked_add(self.total_timeout)
            .unwrap_or_else(far_future);
        let total = items.len();
        let f = Arc::new(f);

        let batches = split_batches(items, batch_size.max(1));
        let batch_count = batches.len();
        let mut progress = Progress {
            total,
            completed: 0,
            successes: 0,
        };
        let mut result = ProcessingResult::empty(total);

        info!(
            total,
            batches = batch_count,
            max_workers = self.max_workers,
            item_timeout_secs = self.item_timeout.as_secs_f64(),
            total_timeout_secs = self.total_timeout.as_secs_f64(),
            "Starting task processing"
        );

        for (index, batch) in batches.into_iter().enumerate() {
            if result.stopped_early() {
                result.cancel_all(batch);
                continue;
            }
            debug!(batch = index + 1, batches = batch_count, size = batch.len(), "Starting batch");
            let part = self.run_batch(batch, &f, deadline, &mut progress).await;
            result.merge(part);
        }

        self.report(&progress);
        result.elapsed = started.elapsed();

        if result.deadline_exceeded {
            warn!(
                completed = result.completed,
                total,
                elapsed_secs = result.elapsed.as_secs_f64(),
                "Overall deadline exceeded, remaining tasks cancelled"
            );
        } else if result.cancelled {
            warn!(completed = result.completed, total, "Processing cancelled by caller");
        }
        info!(
            total,
            completed = result.completed,
            successes = result.successes.len(),
            errors = result.errors.len(),
            elapsed_secs = result.elapsed.as_secs_f64(),
            "Task processing finished"
        );

        result
    }

    async fn run_batch<T, R, E, F, Fut>(
        &self,
        items: Vec<T>,
        f: &Arc<F>,
        deadline: Instant,
        progress: &mut Progress,
    ) -> ProcessingResult<T, R, E>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        E: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let total = items.len();
        let mut result = ProcessingResult::empty(total);

        if self.cancel.is_cancelled() {
            result.cancelled = true;
            result.cancel_all(items);
            return result;
        }
        if Instant::now() >= deadline {
            result.deadline_exceeded = true;
            result.cancel_all(items);
            return result;
        }

        // Items stay in their slot until their task reports back; whatever
        // is left when the batch stops is reported cancelled.
        let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks: JoinSet<(usize, Result<R, TaskError<E>>)> = JoinSet::new();
        let mut next = 0;

        let expired = tokio::time::sleep_until(deadline);
        tokio::pin!(expired);

        let mut ticker = tokio::time::interval(self.progress_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            while next < total {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(item) = slots[next].clone() else {
                    next += 1;
                    continue;
                };
                let f = Arc::clone(f);
                let item_timeout = self.item_timeout;
                let index = next;

                tasks.spawn(async move {
                    let _permit = permit;
                    // Building the future inside the guarded block catches
                    // panics raised while constructing it as well
                    let guarded = AssertUnwindSafe(async move { f(item).await }).catch_unwind();
                    let outcome = match tokio::time::timeout(item_timeout, guarded).await {
                        Ok(Ok(Ok(value))) => Ok(value),
                        Ok(Ok(Err(e))) => Err(TaskError::Failed(e)),
                        Ok(Err(_)) => Err(TaskError::Panicked),
                        Err(_) => Err(TaskError::Timeout),
                    };
                    (index, outcome)
                });
                next += 1;
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    result.cancelled = true;
                    break;
                }
                _ = &mut expired => {
                    result.deadline_exceeded = true;
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((index, outcome))) => {
                        let item = slots[index].take();
                        result.completed += 1;
                        progress.completed += 1;
                        match outcome {
                            Ok(value) => {
                                progress.successes += 1;
                                result.successes.push(value);
                            }
                            Err(error) => {
                                if matches!(error, TaskError::Panicked) {
                                    warn!(index, "Task panicked");
                                }
                                if let Some(item) = item {
                                    result.errors.push(TaskFailure { item, error });
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        // Only reachable if the runtime aborts a task; its
                        // slot stays filled and is reported cancelled below
                        warn!(error = %e, "Task join failed");
                    }
                    None => {}
                },
                _ = ticker.tick(), if self.progress.is_some() => {
                    self.report(progress);
                }
            }
        }

        if !tasks.is_empty() {
            debug!(in_flight = tasks.len(), "Detaching in-flight tasks");
            tasks.detach_all();
        }
        result.cancel_all(slots.into_iter().flatten());

        result
    }

    fn report(&self, progress: &Progress) {
        if let Some(callback) = &self.progress {
            callback(progress.update());
        }
    }
}

fn split_batches<T>(mut items: Vec<T>, batch_size: usize) -> Vec<Vec<T>> {
    let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
    while items.len() > batch_size {
        let rest = items.split_off(batch_size);
        batches.push(items);
        items = rest;
    }
    if !items.is_empty() {
        batches.push(items);
    }
    batches
}
