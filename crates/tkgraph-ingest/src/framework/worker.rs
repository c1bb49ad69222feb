//! Bounded worker pool over an ordered item sequence
//!
//! Workers claim item indices from a shared atomic counter, so a slow item
//! never holds up a fixed shard. Each worker opens its own graph session and
//! keeps its own tally; the controller only sees completion events, from
//! which it tracks the contiguous watermark used for checkpoints.
//!
//! Cancellation stops new claims at the next checkpoint-interval boundary,
//! so the interval in flight finishes and the watermark lands on it.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::types::{ExecutionTally, ItemOutcome};
use crate::error::GraphError;
use crate::graph::{GraphSession, GraphWriter};
use crate::source::Item;

/// Per-item work performed inside a worker
#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Write one item through the worker's session.
    ///
    /// Expected failures belong in the returned [`ItemOutcome`]. An `Err`
    /// means the session is unusable: the item is counted as failed and the
    /// worker stops.
    async fn process(
        &self,
        session: &mut dyn GraphSession,
        item: &Item,
    ) -> Result<ItemOutcome, GraphError>;
}

/// Receives watermark advances from the controller
#[async_trait]
pub trait ProgressObserver: Send {
    /// Items `[0, watermark)` are done; `processed` of those done in this
    /// execution were processed successfully
    async fn advanced(&mut self, watermark: u64, processed: u64);
}

/// Observer that ignores progress
pub struct NoProgress;

#[async_trait]
impl ProgressObserver for NoProgress {
    async fn advanced(&mut self, _watermark: u64, _processed: u64) {}
}

/// What one execution over `[start, items.len())` produced
#[derive(Debug, Clone, Default)]
pub struct ControllerOutcome {
    pub tally: ExecutionTally,
    /// First index not known to be done
    pub watermark: u64,
    /// Successfully processed items below the watermark
    pub processed_below_watermark: u64,
    /// Stopped early because of cancellation
    pub cancelled: bool,
}

struct WorkerEvent {
    index: u64,
    processed: bool,
}

struct ClaimQueue {
    next: AtomicU64,
    start: u64,
    end: u64,
    interval: u64,
    cancel: CancellationToken,
}

impl ClaimQueue {
    fn claim(&self) -> Option<u64> {
        let mut current = self.next.load(Ordering::SeqCst);
        loop {
            if current >= self.end {
                return None;
            }
            if self.cancel.is_cancelled() && (current - self.start) % self.interval == 0 {
                return None;
            }
            match self
                .next
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return Some(current),
                Err(actual) => current = actual,
            }
        }
    }

    fn unclaimed(&self) -> u64 {
        self.end.saturating_sub(self.next.load(Ordering::SeqCst))
    }
}

/// Contiguous-prefix tracker over out-of-order completions
struct Watermark {
    next: u64,
    processed: u64,
    pending: BTreeMap<u64, bool>,
}

impl Watermark {
    fn new(start: u64) -> Self {
        Self {
            next: start,
            processed: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Record a completion; true if the watermark moved
    fn complete(&mut self, index: u64, processed: bool) -> bool {
        self.pending.insert(index, processed);
        let before = self.next;
        while let Some(processed) = self.pending.remove(&self.next) {
            if processed {
                self.processed += 1;
            }
            self.next += 1;
        }
        self.next != before
    }
}

/// Runs items across `max_workers` concurrent workers
#[derive(Debug, Clone)]
pub struct ThreadedExecutionController {
    max_workers: usize,
    checkpoint_interval: u64,
}

impl ThreadedExecutionController {
    pub fn new(max_workers: usize, checkpoint_interval: u64) -> Self {
        Self {
            max_workers: max_workers.max(1),
            checkpoint_interval: checkpoint_interval.max(1),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Process `items[start..]` and block until every worker has stopped.
    pub async fn execute(
        &self,
        items: Arc<Vec<Item>>,
        start: u64,
        processor: Arc<dyn ItemProcessor>,
        writer: Arc<dyn GraphWriter>,
        observer: &mut dyn ProgressObserver,
        cancel: &CancellationToken,
    ) -> ControllerOutcome {
        let end = items.len() as u64;
        let start = start.min(end);
        let remaining = end - start;
        let workers = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.max_workers);

        let claims = Arc::new(ClaimQueue {
            next: AtomicU64::new(start),
            start,
            end,
            interval: self.checkpoint_interval,
            cancel: cancel.clone(),
        });

        info!(
            items = remaining,
            start,
            workers,
            backend = writer.backend(),
            "Starting workers"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            set.spawn(run_worker(
                worker_id,
                claims.clone(),
                items.clone(),
                processor.clone(),
                writer.clone(),
                tx.clone(),
            ));
        }
        drop(tx);

        let mut watermark = Watermark::new(start);
        while let Some(event) = rx.recv().await {
            if watermark.complete(event.index, event.processed) {
                observer.advanced(watermark.next, watermark.processed).await;
            }
        }

        let mut tallies = Vec::with_capacity(workers);
        let mut tally = ExecutionTally::default();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(finished) => tallies.push(finished),
                Err(e) => {
                    error!(error = %e, "Worker task failed");
                    tally.errors.push(format!("worker task failed: {e}"));
                }
            }
        }
        tallies.sort_by_key(|(worker_id, _)| *worker_id);
        for (_, worker_tally) in tallies {
            tally.merge(worker_tally);
        }

        let cancelled = cancel.is_cancelled() && watermark.next < end;
        let abandoned = claims.unclaimed();
        if abandoned > 0 && !cancelled {
            warn!(abandoned, "Items left unprocessed after all workers stopped");
            tally.failed += abandoned;
            tally.errors.push(format!(
                "{abandoned} items abandoned after all workers stopped"
            ));
        }
        if cancelled {
            info!(watermark = watermark.next, end, "Stopped at checkpoint boundary after cancellation");
        }

        ControllerOutcome {
            tally,
            watermark: watermark.next,
            processed_below_watermark: watermark.processed,
            cancelled,
        }
    }
}

async fn run_worker(
    worker_id: usize,
    claims: Arc<ClaimQueue>,
    items: Arc<Vec<Item>>,
    processor: Arc<dyn ItemProcessor>,
    writer: Arc<dyn GraphWriter>,
    events: mpsc::UnboundedSender<WorkerEvent>,
) -> (usize, ExecutionTally) {
    let mut tally = ExecutionTally::default();

    let mut session = match writer.open_session().await {
        Ok(session) => session,
        Err(e) => {
            error!(worker_id, error = %e, "Could not open graph session");
            tally
                .errors
                .push(format!("worker {worker_id}: could not open graph session: {e}"));
            return (worker_id, tally);
        }
    };

    while let Some(index) = claims.claim() {
        let Some(item) = usize::try_from(index).ok().and_then(|i| items.get(i)) else {
            break;
        };

        let result = AssertUnwindSafe(processor.process(session.as_mut(), item))
            .catch_unwind()
            .await;

        let (outcome, stop) = match result {
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(e)) => (ItemOutcome::Failed(format!("item {index}: {e}")), Some(e.to_string())),
            Err(_) => (
                ItemOutcome::Failed(format!("item {index}: processing panicked")),
                Some("processing panicked".to_string()),
            ),
        };

        let processed = matches!(outcome, ItemOutcome::Processed { .. });
        tally.record(outcome);
        // the receiver only closes once every worker has exited
        let _ = events.send(WorkerEvent { index, processed });

        if let Some(reason) = stop {
            error!(worker_id, index, reason = %reason, "Worker stopping");
            tally
                .warnings
                .push(format!("worker {worker_id} stopped: {reason}"));
            break;
        }
    }

    debug!(
        worker_id,
        processed = tally.processed,
        failed = tally.failed,
        skipped = tally.skipped,
        "Worker finished"
    );
    (worker_id, tally)
}
