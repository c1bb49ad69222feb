//! Checkpoint-aware execution
//!
//! Wraps [`ThreadedExecutionController`] so that progress is saved every
//! `interval` items past the start offset and once more when the execution
//! ends. Resuming passes the stored offset as `skip_count`; items between the
//! last save and a crash are processed again, which the idempotent graph
//! writes absorb.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::{ExecutionTally, LoaderConfig};
use super::worker::{ItemProcessor, ProgressObserver, ThreadedExecutionController};
use crate::checkpoint::CheckpointManager;
use crate::error::{IngestError, Result};
use crate::graph::GraphWriter;
use crate::source::Item;

/// Where a loader's progress is persisted
#[derive(Clone)]
pub struct CheckpointScope {
    pub manager: Arc<CheckpointManager>,
    pub run_id: String,
    pub loader: String,
}

impl CheckpointScope {
    pub fn new(
        manager: Arc<CheckpointManager>,
        run_id: impl Into<String>,
        loader: impl Into<String>,
    ) -> Self {
        Self {
            manager,
            run_id: run_id.into(),
            loader: loader.into(),
        }
    }
}

impl std::fmt::Debug for CheckpointScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointScope")
            .field("run_id", &self.run_id)
            .field("loader", &self.loader)
            .finish()
    }
}

/// Offset a loader should start from.
///
/// A stored checkpoint is authoritative. An explicitly requested skip count
/// must agree with it; without a checkpoint the request is used as is.
pub fn reconcile_skip_count(
    loader: &str,
    stored: Option<u64>,
    requested: Option<u64>,
) -> Result<u64> {
    match (stored, requested) {
        (Some(stored), Some(requested)) if stored != requested => {
            Err(IngestError::invalid_resume(format!(
                "--skip-count {requested} for '{loader}' does not match the stored checkpoint offset {stored}"
            )))
        }
        (Some(stored), _) => Ok(stored),
        (None, Some(requested)) => Ok(requested),
        (None, None) => Ok(0),
    }
}

/// Result of a checkpointed execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub tally: ExecutionTally,
    pub total_items: u64,
    pub start_offset: u64,
    /// Offset recorded by the final checkpoint
    pub final_offset: u64,
    pub cancelled: bool,
}

/// Controller plus periodic checkpoint persistence
#[derive(Debug, Clone)]
pub struct CheckpointedExecution {
    controller: ThreadedExecutionController,
    interval: u64,
    scope: Option<CheckpointScope>,
}

impl CheckpointedExecution {
    pub fn new(
        controller: ThreadedExecutionController,
        interval: u64,
        scope: Option<CheckpointScope>,
    ) -> Self {
        Self {
            controller,
            interval: interval.max(1),
            scope,
        }
    }

    /// Build from a loader config: `max_workers` workers, checkpoint every
    /// `checkpoint_interval` items
    pub fn for_config(config: &LoaderConfig, scope: Option<CheckpointScope>) -> Self {
        Self::new(
            ThreadedExecutionController::new(config.max_workers, config.checkpoint_interval),
            config.checkpoint_interval,
            scope,
        )
    }

    /// Process `items` starting at `config.skip_count`.
    pub async fn execute(
        &self,
        items: Vec<Item>,
        config: &LoaderConfig,
        processor: Arc<dyn ItemProcessor>,
        writer: Arc<dyn GraphWriter>,
        cancel: &CancellationToken,
    ) -> ExecutionReport {
        let total_items = items.len() as u64;
        let start = config.skip_count.min(total_items);
        if config.skip_count > total_items {
            warn!(
                skip_count = config.skip_count,
                total_items, "Skip count is past the end of the item sequence"
            );
        }
        if start > 0 {
            info!(start, total_items, "Resuming past already processed items");
        }

        let mut writer_observer = CheckpointWriter::new(self.scope.clone(), start, self.interval).await;

        let outcome = self
            .controller
            .execute(
                Arc::new(items),
                start,
                processor,
                writer,
                &mut writer_observer,
                cancel,
            )
            .await;

        writer_observer
            .flush(outcome.watermark, outcome.processed_below_watermark)
            .await;

        let mut tally = outcome.tally;
        tally.warnings.extend(writer_observer.warnings);

        ExecutionReport {
            tally,
            total_items,
            start_offset: start,
            final_offset: outcome.watermark,
            cancelled: outcome.cancelled,
        }
    }
}

struct CheckpointWriter {
    scope: Option<CheckpointScope>,
    start: u64,
    interval: u64,
    /// processed_count carried over from earlier passes of this run
    prior_processed: u64,
    last_saved: Option<u64>,
    warnings: Vec<String>,
}

impl CheckpointWriter {
    async fn new(scope: Option<CheckpointScope>, start: u64, interval: u64) -> Self {
        let mut prior_processed = 0;
        let mut warnings = Vec::new();
        if let Some(scope) = &scope {
            match scope.manager.load_record(&scope.run_id, &scope.loader).await {
                Ok(Some(record)) => prior_processed = record.processed_count,
                Ok(None) => {}
                Err(e) => {
                    warn!(loader = %scope.loader, error = %e, "Could not read previous checkpoint");
                    warnings.push(format!("could not read previous checkpoint: {e}"));
                }
            }
        }
        Self {
            scope,
            start,
            interval,
            prior_processed,
            last_saved: None,
            warnings,
        }
    }

    async fn save(&mut self, offset: u64, processed: u64) {
        let Some(scope) = &self.scope else {
            return;
        };
        let processed_count = self.prior_processed + processed;
        match scope
            .manager
            .save_checkpoint(&scope.run_id, &scope.loader, offset, processed_count)
            .await
        {
            Ok(_) => {
                self.last_saved = Some(offset);
                debug!(run_id = %scope.run_id, loader = %scope.loader, offset, "Checkpoint written");
            }
            Err(e) => {
                warn!(run_id = %scope.run_id, loader = %scope.loader, offset, error = %e, "Checkpoint save failed");
                self.warnings
                    .push(format!("checkpoint at offset {offset} not saved: {e}"));
            }
        }
    }

    /// Final save unless the last periodic save already covers it
    async fn flush(&mut self, offset: u64, processed: u64) {
        if self.last_saved != Some(offset) {
            self.save(offset, processed).await;
        }
    }
}

#[async_trait]
impl ProgressObserver for CheckpointWriter {
    async fn advanced(&mut self, watermark: u64, processed: u64) {
        let last_boundary = self
            .last_saved
            .unwrap_or(self.start)
            .saturating_sub(self.start)
            / self.interval;
        let boundary = watermark.saturating_sub(self.start) / self.interval;
        if boundary > last_boundary {
            self.save(watermark, processed).await;
        }
    }
}
