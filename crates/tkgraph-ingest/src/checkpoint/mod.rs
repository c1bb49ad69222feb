//! Durable run and checkpoint tracking
//!
//! A run moves through `CREATED -> RUNNING -> {COMPLETED, FAILED,
//! INTERRUPTED}`. Each loader in a run owns one [`CheckpointRecord`] whose
//! offset only moves forward. Writes for the same `(run_id, loader)` key are
//! serialized by the manager; reads go straight to the store.

#[cfg(feature = "database")]
mod postgres;
mod store;

#[cfg(feature = "database")]
pub use postgres::PgCheckpointStore;
pub use store::{FileCheckpointStore, MemoryCheckpointStore};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{IngestError, Result};

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RunStatus::Created => "CREATED",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Interrupted => "INTERRUPTED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CREATED" => Ok(RunStatus::Created),
            "RUNNING" => Ok(RunStatus::Running),
            "COMPLETED" => Ok(RunStatus::Completed),
            "FAILED" => Ok(RunStatus::Failed),
            "INTERRUPTED" => Ok(RunStatus::Interrupted),
            other => Err(IngestError::store(format!("unknown run status '{other}'"))),
        }
    }
}

/// Progress state of one loader within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoaderStatus {
    InProgress,
    Completed,
    Failed,
}

impl LoaderStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LoaderStatus::InProgress => "IN_PROGRESS",
            LoaderStatus::Completed => "COMPLETED",
            LoaderStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for LoaderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoaderStatus {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IN_PROGRESS" => Ok(LoaderStatus::InProgress),
            "COMPLETED" => Ok(LoaderStatus::Completed),
            "FAILED" => Ok(LoaderStatus::Failed),
            other => Err(IngestError::store(format!("unknown loader status '{other}'"))),
        }
    }
}

/// One pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub description: Option<String>,
    /// Snapshot of the settings the run was started with
    #[serde(default)]
    pub config: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Progress marker for `(run_id, loader_name)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: String,
    pub loader_name: String,
    /// Items of the loader's ordered sequence that are done
    pub offset: u64,
    pub processed_count: u64,
    pub status: LoaderStatus,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// A run with all of its checkpoint records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: RunRecord,
    pub checkpoints: Vec<CheckpointRecord>,
}

/// Persistence backend for runs and checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>>;
    async fn save_run(&self, run: &RunRecord) -> Result<()>;
    async fn list_runs(&self) -> Result<Vec<RunRecord>>;
    async fn load_checkpoint(&self, run_id: &str, loader: &str) -> Result<Option<CheckpointRecord>>;
    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()>;
    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointRecord>>;
    /// Remove the run and its checkpoints; false if it did not exist
    async fn delete_run(&self, run_id: &str) -> Result<bool>;
    /// Human-readable location for logs
    fn describe(&self) -> String;
}

type LockKey = (String, Option<String>);

/// Run lifecycle and checkpoint operations over a [`CheckpointStore`]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    locks: Mutex<HashMap<LockKey, Arc<Mutex<()>>>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Manager over a fresh in-memory store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCheckpointStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// `run_YYYYMMDD_HHMMSS_xxxxxxxx`
    pub fn generate_run_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "run_{}_{}",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &suffix[..8]
        )
    }

    async fn key_lock(&self, run_id: &str, loader: Option<&str>) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((run_id.to_string(), loader.map(str::to_string)))
            .or_default()
            .clone()
    }

    /// Drop the write locks of a deleted run
    async fn forget_locks(&self, run_id: &str) {
        self.locks.lock().await.retain(|(id, _), _| id != run_id);
    }

    /// Create the run if absent, otherwise return the stored record unchanged
    pub async fn start_run(
        &self,
        run_id: &str,
        description: Option<String>,
        config: serde_json::Value,
    ) -> Result<RunRecord> {
        let lock = self.key_lock(run_id, None).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.store.load_run(run_id).await? {
            debug!(run_id, status = %existing.status, "Run already exists");
            return Ok(existing);
        }

        let now = Utc::now();
        let run = RunRecord {
            run_id: run_id.to_string(),
            status: RunStatus::Created,
            description,
            config,
            started_at: now,
            updated_at: now,
            ended_at: None,
        };
        self.store.save_run(&run).await?;
        info!(run_id, store = %self.store.describe(), "Created run");
        Ok(run)
    }

    /// CREATED -> RUNNING
    pub async fn begin_run(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(run_id, RunStatus::Running, |from| {
            from == RunStatus::Created
        })
        .await
    }

    /// Move an existing run back to RUNNING for another pass.
    ///
    /// INTERRUPTED and CREATED runs resume directly. A RUNNING run was left
    /// behind by a process that died without marking it, and is taken over.
    /// FAILED and COMPLETED runs need `force`.
    pub async fn resume_run(&self, run_id: &str, force: bool) -> Result<RunRecord> {
        let lock = self.key_lock(run_id, None).await;
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| IngestError::RunNotFound(run_id.to_string()))?;

        match run.status {
            RunStatus::Interrupted | RunStatus::Created => {}
            RunStatus::Running => {
                warn!(run_id, "Run is still marked RUNNING; assuming the previous process died");
            }
            status if force => {
                warn!(run_id, %status, "Forcing resume of terminal run");
            }
            status => {
                return Err(IngestError::NotResumable {
                    run_id: run_id.to_string(),
                    status,
                })
            }
        }

        run.status = RunStatus::Running;
        run.updated_at = Utc::now();
        run.ended_at = None;
        self.store.save_run(&run).await?;
        info!(run_id, "Resuming run");
        Ok(run)
    }

    /// RUNNING -> COMPLETED; later resumes are rejected unless forced
    pub async fn mark_complete(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(run_id, RunStatus::Completed, |from| {
            from == RunStatus::Running
        })
        .await
    }

    /// RUNNING -> FAILED
    pub async fn mark_failed(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(run_id, RunStatus::Failed, |from| from == RunStatus::Running)
            .await
    }

    /// RUNNING -> INTERRUPTED
    pub async fn mark_interrupted(&self, run_id: &str) -> Result<RunRecord> {
        self.transition(run_id, RunStatus::Interrupted, |from| {
            from == RunStatus::Running
        })
        .await
    }

    async fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        allowed: impl Fn(RunStatus) -> bool,
    ) -> Result<RunRecord> {
        let lock = self.key_lock(run_id, None).await;
        let _guard = lock.lock().await;

        let mut run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| IngestError::RunNotFound(run_id.to_string()))?;

        if !allowed(run.status) {
            return Err(IngestError::InvalidTransition {
                run_id: run_id.to_string(),
                from: run.status,
                to,
            });
        }

        let now = Utc::now();
        run.status = to;
        run.updated_at = now;
        if matches!(
            to,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Interrupted
        ) {
            run.ended_at = Some(now);
        }
        self.store.save_run(&run).await?;
        info!(run_id, status = %to, "Run status changed");
        Ok(run)
    }

    /// Persist progress for one loader. The offset may not decrease.
    pub async fn save_checkpoint(
        &self,
        run_id: &str,
        loader: &str,
        offset: u64,
        processed_count: u64,
    ) -> Result<CheckpointRecord> {
        self.update_record(run_id, loader, |record| {
            if offset < record.offset {
                return Err(IngestError::OffsetRegression {
                    run_id: run_id.to_string(),
                    loader: loader.to_string(),
                    stored: record.offset,
                    attempted: offset,
                });
            }
            record.offset = offset;
            record.processed_count = processed_count;
            record.status = LoaderStatus::InProgress;
            Ok(())
        })
        .await
    }

    /// Stored offset for the loader, if it ever checkpointed in this run
    pub async fn load_checkpoint(&self, run_id: &str, loader: &str) -> Result<Option<u64>> {
        Ok(self
            .store
            .load_checkpoint(run_id, loader)
            .await?
            .map(|record| record.offset))
    }

    pub async fn load_record(&self, run_id: &str, loader: &str) -> Result<Option<CheckpointRecord>> {
        self.store.load_checkpoint(run_id, loader).await
    }

    pub async fn complete_loader(&self, run_id: &str, loader: &str) -> Result<CheckpointRecord> {
        self.update_record(run_id, loader, |record| {
            record.status = LoaderStatus::Completed;
            record.last_error = None;
            Ok(())
        })
        .await
    }

    pub async fn fail_loader(
        &self,
        run_id: &str,
        loader: &str,
        error: &str,
    ) -> Result<CheckpointRecord> {
        self.update_record(run_id, loader, |record| {
            record.status = LoaderStatus::Failed;
            record.last_error = Some(error.to_string());
            Ok(())
        })
        .await
    }

    async fn update_record(
        &self,
        run_id: &str,
        loader: &str,
        apply: impl FnOnce(&mut CheckpointRecord) -> Result<()>,
    ) -> Result<CheckpointRecord> {
        let lock = self.key_lock(run_id, Some(loader)).await;
        let _guard = lock.lock().await;

        if self.store.load_run(run_id).await?.is_none() {
            return Err(IngestError::RunNotFound(run_id.to_string()));
        }

        let mut record = match self.store.load_checkpoint(run_id, loader).await? {
            Some(record) => record,
            None => CheckpointRecord {
                run_id: run_id.to_string(),
                loader_name: loader.to_string(),
                offset: 0,
                processed_count: 0,
                status: LoaderStatus::InProgress,
                last_error: None,
                updated_at: Utc::now(),
            },
        };

        apply(&mut record)?;
        record.updated_at = Utc::now();
        self.store.save_checkpoint(&record).await?;
        debug!(
            run_id,
            loader,
            offset = record.offset,
            processed = record.processed_count,
            status = %record.status,
            "Checkpoint saved"
        );
        Ok(record)
    }

    /// Runs, newest first
    pub async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs = self.store.list_runs().await?;
        runs.sort_by(|a, b| {
            b.started_at
                .cmp(&a.started_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        Ok(runs)
    }

    pub async fn run_summary(&self, run_id: &str) -> Result<RunSummary> {
        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| IngestError::RunNotFound(run_id.to_string()))?;
        let mut checkpoints = self.store.list_checkpoints(run_id).await?;
        checkpoints.sort_by(|a, b| a.loader_name.cmp(&b.loader_name));
        Ok(RunSummary { run, checkpoints })
    }

    /// Delete every run except the newest `keep`; RUNNING runs are never
    /// deleted. Returns the deleted run ids.
    pub async fn cleanup_old_runs(&self, keep: usize) -> Result<Vec<String>> {
        let mut deleted = Vec::new();
        for run in self.list_runs().await?.into_iter().skip(keep) {
            if run.status == RunStatus::Running {
                debug!(run_id = %run.run_id, "Keeping running run");
                continue;
            }
            if self.store.delete_run(&run.run_id).await? {
                self.forget_locks(&run.run_id).await;
                deleted.push(run.run_id);
            }
        }
        info!(deleted = deleted.len(), keep, "Cleaned up old runs");
        Ok(deleted)
    }

    /// Delete a run that is not RUNNING
    pub async fn delete_run(&self, run_id: &str) -> Result<()> {
        let lock = self.key_lock(run_id, None).await;
        let _guard = lock.lock().await;

        let run = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| IngestError::RunNotFound(run_id.to_string()))?;
        if run.status == RunStatus::Running {
            return Err(IngestError::config(format!(
                "run '{run_id}' is RUNNING; interrupt it before deleting"
            )));
        }
        self.store.delete_run(run_id).await?;
        self.forget_locks(run_id).await;
        info!(run_id, "Deleted run");
        Ok(())
    }
}
