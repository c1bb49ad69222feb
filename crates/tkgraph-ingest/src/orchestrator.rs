//! Run sequencing
//!
//! The orchestrator picks loaders from the registry in registration order,
//! which is also dependency order. Everything that can be rejected up front
//! (unknown names, bad configuration, resume mismatches, run state) is
//! checked before the first loader starts. After that, loader failures are
//! recorded and the run moves on to the next loader.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointManager, LoaderStatus, RunRecord, RunStatus};
use crate::error::{IngestError, Result};
use crate::framework::{
    reconcile_skip_count, CheckpointScope, LoadContext, Loader, LoaderConfig, LoaderRegistry,
    LoaderResult,
};
use crate::graph::GraphWriter;

/// Exit code for an operator interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

/// Whether to start a new run or continue an existing one
#[derive(Debug, Clone, PartialEq)]
pub enum RunMode {
    /// New run; the id is generated when absent
    Fresh { run_id: Option<String> },
    /// Continue `run_id`; `force` allows FAILED and COMPLETED runs
    Resume { run_id: String, force: bool },
}

/// What the operator asked for
#[derive(Debug, Clone, PartialEq)]
pub struct RunRequest {
    pub mode: RunMode,
    pub description: Option<String>,
    /// Run only these loaders; empty means all
    pub only: Vec<String>,
    /// Leave these loaders out
    pub skip: Vec<String>,
    /// Explicit start offsets per loader
    pub skip_counts: BTreeMap<String, u64>,
}

impl RunRequest {
    pub fn fresh() -> Self {
        Self {
            mode: RunMode::Fresh { run_id: None },
            description: None,
            only: Vec::new(),
            skip: Vec::new(),
            skip_counts: BTreeMap::new(),
        }
    }

    pub fn resume(run_id: impl Into<String>, force: bool) -> Self {
        Self {
            mode: RunMode::Resume {
                run_id: run_id.into(),
                force,
            },
            ..Self::fresh()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        if let RunMode::Fresh { run_id: id } = &mut self.mode {
            *id = Some(run_id.into());
        }
        self
    }

    pub fn with_only(mut self, loader: impl Into<String>) -> Self {
        self.only.push(loader.into());
        self
    }

    pub fn with_skip(mut self, loader: impl Into<String>) -> Self {
        self.skip.push(loader.into());
        self
    }

    pub fn with_skip_count(mut self, loader: impl Into<String>, offset: u64) -> Self {
        self.skip_counts.insert(loader.into(), offset);
        self
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    /// Loaders invoked in this pass, in order
    pub results: Vec<(String, LoaderResult)>,
    /// Loaders passed over because an earlier pass completed them
    pub already_completed: Vec<String>,
}

impl RunReport {
    /// 0 on success, 130 when interrupted, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => 0,
            RunStatus::Interrupted => EXIT_INTERRUPTED,
            _ => 1,
        }
    }

    pub fn failed_loaders(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|(_, result)| !result.success)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// One loader invocation prepared before the run starts
struct PlannedLoader {
    loader: Arc<dyn Loader>,
    config: LoaderConfig,
    completed: bool,
}

pub struct Orchestrator {
    registry: Arc<LoaderRegistry>,
    manager: Arc<CheckpointManager>,
    writer: Arc<dyn GraphWriter>,
    base_config: LoaderConfig,
    config_snapshot: Value,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LoaderRegistry>,
        manager: Arc<CheckpointManager>,
        writer: Arc<dyn GraphWriter>,
        base_config: LoaderConfig,
    ) -> Self {
        Self {
            registry,
            manager,
            writer,
            base_config,
            config_snapshot: Value::Null,
            cancel: CancellationToken::new(),
        }
    }

    /// Extra settings recorded on newly created runs; the base loader
    /// configuration is always recorded under `loader`
    pub fn with_config_snapshot(mut self, snapshot: Value) -> Self {
        self.config_snapshot = snapshot;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Loaders `request` would run, in order
    pub fn select(&self, request: &RunRequest) -> Result<Vec<Arc<dyn Loader>>> {
        for name in request
            .only
            .iter()
            .chain(&request.skip)
            .chain(request.skip_counts.keys())
        {
            self.registry.get(name)?;
        }

        Ok(self
            .registry
            .list()
            .iter()
            .filter(|loader| request.only.is_empty() || request.only.iter().any(|n| n == loader.name()))
            .filter(|loader| !request.skip.iter().any(|n| n == loader.name()))
            .cloned()
            .collect())
    }

    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        let selected = self.select(&request)?;

        let (run_id, resuming, force) = match &request.mode {
            RunMode::Fresh { run_id } => (
                run_id.clone().unwrap_or_else(CheckpointManager::generate_run_id),
                false,
                false,
            ),
            RunMode::Resume { run_id, force } => (run_id.clone(), true, *force),
        };

        let existing = self.manager.store().load_run(&run_id).await?;
        match (&existing, resuming) {
            (Some(run), false) if run.status != RunStatus::Created => {
                return Err(IngestError::RunExists(run_id));
            }
            (None, true) => return Err(IngestError::RunNotFound(run_id)),
            (Some(run), true) => self.check_same_sequence(run)?,
            _ => {}
        }

        let plan = self.plan(&run_id, existing.is_some(), selected, &request).await?;

        if resuming {
            self.manager.resume_run(&run_id, force).await?;
        } else {
            self.manager
                .start_run(&run_id, request.description.clone(), self.run_config())
                .await?;
            self.manager.begin_run(&run_id).await?;
        }

        info!(
            run_id = %run_id,
            loaders = plan.len(),
            resuming,
            "Starting run"
        );

        let mut report = RunReport {
            run_id: run_id.clone(),
            status: RunStatus::Running,
            results: Vec::new(),
            already_completed: Vec::new(),
        };

        for planned in plan {
            let name = planned.loader.name().to_string();
            if planned.completed {
                info!(run_id = %run_id, loader = %name, "Loader already completed; skipping");
                report.already_completed.push(name);
                continue;
            }
            if self.cancel.is_cancelled() {
                break;
            }

            info!(
                run_id = %run_id,
                loader = %name,
                skip_count = planned.config.skip_count,
                max_workers = planned.config.max_workers,
                "Running loader"
            );
            let ctx = LoadContext::new(self.writer.clone())
                .with_checkpoint(CheckpointScope::new(self.manager.clone(), &run_id, &name))
                .with_cancel(self.cancel.clone());
            let result = planned.loader.load(&ctx, &planned.config).await;

            if self.cancel.is_cancelled() {
                report.results.push((name, result));
                break;
            }

            if result.success {
                self.manager.complete_loader(&run_id, &name).await?;
            } else {
                let error = result
                    .error_messages
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "loader aborted".to_string());
                warn!(run_id = %run_id, loader = %name, error = %error, "Loader failed; continuing");
                self.manager.fail_loader(&run_id, &name, &error).await?;
            }
            report.results.push((name, result));
        }

        report.status = if self.cancel.is_cancelled() {
            self.manager.mark_interrupted(&run_id).await?;
            warn!(run_id = %run_id, "Run interrupted; resume with 'tkgraph-ingest resume {run_id}'");
            RunStatus::Interrupted
        } else if report.results.iter().any(|(_, result)| !result.success) {
            self.manager.mark_failed(&run_id).await?;
            RunStatus::Failed
        } else {
            self.manager.mark_complete(&run_id).await?;
            RunStatus::Completed
        };

        info!(run_id = %run_id, status = %report.status, "Run finished");
        Ok(report)
    }

    /// Snapshot stored with a new run
    fn run_config(&self) -> Value {
        let mut snapshot = match &self.config_snapshot {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        snapshot.insert(
            "loader".to_string(),
            serde_json::to_value(&self.base_config).unwrap_or(Value::Null),
        );
        Value::Object(snapshot)
    }

    /// Reject a resume whose settings would fetch a different item sequence
    /// than the one the stored offsets index into
    fn check_same_sequence(&self, run: &RunRecord) -> Result<()> {
        let Some(stored) = run.config.get("loader") else {
            return Ok(());
        };
        let stored: LoaderConfig = match serde_json::from_value(stored.clone()) {
            Ok(stored) => stored,
            Err(e) => {
                warn!(run_id = %run.run_id, error = %e, "Unreadable loader settings on run; not compared");
                return Ok(());
            }
        };

        let changes = self.base_config.sequence_changes(&stored);
        if changes.is_empty() {
            return Ok(());
        }
        Err(IngestError::invalid_resume(format!(
            "run '{}' was started with different settings ({}); resume with the original settings",
            run.run_id,
            changes.join("; ")
        )))
    }

    /// Per-loader configuration, validated before anything is written
    async fn plan(
        &self,
        run_id: &str,
        run_exists: bool,
        selected: Vec<Arc<dyn Loader>>,
        request: &RunRequest,
    ) -> Result<Vec<PlannedLoader>> {
        let mut plan = Vec::with_capacity(selected.len());
        for loader in selected {
            let record = if run_exists {
                self.manager.load_record(run_id, loader.name()).await?
            } else {
                None
            };
            let completed = record
                .as_ref()
                .is_some_and(|r| r.status == LoaderStatus::Completed);

            let skip_count = reconcile_skip_count(
                loader.name(),
                record.as_ref().map(|r| r.offset),
                request.skip_counts.get(loader.name()).copied(),
            )?;
            let config = self.base_config.clone().with_skip_count(skip_count);

            let problems = loader.validate_config(&config);
            if !problems.is_empty() {
                return Err(IngestError::config(format!(
                    "{}: {}",
                    loader.name(),
                    problems.join("; ")
                )));
            }

            plan.push(PlannedLoader {
                loader,
                config,
                completed,
            });
        }
        Ok(plan)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::framework::LoaderCapability;
    use crate::graph::MemoryGraph;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedLoader {
        name: String,
        succeed: bool,
        seen: Mutex<Vec<u64>>,
    }

    impl ScriptedLoader {
        fn new(name: &str, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                succeed,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Loader for ScriptedLoader {
        fn name(&self) -> &str {
            &self.name
        }

        fn description(&self) -> &str {
            "scripted"
        }

        fn capabilities(&self) -> &[LoaderCapability] {
            &[LoaderCapability::Threading, LoaderCapability::SkipFunctionality]
        }

        async fn load(&self, _ctx: &LoadContext, config: &LoaderConfig) -> LoaderResult {
            self.seen.lock().unwrap().push(config.skip_count);
            if self.succeed {
                LoaderResult::from_tally(Default::default(), 0, config.skip_count, 0.0)
            } else {
                LoaderResult::aborted("remote unreachable", config.skip_count, 0.0)
            }
        }
    }

    fn orchestrator(loaders: &[Arc<ScriptedLoader>]) -> (Orchestrator, Arc<CheckpointManager>) {
        let mut registry = LoaderRegistry::new();
        for loader in loaders {
            registry.register(loader.clone()).unwrap();
        }
        let manager = Arc::new(CheckpointManager::in_memory());
        let orchestrator = Orchestrator::new(
            Arc::new(registry),
            manager.clone(),
            Arc::new(MemoryGraph::new()),
            LoaderConfig::default(),
        );
        (orchestrator, manager)
    }

    #[tokio::test]
    async fn test_successful_run_completes() {
        let (orchestrator, manager) = orchestrator(&[ScriptedLoader::new("a", true), ScriptedLoader::new("b", true)]);
        let report = orchestrator
            .run(RunRequest::fresh().with_run_id("r1"))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.results.len(), 2);

        let summary = manager.run_summary("r1").await.unwrap();
        assert!(summary
            .checkpoints
            .iter()
            .all(|c| c.status == LoaderStatus::Completed));
    }

    #[tokio::test]
    async fn test_failed_loader_does_not_stop_the_run() {
        let b = ScriptedLoader::new("b", true);
        let (orchestrator, manager) = orchestrator(&[ScriptedLoader::new("a", false), b.clone()]);
        let report = orchestrator
            .run(RunRequest::fresh().with_run_id("r1"))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.failed_loaders(), vec!["a"]);
        assert_eq!(b.seen.lock().unwrap().len(), 1);

        let record = manager.load_record("r1", "a").await.unwrap().unwrap();
        assert_eq!(record.status, LoaderStatus::Failed);
        assert_eq!(record.last_error.as_deref(), Some("remote unreachable"));
    }

    #[tokio::test]
    async fn test_unknown_only_is_rejected_before_any_work() {
        let a = ScriptedLoader::new("a", true);
        let (orchestrator, manager) = orchestrator(&[a.clone()]);
        let err = orchestrator
            .run(RunRequest::fresh().with_run_id("r1").with_only("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::LoaderNotFound(_)));
        assert!(a.seen.lock().unwrap().is_empty());
        assert!(manager.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_run_with_used_id_is_rejected() {
        let (orchestrator, _) = orchestrator(&[ScriptedLoader::new("a", true)]);
        orchestrator.run(RunRequest::fresh().with_run_id("r1")).await.unwrap();
        let err = orchestrator
            .run(RunRequest::fresh().with_run_id("r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::RunExists(_)));
    }

    #[tokio::test]
    async fn test_resume_uses_stored_offsets_and_skips_completed() {
        let a = ScriptedLoader::new("a", true);
        let b = ScriptedLoader::new("b", true);
        let (orchestrator, manager) = orchestrator(&[a.clone(), b.clone()]);

        manager.start_run("r1", None, Value::Null).await.unwrap();
        manager.begin_run("r1").await.unwrap();
        manager.save_checkpoint("r1", "a", 10, 10).await.unwrap();
        manager.complete_loader("r1", "a").await.unwrap();
        manager.save_checkpoint("r1", "b", 4, 4).await.unwrap();
        manager.mark_interrupted("r1").await.unwrap();

        let report = orchestrator.run(RunRequest::resume("r1", false)).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.already_completed, vec!["a".to_string()]);
        assert!(a.seen.lock().unwrap().is_empty());
        assert_eq!(*b.seen.lock().unwrap(), vec![4]);
    }

    #[tokio::test]
    async fn test_resume_rejects_mismatched_skip_count() {
        let b = ScriptedLoader::new("b", true);
        let (orchestrator, manager) = orchestrator(&[b.clone()]);
        manager.start_run("r1", None, Value::Null).await.unwrap();
        manager.begin_run("r1").await.unwrap();
        manager.save_checkpoint("r1", "b", 4, 4).await.unwrap();
        manager.mark_interrupted("r1").await.unwrap();

        let err = orchestrator
            .run(RunRequest::resume("r1", false).with_skip_count("b", 7))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::InvalidResume(_)));
        assert!(b.seen.lock().unwrap().is_empty());
        let run = manager.store().load_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_interrupted() {
        let (orchestrator, manager) = orchestrator(&[ScriptedLoader::new("a", true)]);
        orchestrator.cancel_token().cancel();
        let report = orchestrator
            .run(RunRequest::fresh().with_run_id("r1"))
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Interrupted);
        assert_eq!(report.exit_code(), EXIT_INTERRUPTED);
        let run = manager.store().load_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Interrupted);
    }
}
