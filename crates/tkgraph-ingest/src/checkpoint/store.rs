//! In-memory and JSON-file checkpoint stores

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::warn;

use super::{CheckpointRecord, CheckpointStore, RunRecord};
use crate::error::{IngestError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    runs: BTreeMap<String, RunRecord>,
    checkpoints: BTreeMap<(String, String), CheckpointRecord>,
}

/// Process-local store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    state: Mutex<MemoryState>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        Ok(self.state.lock().await.runs.get(run_id).cloned())
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.state
            .lock()
            .await
            .runs
            .insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.state.lock().await.runs.values().cloned().collect())
    }

    async fn load_checkpoint(&self, run_id: &str, loader: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .get(&(run_id.to_string(), loader.to_string()))
            .cloned())
    }

    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        self.state.lock().await.checkpoints.insert(
            (record.run_id.clone(), record.loader_name.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .checkpoints
            .values()
            .filter(|record| record.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.checkpoints.retain(|(run, _), _| run != run_id);
        Ok(state.runs.remove(run_id).is_some())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

/// JSON files under a directory, one subdirectory per run:
///
/// ```text
/// checkpoints/
///   run_20250101_120000_1a2b3c4d/
///     run.json
///     loaders/zaken.json
/// ```
///
/// Every write goes to a temporary file that is renamed over the target, so
/// a crash never leaves a half-written record.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

const RUN_FILE: &str = "run.json";
const LOADER_DIR: &str = "loaders";

impl FileCheckpointStore {
    /// Create the store, creating `root` if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_dir(&self, run_id: &str) -> Result<PathBuf> {
        check_segment("run id", run_id)?;
        Ok(self.root.join(run_id))
    }

    fn checkpoint_path(&self, run_id: &str, loader: &str) -> Result<PathBuf> {
        check_segment("loader name", loader)?;
        Ok(self
            .run_dir(run_id)?
            .join(LOADER_DIR)
            .join(format!("{loader}.json")))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        read_json(&self.run_dir(run_id)?.join(RUN_FILE)).await
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        write_json_atomic(&self.run_dir(&run.run_id)?.join(RUN_FILE), run).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path().join(RUN_FILE);
            match read_json::<RunRecord>(&path).await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run file"),
            }
        }
        Ok(runs)
    }

    async fn load_checkpoint(&self, run_id: &str, loader: &str) -> Result<Option<CheckpointRecord>> {
        read_json(&self.checkpoint_path(run_id, loader)?).await
    }

    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        write_json_atomic(
            &self.checkpoint_path(&record.run_id, &record.loader_name)?,
            record,
        )
        .await
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointRecord>> {
        let dir = self.run_dir(run_id)?.join(LOADER_DIR);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = read_json(&path).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        match tokio::fs::remove_dir_all(self.run_dir(run_id)?).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}

/// Run ids and loader names become path segments
fn check_segment(kind: &str, segment: &str) -> Result<()> {
    let valid = !segment.is_empty()
        && !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(IngestError::config(format!(
            "{kind} '{segment}' may only contain letters, digits, '_', '-' and '.'"
        )))
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| IngestError::store(format!("{} has no parent directory", path.display())))?;
    tokio::fs::create_dir_all(parent).await?;

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = parent.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    tokio::fs::write(&tmp, &bytes).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
