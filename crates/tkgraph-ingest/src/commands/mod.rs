//! CLI command implementations
//!
//! Commands build their collaborators from [`IngestSettings`], do their work
//! through the library API and render results to stdout. Diagnostics go
//! through `tracing`.

pub mod ingest;
pub mod runs;

use std::path::Path;
use std::sync::Arc;

use colored::{ColoredString, Colorize};
use tracing::info;

use crate::checkpoint::{CheckpointManager, FileCheckpointStore, LoaderStatus, RunStatus};
use crate::config::IngestSettings;
use crate::error::{IngestError, Result};
use crate::graph::{CypherHttpWriter, GraphWriter, MemoryGraph};
use crate::source::{DataSource, MemorySource, ODataSource};

/// Checkpoint manager over the configured store: Postgres when
/// `DATABASE_URL` is set (feature `database`), JSON files otherwise
pub async fn checkpoint_manager(settings: &IngestSettings) -> Result<Arc<CheckpointManager>> {
    #[cfg(feature = "database")]
    if let Some(url) = &settings.database_url {
        let store = crate::checkpoint::PgCheckpointStore::connect(url).await?;
        info!("Using Postgres checkpoint store");
        return Ok(Arc::new(CheckpointManager::new(Arc::new(store))));
    }

    let store = FileCheckpointStore::open(&settings.checkpoint_dir).await?;
    info!(dir = %settings.checkpoint_dir.display(), "Using file checkpoint store");
    Ok(Arc::new(CheckpointManager::new(Arc::new(store))))
}

/// Remote API, or a fixture file when one is given
pub async fn data_source(
    settings: &IngestSettings,
    fixture: Option<&Path>,
) -> Result<Arc<dyn DataSource>> {
    if let Some(path) = fixture {
        info!(fixture = %path.display(), "Reading entities from fixture");
        return Ok(Arc::new(MemorySource::from_fixture(path).await?));
    }
    let client = settings
        .retry
        .http_client()
        .map_err(|e| IngestError::config(format!("failed to build HTTP client: {e}")))?;
    Ok(Arc::new(ODataSource::new(client, settings.api_base_url.clone())))
}

/// Neo4j writer, or an in-memory graph for dry runs
pub fn graph_writer(settings: &IngestSettings, dry_run: bool) -> Result<Arc<dyn GraphWriter>> {
    if dry_run {
        info!("Dry run: writing to an in-memory graph");
        return Ok(Arc::new(MemoryGraph::new()));
    }
    let client = reqwest::Client::builder()
        .connect_timeout(settings.retry.connect_timeout)
        .timeout(settings.retry.read_timeout)
        .build()
        .map_err(|e| IngestError::config(format!("failed to build HTTP client: {e}")))?;
    Ok(Arc::new(CypherHttpWriter::new(client, settings.neo4j.clone())))
}

fn run_status_label(status: RunStatus) -> ColoredString {
    match status {
        RunStatus::Completed => status.as_str().green(),
        RunStatus::Failed => status.as_str().red(),
        RunStatus::Interrupted => status.as_str().yellow(),
        RunStatus::Running => status.as_str().cyan(),
        RunStatus::Created => status.as_str().normal(),
    }
}

fn loader_status_label(status: LoaderStatus) -> ColoredString {
    match status {
        LoaderStatus::Completed => status.as_str().green(),
        LoaderStatus::Failed => status.as_str().red(),
        LoaderStatus::InProgress => status.as_str().yellow(),
    }
}
