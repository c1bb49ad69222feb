//! Ingestion settings
//!
//! Loaded from the environment (after an optional `.env`), overridden by CLI
//! flags, then validated before any work starts.

use std::path::PathBuf;

use serde_json::json;
use tkgraph_common::env::{env_or, env_string};

use crate::error::{IngestError, Result};
use crate::framework::types::parse_date;
use crate::framework::{LoaderConfig, RetryPolicy};
use crate::graph::Neo4jConfig;
use crate::source::DEFAULT_BASE_URL;

/// Default lower bound for date-filtered entities
pub const DEFAULT_START_DATE: &str = "2024-01-01";

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSettings {
    /// Root of the remote OData API
    pub api_base_url: String,
    pub retry: RetryPolicy,
    pub neo4j: Neo4jConfig,
    /// File checkpoint store location
    pub checkpoint_dir: PathBuf,
    /// Postgres checkpoint store; takes precedence over `checkpoint_dir`
    pub database_url: Option<String>,
    /// Base configuration every loader invocation starts from
    pub loader: LoaderConfig,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_BASE_URL.to_string(),
            retry: RetryPolicy::default(),
            neo4j: Neo4jConfig::default(),
            checkpoint_dir: PathBuf::from("checkpoints"),
            database_url: None,
            loader: LoaderConfig {
                start_date: parse_date(DEFAULT_START_DATE).ok(),
                ..LoaderConfig::default()
            },
        }
    }
}

impl IngestSettings {
    /// Load settings from environment variables
    ///
    /// Environment variables:
    /// - `TKAPI_BASE_URL`, `TKAPI_CONNECT_TIMEOUT`, `TKAPI_READ_TIMEOUT`,
    ///   `TKAPI_MAX_RETRIES`, `TKAPI_BACKOFF_FACTOR`
    /// - `NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD`, `NEO4J_DATABASE`
    /// - `CHECKPOINT_DIR`, `DATABASE_URL`
    /// - `INGEST_BATCH_SIZE`, `INGEST_MAX_WORKERS`, `INGEST_CHECKPOINT_INTERVAL`,
    ///   `INGEST_START_DATE` (`none` disables the date filter)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let start_date = match env_string("INGEST_START_DATE", DEFAULT_START_DATE).as_str() {
            "none" | "NONE" => None,
            raw => Some(parse_date(raw).map_err(|e| IngestError::config(format!("INGEST_START_DATE: {e}")))?),
        };

        let settings = Self {
            api_base_url: env_string("TKAPI_BASE_URL", &defaults.api_base_url),
            retry: RetryPolicy::from_env()?,
            neo4j: Neo4jConfig::from_env(),
            checkpoint_dir: PathBuf::from(env_string(
                "CHECKPOINT_DIR",
                &defaults.checkpoint_dir.to_string_lossy(),
            )),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            loader: LoaderConfig {
                batch_size: env_or("INGEST_BATCH_SIZE", defaults.loader.batch_size)?,
                max_workers: env_or("INGEST_MAX_WORKERS", defaults.loader.max_workers)?,
                checkpoint_interval: env_or(
                    "INGEST_CHECKPOINT_INTERVAL",
                    defaults.loader.checkpoint_interval,
                )?,
                start_date,
                ..defaults.loader
            },
        };

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;

        let problems = self.loader.validate();
        if !problems.is_empty() {
            return Err(IngestError::config(problems.join("; ")));
        }
        if self.api_base_url.trim().is_empty() {
            return Err(IngestError::config("TKAPI_BASE_URL must not be empty"));
        }
        if self.neo4j.uri.trim().is_empty() {
            return Err(IngestError::config("NEO4J_URI must not be empty"));
        }
        if self.database_url.is_some() && !cfg!(feature = "database") {
            return Err(IngestError::config(
                "DATABASE_URL is set but this build lacks the 'database' feature",
            ));
        }
        Ok(())
    }

    /// Settings recorded with a run, without credentials
    pub fn snapshot(&self) -> serde_json::Value {
        json!({
            "api_base_url": self.api_base_url,
            "connect_timeout_secs": self.retry.connect_timeout.as_secs_f64(),
            "read_timeout_secs": self.retry.read_timeout.as_secs_f64(),
            "max_retries": self.retry.max_retries,
            "backoff_factor": self.retry.backoff_factor,
            "neo4j_uri": self.neo4j.uri,
            "neo4j_database": self.neo4j.database,
            "loader": self.loader,
        })
    }
}
