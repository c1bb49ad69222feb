//! Postgres checkpoint store (feature `database`)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{CheckpointRecord, CheckpointStore, RunRecord};
use crate::error::{IngestError, Result};

type RunRow = (
    String,
    String,
    Option<String>,
    serde_json::Value,
    DateTime<Utc>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
);

type CheckpointRow = (String, String, i64, i64, String, Option<String>, DateTime<Utc>);

const RUN_COLUMNS: &str =
    "run_id, status, description, config, started_at, updated_at, ended_at";
const CHECKPOINT_COLUMNS: &str =
    "run_id, loader_name, \"offset\", processed_count, status, last_error, updated_at";

/// Runs and checkpoints in two tables, created on first connect
#[derive(Debug, Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
}

impl PgCheckpointStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_runs (
                run_id      TEXT PRIMARY KEY,
                status      TEXT NOT NULL,
                description TEXT,
                config      JSONB NOT NULL DEFAULT '{}'::jsonb,
                started_at  TIMESTAMPTZ NOT NULL,
                updated_at  TIMESTAMPTZ NOT NULL,
                ended_at    TIMESTAMPTZ
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingest_checkpoints (
                run_id          TEXT NOT NULL REFERENCES ingest_runs(run_id) ON DELETE CASCADE,
                loader_name     TEXT NOT NULL,
                "offset"        BIGINT NOT NULL,
                processed_count BIGINT NOT NULL,
                status          TEXT NOT NULL,
                last_error      TEXT,
                updated_at      TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (run_id, loader_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn run_from_row(row: RunRow) -> Result<RunRecord> {
    let (run_id, status, description, config, started_at, updated_at, ended_at) = row;
    Ok(RunRecord {
        run_id,
        status: status.parse()?,
        description,
        config,
        started_at,
        updated_at,
        ended_at,
    })
}

fn checkpoint_from_row(row: CheckpointRow) -> Result<CheckpointRecord> {
    let (run_id, loader_name, offset, processed_count, status, last_error, updated_at) = row;
    Ok(CheckpointRecord {
        run_id,
        loader_name,
        offset: to_u64(offset)?,
        processed_count: to_u64(processed_count)?,
        status: status.parse()?,
        last_error,
        updated_at,
    })
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| IngestError::store(format!("negative counter {value}")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| IngestError::store(format!("counter {value} out of range")))
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load_run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let row: Option<RunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM ingest_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(run_from_row).transpose()
    }

    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_runs (run_id, status, description, config, started_at, updated_at, ended_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id) DO UPDATE SET
                status = EXCLUDED.status,
                description = EXCLUDED.description,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at,
                ended_at = EXCLUDED.ended_at
            "#,
        )
        .bind(&run.run_id)
        .bind(run.status.as_str())
        .bind(&run.description)
        .bind(&run.config)
        .bind(run.started_at)
        .bind(run.updated_at)
        .bind(run.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let rows: Vec<RunRow> = sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM ingest_runs"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(run_from_row).collect()
    }

    async fn load_checkpoint(&self, run_id: &str, loader: &str) -> Result<Option<CheckpointRecord>> {
        let row: Option<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoints WHERE run_id = $1 AND loader_name = $2"
        ))
        .bind(run_id)
        .bind(loader)
        .fetch_optional(&self.pool)
        .await?;
        row.map(checkpoint_from_row).transpose()
    }

    async fn save_checkpoint(&self, record: &CheckpointRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_checkpoints
                (run_id, loader_name, "offset", processed_count, status, last_error, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (run_id, loader_name) DO UPDATE SET
                "offset" = EXCLUDED."offset",
                processed_count = EXCLUDED.processed_count,
                status = EXCLUDED.status,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.loader_name)
        .bind(to_i64(record.offset)?)
        .bind(to_i64(record.processed_count)?)
        .bind(record.status.as_str())
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_checkpoints(&self, run_id: &str) -> Result<Vec<CheckpointRecord>> {
        let rows: Vec<CheckpointRow> = sqlx::query_as(&format!(
            "SELECT {CHECKPOINT_COLUMNS} FROM ingest_checkpoints WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(checkpoint_from_row).collect()
    }

    async fn delete_run(&self, run_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM ingest_runs WHERE run_id = $1")
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn describe(&self) -> String {
        "postgres".to_string()
    }
}
