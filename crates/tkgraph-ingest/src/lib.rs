//! TKGraph Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads the parliamentary open-data API into a property graph, one entity
//! type per loader, with resumable runs.
//!
//! # Overview
//!
//! - **Framework** ([`framework`]): loader contract, registry, worker pool,
//!   checkpointed execution and retry policy
//! - **Checkpoints** ([`checkpoint`]): run lifecycle and per-loader offsets
//!   in memory, JSON files or Postgres
//! - **Sources** ([`source`]): paginated OData client and an in-memory source
//! - **Graph** ([`graph`]): idempotent upserts over Neo4j HTTP or in memory
//! - **Loaders** ([`loaders`]): generic entity loader and the entity catalog
//! - **Orchestrator** ([`orchestrator`]): sequences loaders for a run
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tkgraph_ingest::checkpoint::CheckpointManager;
//! use tkgraph_ingest::graph::MemoryGraph;
//! use tkgraph_ingest::loaders::default_registry;
//! use tkgraph_ingest::orchestrator::{Orchestrator, RunRequest};
//! use tkgraph_ingest::source::MemorySource;
//! use tkgraph_ingest::{IngestSettings, RetryPolicy};
//!
//! # async fn example() -> tkgraph_ingest::Result<()> {
//! let settings = IngestSettings::default();
//! let registry = default_registry(Arc::new(MemorySource::new()), RetryPolicy::default())?;
//! let orchestrator = Orchestrator::new(
//!     Arc::new(registry),
//!     Arc::new(CheckpointManager::in_memory()),
//!     Arc::new(MemoryGraph::new()),
//!     settings.loader.clone(),
//! );
//! let report = orchestrator.run(RunRequest::fresh()).await?;
//! std::process::exit(report.exit_code());
//! # }
//! ```

pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod error;
pub mod framework;
pub mod graph;
pub mod loaders;
pub mod orchestrator;
pub mod source;

// Re-export commonly used types
pub use config::IngestSettings;
pub use error::{IngestError, Result};
pub use framework::{Loader, LoaderConfig, LoaderRegistry, LoaderResult, RetryPolicy};

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// TKGraph ingester - parliamentary open data into a property graph
#[derive(Parser, Debug)]
#[command(name = "tkgraph-ingest")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a new run
    Run {
        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// Free-form note stored with the run
        #[arg(short, long)]
        description: Option<String>,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// Continue an interrupted or failed run
    Resume {
        /// Run to continue
        run_id: String,

        /// Resume a FAILED or COMPLETED run
        #[arg(short, long)]
        force: bool,

        #[command(flatten)]
        load: LoadArgs,
    },

    /// List runs, newest first
    Runs,

    /// Show a run and its per-loader checkpoints
    Show {
        /// Run to show
        run_id: String,
    },

    /// Delete all but the newest runs
    Cleanup {
        /// Number of runs to keep
        #[arg(long, default_value_t = 10)]
        keep: usize,
    },

    /// Delete one run and its checkpoints
    Delete {
        /// Run to delete
        run_id: String,
    },

    /// List registered loaders in dependency order
    Loaders,
}

/// Loader selection and per-invocation overrides shared by `run` and `resume`
#[derive(Args, Debug, Clone, Default)]
pub struct LoadArgs {
    /// Run only these loaders
    #[arg(long, value_delimiter = ',')]
    pub only: Vec<String>,

    /// Leave these loaders out
    #[arg(long, value_delimiter = ',')]
    pub skip: Vec<String>,

    /// Start offset for a loader, as `loader=N`; must match its checkpoint on resume
    #[arg(long = "skip-count", value_parser = parse_skip_count)]
    pub skip_counts: Vec<(String, u64)>,

    /// Worker tasks per loader
    #[arg(long)]
    pub workers: Option<usize>,

    /// Page size requested from the API
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Items between checkpoints
    #[arg(long)]
    pub checkpoint_interval: Option<u64>,

    /// Lower date bound (YYYY-MM-DD)
    #[arg(long, value_parser = framework::types::parse_date)]
    pub start_date: Option<chrono::NaiveDate>,

    /// Upper date bound, exclusive (YYYY-MM-DD)
    #[arg(long, value_parser = framework::types::parse_date)]
    pub end_date: Option<chrono::NaiveDate>,

    /// Stop fetching after this many items per loader
    #[arg(long)]
    pub max_items: Option<usize>,

    /// Rewrite nodes that already exist instead of skipping them
    #[arg(long)]
    pub overwrite: bool,

    /// Write to an in-memory graph instead of Neo4j
    #[arg(long)]
    pub dry_run: bool,

    /// Read entities from a JSON fixture instead of the remote API
    #[arg(long)]
    pub fixture: Option<PathBuf>,
}

fn parse_skip_count(raw: &str) -> std::result::Result<(String, u64), String> {
    let (loader, count) = raw
        .split_once('=')
        .ok_or_else(|| format!("'{raw}' is not in loader=N form"))?;
    let count = count
        .trim()
        .parse()
        .map_err(|_| format!("'{count}' is not a non-negative integer"))?;
    Ok((loader.trim().to_string(), count))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_skip_count() {
        assert_eq!(parse_skip_count("zaken=25").unwrap(), ("zaken".to_string(), 25));
        assert!(parse_skip_count("zaken").is_err());
        assert!(parse_skip_count("zaken=-1").is_err());
    }

    #[test]
    fn test_resume_arguments() {
        let cli = Cli::try_parse_from([
            "tkgraph-ingest",
            "resume",
            "run_1",
            "--force",
            "--only",
            "zaken,documenten",
            "--skip-count",
            "zaken=50",
        ])
        .unwrap();
        match cli.command {
            Commands::Resume { run_id, force, load } => {
                assert_eq!(run_id, "run_1");
                assert!(force);
                assert_eq!(load.only, vec!["zaken", "documenten"]);
                assert_eq!(load.skip_counts, vec![("zaken".to_string(), 50)]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
