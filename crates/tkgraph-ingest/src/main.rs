//! TKGraph ingester - main entry point

use anyhow::Context;
use clap::Parser;
use std::process;
use tkgraph_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use tkgraph_ingest::commands;
use tkgraph_ingest::orchestrator::RunMode;
use tkgraph_ingest::{Cli, Commands, IngestSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[tokio::main]
async fn main() {
    // .env is optional; real environment variables win
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose {
            LogLevel::Debug
        } else {
            LogLevel::Info
        })
        .output(LogOutput::Console)
        .log_file_prefix("tkgraph-ingest")
        .build();

    let _log_guard = match log_config.merge_env().and_then(|config| init_logging(&config)) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    match execute_command(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {e:#}");
            process::exit(1);
        }
    }
}

/// Execute the CLI command, returning the process exit code
async fn execute_command(cli: Cli) -> anyhow::Result<i32> {
    let settings = IngestSettings::from_env().context("Failed to read settings")?;

    match cli.command {
        Commands::Run {
            run_id,
            description,
            load,
        } => {
            let report = commands::ingest::run(
                settings,
                RunMode::Fresh { run_id },
                description,
                &load,
                interrupt_token(),
            )
            .await?;
            Ok(report.exit_code())
        }

        Commands::Resume {
            run_id,
            force,
            load,
        } => {
            let report = commands::ingest::run(
                settings,
                RunMode::Resume { run_id, force },
                None,
                &load,
                interrupt_token(),
            )
            .await?;
            Ok(report.exit_code())
        }

        Commands::Runs => commands::runs::list(&settings).await.map(|_| 0).map_err(Into::into),

        Commands::Show { run_id } => commands::runs::show(&settings, &run_id)
            .await
            .map(|_| 0)
            .map_err(Into::into),

        Commands::Cleanup { keep } => commands::runs::cleanup(&settings, keep)
            .await
            .map(|_| 0)
            .map_err(Into::into),

        Commands::Delete { run_id } => commands::runs::delete(&settings, &run_id)
            .await
            .map(|_| 0)
            .map_err(Into::into),

        Commands::Loaders => commands::runs::loaders(&settings).map(|_| 0).map_err(Into::into),
    }
}

/// Token cancelled on the first Ctrl-C; a second Ctrl-C exits immediately
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; finishing the current checkpoint interval");
            trigger.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Second interrupt; exiting without a final checkpoint");
            process::exit(130);
        }
    });
    token
}
