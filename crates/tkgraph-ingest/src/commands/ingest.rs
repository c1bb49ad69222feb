//! `tkgraph-ingest run` and `tkgraph-ingest resume`

use std::sync::Arc;

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};
use tokio_util::sync::CancellationToken;

use super::{checkpoint_manager, data_source, graph_writer, run_status_label};
use crate::config::IngestSettings;
use crate::error::Result;
use crate::loaders::default_registry;
use crate::orchestrator::{Orchestrator, RunMode, RunReport, RunRequest};
use crate::LoadArgs;

/// Apply CLI overrides on top of environment settings
pub fn apply_overrides(settings: &mut IngestSettings, load: &LoadArgs) {
    let loader = &mut settings.loader;
    if let Some(workers) = load.workers {
        loader.max_workers = workers;
    }
    if let Some(batch_size) = load.batch_size {
        loader.batch_size = batch_size;
    }
    if let Some(interval) = load.checkpoint_interval {
        loader.checkpoint_interval = interval;
    }
    if load.start_date.is_some() {
        loader.start_date = load.start_date;
    }
    if load.end_date.is_some() {
        loader.end_date = load.end_date;
    }
    if load.max_items.is_some() {
        loader.max_items = load.max_items;
    }
    if load.overwrite {
        loader.overwrite = true;
    }
}

pub fn build_request(mode: RunMode, description: Option<String>, load: &LoadArgs) -> RunRequest {
    RunRequest {
        mode,
        description,
        only: load.only.clone(),
        skip: load.skip.clone(),
        skip_counts: load.skip_counts.iter().cloned().collect(),
    }
}

/// Run or resume, print the report and return it for the exit code
pub async fn run(
    mut settings: IngestSettings,
    mode: RunMode,
    description: Option<String>,
    load: &LoadArgs,
    cancel: CancellationToken,
) -> Result<RunReport> {
    apply_overrides(&mut settings, load);
    settings.validate()?;

    let manager = checkpoint_manager(&settings).await?;
    let source = data_source(&settings, load.fixture.as_deref()).await?;
    let writer = graph_writer(&settings, load.dry_run)?;
    let registry = default_registry(source, settings.retry.clone())?;

    let orchestrator = Orchestrator::new(
        Arc::new(registry),
        manager,
        writer,
        settings.loader.clone(),
    )
    .with_config_snapshot(settings.snapshot())
    .with_cancel(cancel);

    let report = orchestrator
        .run(build_request(mode, description, load))
        .await?;
    print_report(&report);
    Ok(report)
}

fn print_report(report: &RunReport) {
    println!();
    println!(
        "{} {} {}",
        "Run".cyan().bold(),
        report.run_id.bold(),
        run_status_label(report.status)
    );

    if !report.results.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                "Loader", "Result", "Processed", "Failed", "Skipped", "Total", "Start", "Seconds",
            ]);
        for (name, result) in &report.results {
            table.add_row(vec![
                name.clone(),
                if result.success { "ok" } else { "aborted" }.to_string(),
                result.processed_count.to_string(),
                result.failed_count.to_string(),
                result.skipped_count.to_string(),
                result.total_items.to_string(),
                result.start_offset.to_string(),
                format!("{:.1}", result.execution_time_seconds),
            ]);
        }
        println!("{table}");
    }

    if !report.already_completed.is_empty() {
        println!(
            "Already completed: {}",
            report.already_completed.join(", ").dimmed()
        );
    }

    for (name, result) in &report.results {
        for message in result.error_messages.iter().take(5) {
            println!("  {} {}: {}", "error".red(), name, message);
        }
        if result.error_messages.len() > 5 {
            println!(
                "  {} {}: {} more errors",
                "error".red(),
                name,
                result.error_messages.len() - 5
            );
        }
    }

    match report.exit_code() {
        0 => {}
        crate::orchestrator::EXIT_INTERRUPTED => println!(
            "\nInterrupted. Continue with: tkgraph-ingest resume {}",
            report.run_id
        ),
        _ => println!(
            "\nSome loaders failed. Retry them with: tkgraph-ingest resume {} --force",
            report.run_id
        ),
    }
}
