//! Run inspection and housekeeping: `runs`, `show`, `cleanup`, `delete`,
//! `loaders`

use std::sync::Arc;

use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Table};

use super::{checkpoint_manager, loader_status_label, run_status_label};
use crate::config::IngestSettings;
use crate::error::Result;
use crate::loaders::default_registry;
use crate::source::MemorySource;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub async fn list(settings: &IngestSettings) -> Result<()> {
    let manager = checkpoint_manager(settings).await?;
    let runs = manager.list_runs().await?;

    if runs.is_empty() {
        println!("No runs found.");
        println!("Run 'tkgraph-ingest run' to start one.");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Run", "Status", "Started", "Ended", "Description"]);
    for run in &runs {
        table.add_row(vec![
            run.run_id.clone(),
            run.status.to_string(),
            run.started_at.format(TIME_FORMAT).to_string(),
            run.ended_at
                .map(|t| t.format(TIME_FORMAT).to_string())
                .unwrap_or_default(),
            run.description.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub async fn show(settings: &IngestSettings, run_id: &str) -> Result<()> {
    let manager = checkpoint_manager(settings).await?;
    let summary = manager.run_summary(run_id).await?;
    let run = &summary.run;

    println!("{}", "Run:".cyan().bold());
    println!("  Id:          {}", run.run_id);
    println!("  Status:      {}", run_status_label(run.status));
    println!("  Started:     {}", run.started_at.format(TIME_FORMAT));
    if let Some(ended) = run.ended_at {
        println!("  Ended:       {}", ended.format(TIME_FORMAT));
    }
    if let Some(description) = &run.description {
        println!("  Description: {description}");
    }
    println!();

    if summary.checkpoints.is_empty() {
        println!("No checkpoints recorded.");
        return Ok(());
    }

    println!("{}", "Checkpoints:".cyan().bold());
    for checkpoint in &summary.checkpoints {
        println!(
            "  {:<20} {:<12} offset {:>7}  processed {:>7}  {}",
            checkpoint.loader_name,
            loader_status_label(checkpoint.status),
            checkpoint.offset,
            checkpoint.processed_count,
            checkpoint.updated_at.format(TIME_FORMAT)
        );
        if let Some(error) = &checkpoint.last_error {
            println!("  {:<20} {}", "", error.red());
        }
    }
    Ok(())
}

pub async fn cleanup(settings: &IngestSettings, keep: usize) -> Result<()> {
    let manager = checkpoint_manager(settings).await?;
    let deleted = manager.cleanup_old_runs(keep).await?;
    if deleted.is_empty() {
        println!("Nothing to clean up.");
    } else {
        for run_id in &deleted {
            println!("  {} {}", "deleted".yellow(), run_id);
        }
        println!("Deleted {} run(s), kept the newest {keep}.", deleted.len());
    }
    Ok(())
}

pub async fn delete(settings: &IngestSettings, run_id: &str) -> Result<()> {
    let manager = checkpoint_manager(settings).await?;
    manager.delete_run(run_id).await?;
    println!("Deleted run {}", run_id.bold());
    Ok(())
}

pub fn loaders(settings: &IngestSettings) -> Result<()> {
    let registry = default_registry(Arc::new(MemorySource::new()), settings.retry.clone())?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec!["Loader", "Description", "Depends on", "Capabilities"]);
    for loader in registry.list() {
        table.add_row(vec![
            loader.name().to_string(),
            loader.description().to_string(),
            loader.dependencies().join(", "),
            loader
                .capabilities()
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        ]);
    }
    println!("{table}");
    Ok(())
}
