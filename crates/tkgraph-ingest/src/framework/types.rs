//! Core value types shared by loaders, the execution strategies and the
//! orchestrator

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Capabilities a loader declares; used for introspection, never dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoaderCapability {
    Threading,
    BatchProcessing,
    DateFiltering,
    SkipFunctionality,
    IdChecking,
    IncrementalLoading,
    RelationshipProcessing,
}

impl LoaderCapability {
    pub fn as_str(&self) -> &str {
        match self {
            LoaderCapability::Threading => "threading",
            LoaderCapability::BatchProcessing => "batch_processing",
            LoaderCapability::DateFiltering => "date_filtering",
            LoaderCapability::SkipFunctionality => "skip_functionality",
            LoaderCapability::IdChecking => "id_checking",
            LoaderCapability::IncrementalLoading => "incremental_loading",
            LoaderCapability::RelationshipProcessing => "relationship_processing",
        }
    }
}

impl std::fmt::Display for LoaderCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LoaderCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "threading" => Ok(LoaderCapability::Threading),
            "batch_processing" => Ok(LoaderCapability::BatchProcessing),
            "date_filtering" => Ok(LoaderCapability::DateFiltering),
            "skip_functionality" => Ok(LoaderCapability::SkipFunctionality),
            "id_checking" => Ok(LoaderCapability::IdChecking),
            "incremental_loading" => Ok(LoaderCapability::IncrementalLoading),
            "relationship_processing" => Ok(LoaderCapability::RelationshipProcessing),
            other => Err(format!("unknown loader capability '{other}'")),
        }
    }
}

/// Configuration for one loader invocation
///
/// Built by the orchestrator and passed by reference; a loader never mutates
/// the config it was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Page size requested from the remote API
    pub batch_size: usize,
    /// Inclusive lower bound for the loader's date filter
    pub start_date: Option<NaiveDate>,
    /// Exclusive upper bound for the loader's date filter
    pub end_date: Option<NaiveDate>,
    /// Items to pass over before processing; on resume, the stored offset
    pub skip_count: u64,
    pub max_workers: usize,
    /// Items between checkpoint writes
    pub checkpoint_interval: u64,
    /// Stop fetching after this many items
    pub max_items: Option<usize>,
    /// Rewrite items whose node already exists instead of skipping them
    #[serde(default)]
    pub overwrite: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            start_date: None,
            end_date: None,
            skip_count: 0,
            max_workers: 10,
            checkpoint_interval: 25,
            max_items: None,
            overwrite: false,
        }
    }
}

impl LoaderConfig {
    pub fn with_skip_count(mut self, skip_count: u64) -> Self {
        self.skip_count = skip_count;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: u64) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_start_date(mut self, date: NaiveDate) -> Self {
        self.start_date = Some(date);
        self
    }

    /// Settings that decide which items a loader fetches and in what order,
    /// where `self` and `stored` differ.
    ///
    /// A stored offset indexes the sequence these settings produced, so a
    /// resume must not change them.
    pub fn sequence_changes(&self, stored: &LoaderConfig) -> Vec<String> {
        fn describe<T: std::fmt::Debug>(value: &Option<T>) -> String {
            value
                .as_ref()
                .map_or_else(|| "none".to_string(), |v| format!("{v:?}"))
        }

        let mut changes = Vec::new();
        if self.start_date != stored.start_date {
            changes.push(format!(
                "start_date: stored={}, current={}",
                describe(&stored.start_date),
                describe(&self.start_date)
            ));
        }
        if self.end_date != stored.end_date {
            changes.push(format!(
                "end_date: stored={}, current={}",
                describe(&stored.end_date),
                describe(&self.end_date)
            ));
        }
        if self.max_items != stored.max_items {
            changes.push(format!(
                "max_items: stored={}, current={}",
                describe(&stored.max_items),
                describe(&self.max_items)
            ));
        }
        if self.batch_size != stored.batch_size {
            changes.push(format!(
                "batch_size: stored={}, current={}",
                stored.batch_size, self.batch_size
            ));
        }
        changes
    }

    /// Problems with this configuration; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.batch_size == 0 {
            errors.push("batch_size must be positive".to_string());
        }
        if self.max_workers == 0 {
            errors.push("max_workers must be positive".to_string());
        }
        if self.checkpoint_interval == 0 {
            errors.push("checkpoint_interval must be positive".to_string());
        }
        if self.max_items == Some(0) {
            errors.push("max_items must be positive when set".to_string());
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                errors.push(format!("end_date {end} is before start_date {start}"));
            }
        }

        errors
    }
}

/// Parse a `YYYY-MM-DD` date as accepted on the command line and in the
/// environment
pub fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| format!("'{raw}' is not a date in YYYY-MM-DD format"))
}

/// Outcome of processing a single item
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Upserted; may carry non-fatal warnings (e.g. an unresolvable relation)
    Processed { warnings: Vec<String> },
    /// Not written because the item failed validation
    Skipped(String),
    /// Write or related fetch failed after retries
    Failed(String),
    /// Node already in the graph and overwriting is off
    AlreadyPresent,
}

impl ItemOutcome {
    pub fn processed() -> Self {
        ItemOutcome::Processed {
            warnings: Vec::new(),
        }
    }
}

/// Counts and messages accumulated by one worker, or merged over many
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionTally {
    pub processed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ExecutionTally {
    pub fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Processed { warnings } => {
                self.processed += 1;
                self.warnings.extend(warnings);
            }
            ItemOutcome::Skipped(reason) => {
                self.skipped += 1;
                self.warnings.push(reason);
            }
            ItemOutcome::Failed(reason) => {
                self.failed += 1;
                self.errors.push(reason);
            }
            ItemOutcome::AlreadyPresent => self.skipped += 1,
        }
    }

    /// Sum counts and append messages
    pub fn merge(&mut self, other: ExecutionTally) {
        self.processed += other.processed;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Items that reached a final outcome
    pub fn completed(&self) -> u64 {
        self.processed + self.failed + self.skipped
    }
}

/// Outcome of one loader invocation, produced exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderResult {
    /// False only when the invocation aborted (fetch exhausted, fatal config)
    pub success: bool,
    pub processed_count: u64,
    pub failed_count: u64,
    pub skipped_count: u64,
    /// Items the source yielded, including those passed over on resume
    pub total_items: u64,
    /// Offset the invocation resumed from
    pub start_offset: u64,
    pub execution_time_seconds: f64,
    pub error_messages: Vec<String>,
    pub warnings: Vec<String>,
}

impl LoaderResult {
    /// Result for an invocation that did all its work
    pub fn from_tally(
        tally: ExecutionTally,
        total_items: u64,
        start_offset: u64,
        execution_time_seconds: f64,
    ) -> Self {
        Self {
            success: true,
            processed_count: tally.processed,
            failed_count: tally.failed,
            skipped_count: tally.skipped,
            total_items,
            start_offset,
            execution_time_seconds,
            error_messages: tally.errors,
            warnings: tally.warnings,
        }
    }

    /// Result for an invocation that aborted before processing anything
    pub fn aborted(error: impl Into<String>, start_offset: u64, execution_time_seconds: f64) -> Self {
        Self {
            success: false,
            processed_count: 0,
            failed_count: 0,
            skipped_count: 0,
            total_items: 0,
            start_offset,
            execution_time_seconds,
            error_messages: vec![error.into()],
            warnings: Vec::new(),
        }
    }
}
