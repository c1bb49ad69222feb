//! The loader contract

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::checkpointed::CheckpointScope;
use super::types::{LoaderCapability, LoaderConfig, LoaderResult};
use crate::graph::GraphWriter;

/// Collaborators handed to a loader invocation
#[derive(Clone)]
pub struct LoadContext {
    pub writer: Arc<dyn GraphWriter>,
    /// Present when progress should be checkpointed
    pub checkpoint: Option<CheckpointScope>,
    pub cancel: CancellationToken,
}

impl LoadContext {
    pub fn new(writer: Arc<dyn GraphWriter>) -> Self {
        Self {
            writer,
            checkpoint: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_checkpoint(mut self, scope: CheckpointScope) -> Self {
        self.checkpoint = Some(scope);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// A unit that ingests one entity type end to end.
///
/// `load` reports network errors, bad items and missing optional data inside
/// the returned [`LoaderResult`]; it does not fail. Configuration problems
/// are caught before the call through [`Loader::validate_config`].
#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn capabilities(&self) -> &[LoaderCapability];

    /// Loaders whose nodes this loader links to
    fn dependencies(&self) -> &[String] {
        &[]
    }

    fn supports(&self, capability: LoaderCapability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// Problems with `config` for this loader; empty when valid
    fn validate_config(&self, config: &LoaderConfig) -> Vec<String> {
        let mut errors = config.validate();
        if config.max_workers > 1 && !self.supports(LoaderCapability::Threading) {
            errors.push(format!(
                "loader {} does not support threading (max_workers = {})",
                self.name(),
                config.max_workers
            ));
        }
        if config.skip_count > 0 && !self.supports(LoaderCapability::SkipFunctionality) {
            errors.push(format!("loader {} does not support skip_count", self.name()));
        }
        errors
    }

    async fn load(&self, ctx: &LoadContext, config: &LoaderConfig) -> LoaderResult;
}
