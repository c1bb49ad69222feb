//! Loader orchestration core
//!
//! - [`types`]: loader configuration, capabilities and results
//! - [`loader`]: the contract every loader implements
//! - [`registry`]: named loader catalog
//! - [`worker`]: bounded worker pool over an item sequence
//! - [`checkpointed`]: worker pool plus checkpoint persistence and resume
//! - [`retry`]: timeouts and backoff for remote calls

pub mod checkpointed;
pub mod loader;
pub mod registry;
pub mod retry;
pub mod types;
pub mod worker;

pub use checkpointed::{reconcile_skip_count, CheckpointScope, CheckpointedExecution, ExecutionReport};
pub use loader::{LoadContext, Loader};
pub use registry::LoaderRegistry;
pub use retry::{RetryPolicy, Transient};
pub use types::{ExecutionTally, ItemOutcome, LoaderCapability, LoaderConfig, LoaderResult};
pub use worker::{ItemProcessor, ProgressObserver, ThreadedExecutionController};
