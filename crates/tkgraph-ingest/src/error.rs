//! Error types for the ingestion pipeline
//!
//! Three families, matching how failures propagate:
//!
//! - [`FetchError`] and [`GraphError`] are collaborator failures. They are
//!   classified as transient or not, retried where that makes sense, and end
//!   up counted inside a `LoaderResult`. They never reach the orchestrator.
//! - [`IngestError`] covers configuration, resume and storage problems. These
//!   abort before any work starts, or abort the operation that hit them.

use std::time::Duration;
use thiserror::Error;

use crate::checkpoint::RunStatus;
use crate::framework::retry::Transient;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Fatal errors raised by the registry, checkpoint manager and orchestrator
#[derive(Error, Debug)]
pub enum IngestError {
    /// A loader with the same name is already registered
    #[error("Loader '{0}' is already registered. Loader names must be unique.")]
    DuplicateLoader(String),

    /// No loader with this name exists in the registry
    #[error("Loader '{0}' not found. Run 'tkgraph-ingest loaders' to list available loaders.")]
    LoaderNotFound(String),

    /// A loader depends on a loader that has not been registered before it
    #[error("Loader '{loader}' depends on '{dependency}', which is not registered. Register dependencies first.")]
    UnknownDependency { loader: String, dependency: String },

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resume request does not match the stored checkpoints
    #[error("Invalid resume request: {0}")]
    InvalidResume(String),

    /// Run id has no stored run record
    #[error("Run '{0}' not found. Run 'tkgraph-ingest runs' to list known runs.")]
    RunNotFound(String),

    /// A fresh run was requested under an id that is already in use
    #[error("Run '{0}' already exists. Use 'tkgraph-ingest resume {0}' to continue it.")]
    RunExists(String),

    /// Run status change not allowed by the run state machine
    #[error("Run '{run_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    /// Run is terminal and resuming it requires an explicit override
    #[error("Run '{run_id}' is {status} and cannot be resumed. Pass --force to resume it anyway.")]
    NotResumable { run_id: String, status: RunStatus },

    /// A checkpoint write would move the offset backwards
    #[error("Checkpoint offset for '{loader}' in run '{run_id}' cannot decrease from {stored} to {attempted}")]
    OffsetRegression {
        run_id: String,
        loader: String,
        stored: u64,
        attempted: u64,
    },

    /// Checkpoint store failure
    #[error("Checkpoint store error: {0}")]
    Store(String),

    /// File system operation failed
    #[error("File operation failed: {0}. Check permissions on the checkpoint directory.")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed
    #[error("Failed to parse JSON: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Environment or shared configuration failure
    #[error(transparent)]
    Common(#[from] tkgraph_common::CommonError),

    /// Database operation failed (SQLx)
    #[cfg(feature = "database")]
    #[error("Database error: {0}. Check DATABASE_URL.")]
    Database(#[from] sqlx::Error),
}

impl IngestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid resume error
    pub fn invalid_resume(msg: impl Into<String>) -> Self {
        Self::InvalidResume(msg.into())
    }

    /// Create a checkpoint store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }
}

/// Failure fetching from the remote data source
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    /// Connection refused or reset, throttling, server-side errors
    #[error("Transient fetch failure: {0}")]
    Transient(String),

    /// The attempt exceeded its time budget
    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The request itself is wrong (malformed filter, unknown entity, bad body)
    #[error("Fetch rejected: {0}")]
    Client(String),
}

impl FetchError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn client(msg: impl Into<String>) -> Self {
        Self::Client(msg.into())
    }
}

impl Transient for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Timeout(_))
    }

    fn timed_out(after: Duration) -> Self {
        FetchError::Timeout(after)
    }
}

/// Failure writing to the graph store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    /// Store temporarily unreachable or overloaded
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the statement (constraint, bad identifier)
    #[error("Graph write rejected: {0}")]
    Rejected(String),

    /// The worker's session can no longer be used
    #[error("Graph session lost: {0}")]
    SessionLost(String),
}

impl GraphError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Whether the worker holding this session must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, GraphError::SessionLost(_))
    }
}

impl Transient for GraphError {
    fn is_transient(&self) -> bool {
        matches!(self, GraphError::Unavailable(_))
    }

    fn timed_out(after: Duration) -> Self {
        GraphError::Unavailable(format!("write timed out after {after:?}"))
    }
}
