//! TKGraph Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared ambient concerns for the TKGraph workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the common error type and result alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Environment**: typed parsing of environment-variable tunables
//!
//! # Example
//!
//! ```no_run
//! use tkgraph_common::env::env_or;
//! use tkgraph_common::Result;
//!
//! fn read_timeout() -> Result<f64> {
//!     env_or("TKAPI_READ_TIMEOUT", 300.0)
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
