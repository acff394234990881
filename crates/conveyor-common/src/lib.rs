//! Conveyor Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the Conveyor workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the workspace-wide error type and result alias
//! - **Logging**: `tracing` subscriber setup for hosts that run pipelines
//!
//! # Example
//!
//! ```no_run
//! use conveyor_common::logging::{init_logging, LogConfig};
//! use conveyor_common::Result;
//!
//! fn start() -> Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{ConveyorError, Result};
