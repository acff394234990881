//! Conveyor CLI Library
//!
//! Runs conveyor pipelines over `KEY=VALUE` keyword files.
//!
//! # Example
//!
//! ```no_run
//! use std::path::PathBuf;
//!
//! use conveyor_cli::runner::{report, run_pipeline};
//! use conveyor_cli::settings::RunConfig;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RunConfig::load(None)?;
//!     let result = run_pipeline(
//!         &config,
//!         vec![PathBuf::from("in.kw")],
//!         vec![PathBuf::from("out.kw")],
//!         None,
//!     )
//!     .await?;
//!     report(&result);
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod runner;
pub mod settings;
