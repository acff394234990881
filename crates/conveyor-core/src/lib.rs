//! Conveyor Core Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! A streaming ETL engine: lines flow from an intake provider through a fixed
//! chain of concurrent stages into an output provider.
//!
//! # Overview
//!
//! - **Records and clusters**: lines are parsed into ordered, optionally typed
//!   [`Record`]s and grouped into [`Cluster`]s by a caller-supplied marker
//! - **Transformation**: clusters are handed to one of the [`Transformer`]
//!   shapes on a pool of workers, optionally bracketed by head and foot clusters
//! - **Output**: a [`Router`] assigns a target to every record; the output
//!   provider formats and writes them
//! - **Fault containment**: a failure or panic in caller code stops the run and
//!   surfaces as [`CompletionStatus::Failed`] instead of taking the host down
//! - **Global cache**: a fixed set of thread-safe values and signals shared by
//!   all caller functions
//!
//! # Architecture
//!
//! ```text
//! intake -> parse -> cluster -> transform (xN) -> hold -> uncluster -> format -> output
//! ```
//!
//! Stages are tokio tasks joined by bounded links. Transformation and output
//! can be deferred; see [`config::DeferTransformation`] and
//! [`config::DeferOutput`].
//!
//! # Example
//!
//! ```no_run
//! use conveyor_core::providers::{CollectingOutput, VecIntake};
//! use conveyor_core::{Orchestrator, OrchestratorConfig, PipelineFunctions, Transformer};
//!
//! #[tokio::main]
//! async fn main() -> conveyor_core::Result<()> {
//!     let functions = PipelineFunctions::new().with_transformer(Transformer::record_filter(|rec| {
//!         Ok(rec.value("RECTYPE").as_str() != Some("EOF"))
//!     }));
//!     let config = OrchestratorConfig::new(Default::default(), functions);
//!     let output = CollectingOutput::new();
//!     let lines = output.lines();
//!
//!     let orchestrator = Orchestrator::new(config, VecIntake::new(["RECTYPE=XYZ,NAME=Mary"]), output)?;
//!     let result = orchestrator.execute().await;
//!     println!("{}: {:?}", result.status, lines.all());
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub(crate) mod fault;
pub mod global_cache;
pub mod item;
pub mod phase;
pub mod providers;
pub mod readonly;
pub mod record;
pub mod routing;
pub mod transform;
pub mod types;

// Re-export commonly used types
pub use cluster::Cluster;
pub use config::{OrchestratorConfig, PipelineFunctions, PipelineSettings};
pub use engine::orchestrator::Orchestrator;
pub use engine::result::{CompletionStatus, ProcessResult};
pub use errors::{PipelineError, Result, StageOrigin};
pub use events::{ErrorEvent, PipelineObserver};
pub use global_cache::{CacheValue, GlobalCache};
pub use item::{Item, ItemType, Value};
pub use phase::{Phase, PhaseState, PhaseStatus};
pub use providers::{IntakeProvider, OutputProvider};
pub use readonly::{ReadOnlyCluster, ReadOnlyMode, ReadOnlyRecord};
pub use record::{DuplicateKeyPolicy, ItemChange, Record};
pub use routing::Router;
pub use transform::Transformer;
pub use types::{FieldTypeSpec, TypeDefinition};
