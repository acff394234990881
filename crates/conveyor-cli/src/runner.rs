//! Runs one pipeline over keyword files.

use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::providers::{KeywordIntake, KeywordOutput};
use conveyor_core::{
    Orchestrator, OrchestratorConfig, PhaseStatus, PipelineObserver, ProcessResult, Router,
};
use tracing::{info, warn, Dispatch};

use crate::settings::RunConfig;

/// Logs progress notifications.
struct ProgressLog;

impl PipelineObserver for ProgressLog {
    fn progress_changed(&self, status: &PhaseStatus) {
        info!(
            phase = %status.phase,
            records = status.record_count,
            clusters = status.cluster_count,
            "progress"
        );
    }
}

/// Run `config` from `inputs` to `outputs`. With several outputs, records from
/// the n-th input go to the n-th output.
///
/// Ctrl-C cancels the run; the partial result is still returned.
pub async fn run_pipeline(
    config: &RunConfig,
    inputs: Vec<PathBuf>,
    outputs: Vec<PathBuf>,
    dispatch: Option<Dispatch>,
) -> conveyor_core::Result<ProcessResult> {
    let mut functions = config.functions();
    if outputs.len() > 1 {
        functions = functions.with_router(Router::SourceToTarget);
    }
    info!(inputs = inputs.len(), outputs = outputs.len(), "starting pipeline");

    let intake = KeywordIntake::new(inputs, config.format.clone());
    let output = KeywordOutput::new(outputs, config.format.clone());
    let mut orchestrator = Orchestrator::new(
        OrchestratorConfig::new(config.pipeline.clone(), functions),
        intake,
        output,
    )?
    .with_observer(Arc::new(ProgressLog));
    if let Some(dispatch) = dispatch {
        orchestrator = orchestrator.with_log_dispatch(dispatch);
    }

    let cancel = orchestrator.cancellation_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, canceling pipeline");
            cancel.cancel();
        }
    });

    let result = orchestrator.execute().await;
    interrupt.abort();
    orchestrator.dispose().await;
    Ok(result)
}

/// Log the outcome of a run.
pub fn report(result: &ProcessResult) {
    info!(
        status = %result.status,
        rows_read = result.rows_read,
        clusters_read = result.clusters_read,
        clusters_written = result.clusters_written,
        rows_written = result.rows_written,
        "pipeline result"
    );
    for (key, value) in &result.global_cache {
        info!(key = %key, value = ?value, "global cache");
    }
    if let Some(error) = &result.error {
        warn!(error = %error, "pipeline did not complete");
    }
}
