//! Host notifications.
//!
//! Observers are called synchronously from the stage that caused the event.
//! A panicking observer is logged and otherwise ignored.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::errors::{PipelineError, StageOrigin};
use crate::fault::panic_to_error;
use crate::phase::{PhaseStatus, PhaseTransition};

/// Details of the fault that stopped a run.
#[derive(Debug, Clone, Copy)]
pub struct ErrorEvent<'a> {
    pub origin: StageOrigin,
    /// Where in the stream it happened, e.g. "at record #42".
    pub context: &'a str,
    pub error: &'a PipelineError,
}

impl ErrorEvent<'_> {
    /// The stage label, e.g. "transforming block".
    pub fn origin_label(&self) -> &'static str {
        self.origin.label()
    }
}

/// Callbacks a host can register on an orchestrator. All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    fn phase_starting(&self, _status: &PhaseStatus) {}

    fn phase_finished(&self, _status: &PhaseStatus) {}

    fn progress_changed(&self, _status: &PhaseStatus) {}

    fn error_occurred(&self, _event: &ErrorEvent<'_>) {}
}

#[derive(Clone, Default)]
pub(crate) struct Events {
    observers: Vec<Arc<dyn PipelineObserver>>,
    /// Clusters between progress notifications; `None` disables them.
    progress_interval: Option<u64>,
}

impl Events {
    pub(crate) fn new(observers: Vec<Arc<dyn PipelineObserver>>, progress_interval: Option<u64>) -> Self {
        Self {
            observers,
            progress_interval,
        }
    }

    fn notify(&self, event: &'static str, call: impl Fn(&dyn PipelineObserver)) {
        for observer in &self.observers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))) {
                tracing::warn!(event, error = %panic_to_error(panic), "observer panicked");
            }
        }
    }

    /// Emit the phase and progress events implied by one status update.
    pub(crate) fn transition(&self, transition: &PhaseTransition) {
        if transition.started() {
            tracing::info!(phase = %transition.after.phase, "phase starting");
            self.notify("phase_starting", |o| o.phase_starting(&transition.after));
        }
        if let Some(interval) = self.progress_interval {
            let before = transition.before.cluster_count / interval;
            let after = transition.after.cluster_count / interval;
            if after > before {
                self.notify("progress_changed", |o| o.progress_changed(&transition.after));
            }
        }
        if transition.finished() {
            tracing::info!(
                phase = %transition.after.phase,
                records = transition.after.record_count,
                clusters = transition.after.cluster_count,
                "phase finished"
            );
            self.notify("phase_finished", |o| o.phase_finished(&transition.after));
        }
    }

    pub(crate) fn error(&self, origin: StageOrigin, error: &PipelineError) {
        let context = match error {
            PipelineError::CallerFault { context, .. } => context.as_str(),
            _ => "",
        };
        let event = ErrorEvent {
            origin,
            context,
            error,
        };
        self.notify("error_occurred", |o| o.error_occurred(&event));
    }
}
