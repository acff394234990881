//! The staged pipeline.
//!
//! ```text
//! parse -> cluster -> transform -> hold -> uncluster -> format -> output
//! ```
//!
//! Stages are tokio tasks joined by [`channel`] links. The transform and
//! uncluster stages only start pulling once their [`channel::Gate`] opens.

pub(crate) mod channel;
pub(crate) mod clustering;
pub mod orchestrator;
pub mod result;
pub(crate) mod stages;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

use crate::config::{DeferOutput, PipelineSettings};
use crate::errors::{PipelineError, Result, StageOrigin};
use crate::events::Events;
use crate::fault::FaultCell;
use crate::phase::{Phase, PhaseTracker};
use crate::record::RecordContext;

/// The point at which output is linked to the hold buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputLink {
    Never,
    Immediately,
    AfterHeaderRow,
    AfterIntakeParsing,
    AfterTransformCompletion,
}

impl OutputLink {
    /// Decided once per run from configuration; output may start as soon as
    /// the set of output fields cannot change anymore.
    pub(crate) fn decide(settings: &PipelineSettings, header_row: bool, fields_up_front: bool) -> Self {
        if settings.defer_output == DeferOutput::Indefinitely {
            OutputLink::Never
        } else if !settings.output_fields.is_empty() || !fields_up_front {
            OutputLink::Immediately
        } else if settings.allow_transform_to_alter_fields {
            OutputLink::AfterTransformCompletion
        } else if header_row {
            OutputLink::AfterHeaderRow
        } else {
            OutputLink::AfterIntakeParsing
        }
    }
}

/// State shared by every stage of one run.
pub(crate) struct Shared {
    pub(crate) settings: PipelineSettings,
    pub(crate) ctx: Arc<RecordContext>,
    /// Observed by every stage; trips on user cancel, timeout or fault.
    pub(crate) cancel: CancellationToken,
    /// Trips on fault only.
    pub(crate) fault_token: CancellationToken,
    pub(crate) faults: FaultCell,
    pub(crate) events: Events,
    pub(crate) intake: PhaseTracker,
    pub(crate) transform: PhaseTracker,
    pub(crate) output: PhaseTracker,
    pub(crate) limit_reached: AtomicBool,
    pub(crate) timed_out: AtomicBool,
    /// Fields the formatter writes, fixed when output is linked; `None` means
    /// each record's own items.
    pub(crate) fields_to_use: OnceLock<Option<Vec<String>>>,
    pub(crate) dispatch: Dispatch,
}

impl Shared {
    pub(crate) fn new(
        settings: PipelineSettings,
        ctx: Arc<RecordContext>,
        cancel: CancellationToken,
        events: Events,
        dispatch: Dispatch,
    ) -> Self {
        Self {
            settings,
            ctx,
            cancel,
            fault_token: CancellationToken::new(),
            faults: FaultCell::new(),
            events,
            intake: PhaseTracker::new(Phase::Intake),
            transform: PhaseTracker::new(Phase::Transformation),
            output: PhaseTracker::new(Phase::Output),
            limit_reached: AtomicBool::new(false),
            timed_out: AtomicBool::new(false),
            fields_to_use: OnceLock::new(),
            dispatch,
        }
    }

    pub(crate) fn advance(&self, tracker: &PhaseTracker, records: u64, clusters: u64) {
        self.events.transition(&tracker.advance(records, clusters));
    }

    pub(crate) fn complete(&self, tracker: &PhaseTracker) {
        self.events.transition(&tracker.complete());
    }

    /// Record the outcome of a stage. Cancellation is the normal unwind path
    /// and is not a fault.
    pub(crate) fn settle(&self, origin: StageOrigin, result: Result<()>) {
        match result {
            Ok(()) => tracing::debug!(stage = origin.label(), "stage finished"),
            Err(PipelineError::Canceled) => tracing::debug!(stage = origin.label(), "stage canceled"),
            Err(error) => self.fail(origin, error),
        }
    }

    /// Keep the first fault, then cancel everything so blocked stages unwind.
    pub(crate) fn fail(&self, origin: StageOrigin, error: PipelineError) {
        tracing::error!(stage = origin.label(), error = %error, "pipeline stage failed");
        if self.faults.record(origin, error) {
            if let Some(fault) = self.faults.get() {
                self.events.error(fault.origin, &fault.error);
            }
        }
        self.fault_token.cancel();
        self.cancel.cancel();
    }

    pub(crate) fn is_timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn is_limit_reached(&self) -> bool {
        self.limit_reached.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::global_cache::GlobalCache;
    use crate::record::{DuplicateKeyPolicy, PropertyBinEntities};
    use crate::types::TypeDefinitions;

    fn shared(cancel: CancellationToken) -> Shared {
        let ctx = RecordContext::new(
            Arc::new(TypeDefinitions::new(None, Vec::new())),
            Arc::new(GlobalCache::new(Vec::new(), Duration::from_millis(5))),
            false,
            DuplicateKeyPolicy::IgnoreItem,
            PropertyBinEntities::default(),
        );
        Shared::new(
            PipelineSettings::default(),
            Arc::new(ctx),
            cancel,
            Events::default(),
            Dispatch::none(),
        )
    }

    #[test]
    fn test_only_faults_trip_the_fault_token() {
        let user = CancellationToken::new();
        let shared = shared(user.child_token());

        shared.settle(StageOrigin::Output, Err(PipelineError::Canceled));
        user.cancel();
        assert!(shared.cancel.is_cancelled());
        assert!(!shared.fault_token.is_cancelled());
        assert!(shared.faults.get().is_none());

        shared.fail(StageOrigin::Transforming, PipelineError::Config("bad".to_string()));
        assert!(shared.fault_token.is_cancelled());
        let fault = shared.faults.get().map(|f| f.origin);
        assert_eq!(fault, Some(StageOrigin::Transforming));
    }

    #[test]
    fn test_output_link_decision() {
        let base = PipelineSettings::default();
        assert_eq!(OutputLink::decide(&base, false, false), OutputLink::Immediately);
        assert_eq!(OutputLink::decide(&base, false, true), OutputLink::AfterIntakeParsing);
        assert_eq!(OutputLink::decide(&base, true, true), OutputLink::AfterHeaderRow);

        let explicit = PipelineSettings {
            output_fields: vec!["NAME".to_string()],
            ..Default::default()
        };
        assert_eq!(OutputLink::decide(&explicit, true, true), OutputLink::Immediately);

        let altering = PipelineSettings {
            allow_transform_to_alter_fields: true,
            ..Default::default()
        };
        assert_eq!(OutputLink::decide(&altering, true, true), OutputLink::AfterTransformCompletion);

        let never = PipelineSettings {
            defer_output: DeferOutput::Indefinitely,
            ..Default::default()
        };
        assert_eq!(OutputLink::decide(&never, false, false), OutputLink::Never);
    }
}
