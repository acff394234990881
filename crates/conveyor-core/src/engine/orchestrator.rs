//! Pipeline orchestrator.
//!
//! Builds the stages of a run, decides when the deferred links open, and turns
//! the way the run ended into a [`ProcessResult`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

use super::channel::{stage_channel, Gate};
use super::clustering::Clusterer;
use super::result::{CompletionStatus, ProcessResult};
use super::stages::{self, IntakeLinks};
use super::{OutputLink, Shared};
use crate::config::{DeferTransformation, OrchestratorConfig, UNBOUNDED};
use crate::errors::{PipelineError, Result, StageOrigin};
use crate::events::{Events, PipelineObserver};
use crate::fault::{contain, panic_to_error};
use crate::global_cache::GlobalCache;
use crate::phase::PhaseState;
use crate::providers::{IntakeProvider, OutputProvider};
use crate::record::RecordContext;
use crate::types::TypeDefinitions;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Stage tasks of one run.
struct StageSet {
    tasks: JoinSet<()>,
    shared: Arc<Shared>,
}

impl StageSet {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            tasks: JoinSet::new(),
            shared,
        }
    }

    /// Spawn a stage. A panic in the stage body becomes a fault of `origin`.
    fn spawn(&mut self, origin: StageOrigin, stage: impl Future<Output = ()> + Send + 'static) {
        let span = tracing::info_span!("stage", stage = origin.label());
        let shared = self.shared.clone();
        let dispatch = shared.dispatch.clone();
        self.tasks.spawn(
            async move {
                if let Err(panic) = AssertUnwindSafe(stage).catch_unwind().await {
                    shared.fail(
                        origin,
                        PipelineError::caller_fault(origin, "in stage task", panic_to_error(panic)),
                    );
                }
            }
            .instrument(span)
            .with_subscriber(dispatch),
        );
    }

    async fn join(mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(join_err) = joined {
                tracing::error!(error = %join_err, "stage task did not finish");
            }
        }
    }
}

/// Runs one pipeline, once.
pub struct Orchestrator {
    config: OrchestratorConfig,
    intake: Mutex<Option<Box<dyn IntakeProvider>>>,
    output: Mutex<Option<Arc<dyn OutputProvider>>>,
    observers: Vec<Arc<dyn PipelineObserver>>,
    dispatch: Option<Dispatch>,
    global_cache: Arc<GlobalCache>,
    types: Arc<TypeDefinitions>,
    user_cancel: CancellationToken,
    executed: AtomicBool,
    disposed: AtomicBool,
}

impl Orchestrator {
    /// Validate `config` and take ownership of the providers.
    pub fn new(
        config: OrchestratorConfig,
        intake: impl IntakeProvider + 'static,
        output: impl OutputProvider + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let settings = &config.settings;
        let global_cache = Arc::new(GlobalCache::from_elements(
            &settings.global_cache_elements,
            settings.cluster_sync_interval(),
        )?);
        let types = Arc::new(TypeDefinitions::new(
            config.functions.type_definer.clone(),
            settings.type_definitions.clone(),
        ));

        Ok(Self {
            config,
            intake: Mutex::new(Some(Box::new(intake))),
            output: Mutex::new(Some(Arc::new(output))),
            observers: Vec::new(),
            dispatch: None,
            global_cache,
            types,
            user_cancel: CancellationToken::new(),
            executed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Log through `dispatch` instead of the caller's current subscriber.
    pub fn with_log_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn global_cache(&self) -> &Arc<GlobalCache> {
        &self.global_cache
    }

    pub fn settings(&self) -> &crate::config::PipelineSettings {
        &self.config.settings
    }

    /// Request cancellation of the current or next run.
    pub fn cancel(&self) {
        tracing::info!("pipeline cancellation requested");
        self.user_cancel.cancel();
    }

    /// A token that cancels this orchestrator's run when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.user_cancel.clone()
    }

    /// Release the providers. Further executions are invalid attempts.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.user_cancel.cancel();
        let intake = lock(&self.intake).take();
        if let Some(mut intake) = intake {
            intake.dispose().await;
        }
        lock(&self.output).take();
        tracing::debug!("orchestrator disposed");
    }

    /// Run the pipeline to its end. Only the first call on an orchestrator runs.
    pub async fn execute(&self) -> ProcessResult {
        if self.disposed.load(Ordering::SeqCst) || self.executed.swap(true, Ordering::SeqCst) {
            tracing::warn!("execute called on an orchestrator that was already used or disposed");
            return ProcessResult::empty(CompletionStatus::InvalidAttempt);
        }
        let intake = lock(&self.intake).take();
        let output = lock(&self.output).take();
        let (Some(intake), Some(output)) = (intake, output) else {
            return ProcessResult::empty(CompletionStatus::InvalidAttempt);
        };

        let dispatch = self
            .dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        let name = self.config.settings.pipeline_name.clone();
        let run_dispatch = dispatch.clone();
        async move {
            let span = tracing::info_span!("pipeline", name = %name);
            self.run(intake, output, run_dispatch).instrument(span).await
        }
        .with_subscriber(dispatch)
        .await
    }

    async fn initialize(intake: &mut dyn IntakeProvider, output: &dyn OutputProvider) -> Result<()> {
        contain(intake.initialize())
            .await
            .map_err(PipelineError::Initialization)?;
        contain(output.initialize())
            .await
            .map_err(PipelineError::Initialization)
    }

    async fn run(
        &self,
        mut intake: Box<dyn IntakeProvider>,
        output: Arc<dyn OutputProvider>,
        dispatch: Dispatch,
    ) -> ProcessResult {
        let settings = self.config.settings.clone();
        let functions = self.config.functions.clone();
        let events = Events::new(self.observers.clone(), settings.progress_every());
        tracing::info!(
            concurrency = settings.concurrency_level,
            buffer_size = settings.buffer_size,
            transformer = functions.transformer.name(),
            "pipeline starting"
        );

        if let Err(error) = Self::initialize(intake.as_mut(), output.as_ref()).await {
            tracing::error!(error = %error, "pipeline initialization failed");
            events.error(StageOrigin::Initialization, &error);
            intake.dispose().await;
            let mut result = ProcessResult::empty(CompletionStatus::InitializationError);
            result.error = Some(error.to_string());
            result.global_cache = self.global_cache.snapshot();
            return result;
        }

        let ctx = Arc::new(RecordContext::new(
            self.types.clone(),
            self.global_cache.clone(),
            settings.allow_transform_to_alter_fields,
            settings.action_on_duplicate_key,
            settings.property_bin_entities,
        ));
        let output_link = OutputLink::decide(
            &settings,
            intake.has_header_row(),
            output.requires_fields_up_front(),
        );
        let links = IntakeLinks {
            defer: settings.defer_transformation,
            transform_gate: Gate::new("transform"),
            output_link,
            output_gate: Gate::new("output"),
        };
        tracing::debug!(?output_link, defer = ?links.defer, "links decided");
        if links.defer == DeferTransformation::NotDeferred {
            links.transform_gate.open();
        }
        if output_link == OutputLink::Immediately {
            links.output_gate.open();
        }

        let factors = settings.buffer_factors;
        let transform_capacity = match settings.defer_transformation {
            DeferTransformation::UntilRecordInitiation | DeferTransformation::UntilIntakeCompletion => {
                UNBOUNDED
            },
            _ => settings.capacity(factors.transforming),
        };
        let (record_tx, mut record_rx) = stage_channel(settings.capacity(factors.clustering));
        let (cluster_tx, cluster_rx) = stage_channel(transform_capacity);
        let (transformed_tx, mut transformed_rx) = stage_channel(settings.capacity(factors.holding));
        let (released_tx, mut released_rx) = stage_channel(settings.capacity(factors.unclustering));
        let (routed_tx, mut routed_rx) = stage_channel(settings.capacity(factors.formatting));
        let (formatted_tx, mut formatted_rx) = stage_channel(settings.capacity(factors.output));

        let shared = Arc::new(Shared::new(
            settings,
            ctx.clone(),
            self.user_cancel.child_token(),
            events,
            dispatch.clone(),
        ));
        let mut stage_set = StageSet::new(shared.clone());

        {
            let shared = shared.clone();
            let links = links.clone();
            let initiator = functions.record_initiator.clone();
            stage_set.spawn(StageOrigin::LineParsing, async move {
                let origin = StageOrigin::LineParsing;
                let stage = stages::parse_lines(
                    &shared,
                    intake.as_mut(),
                    initiator.as_ref(),
                    &links,
                    &record_tx,
                );
                shared.settle(origin, stage.await);
                drop(record_tx);
                intake.dispose().await;
            });
        }
        {
            let shared = shared.clone();
            let links = links.clone();
            let clusterer = Clusterer::new(
                functions.cluster_marker.clone(),
                shared.settings.marker_starts_cluster,
                ctx,
            );
            stage_set.spawn(StageOrigin::Clustering, async move {
                let origin = StageOrigin::Clustering;
                let stage = stages::cluster_records(&shared, clusterer, &links, &mut record_rx, &cluster_tx);
                shared.settle(origin, stage.await);
                drop(cluster_tx);
            });
        }
        {
            let shared = shared.clone();
            let transformer = functions.transformer.clone();
            let gate = links.transform_gate.clone();
            let output_gate = links.output_gate.clone();
            stage_set.spawn(StageOrigin::Transforming, async move {
                let origin = StageOrigin::Transforming;
                let stage = stages::transform_clusters(
                    shared.clone(),
                    transformer,
                    gate,
                    output_link,
                    output_gate,
                    cluster_rx,
                    &transformed_tx,
                );
                shared.settle(origin, stage.await);
                drop(transformed_tx);
            });
        }
        {
            let shared = shared.clone();
            let output_gate = links.output_gate.clone();
            stage_set.spawn(StageOrigin::Holding, async move {
                let origin = StageOrigin::Holding;
                let stage = stages::hold_clusters(&shared, &output_gate, &mut transformed_rx, &released_tx);
                shared.settle(origin, stage.await);
                drop(released_tx);
            });
        }
        {
            let shared = shared.clone();
            let router = functions.router.clone();
            let output = output.clone();
            let output_gate = links.output_gate.clone();
            stage_set.spawn(StageOrigin::Unclustering, async move {
                let origin = StageOrigin::Unclustering;
                let stage = stages::uncluster(
                    &shared,
                    &router,
                    output.as_ref(),
                    &output_gate,
                    &mut released_rx,
                    &routed_tx,
                );
                shared.settle(origin, stage.await);
                drop(routed_tx);
            });
        }
        {
            let shared = shared.clone();
            let output = output.clone();
            stage_set.spawn(StageOrigin::Formatting, async move {
                let origin = StageOrigin::Formatting;
                let stage = stages::format_records(&shared, output.as_ref(), &mut routed_rx, &formatted_tx);
                shared.settle(origin, stage.await);
                drop(formatted_tx);
            });
        }
        {
            let shared = shared.clone();
            stage_set.spawn(StageOrigin::Output, async move {
                let origin = StageOrigin::Output;
                let stage = stages::write_lines(&shared, output.as_ref(), &mut formatted_rx);
                shared.settle(origin, stage.await);
            });
        }

        let watchdog = shared.settings.time_limit().map(|limit| {
            let shared = shared.clone();
            tokio::spawn(
                async move {
                    tokio::select! {
                        _ = shared.cancel.cancelled() => {},
                        _ = tokio::time::sleep(limit) => {
                            tracing::warn!(?limit, "time limit exceeded, canceling pipeline");
                            shared.timed_out.store(true, Ordering::SeqCst);
                            shared.cancel.cancel();
                        },
                    }
                }
                .with_subscriber(dispatch.clone()),
            )
        });

        stage_set.join().await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        self.conclude(&shared)
    }

    fn conclude(&self, shared: &Shared) -> ProcessResult {
        let intake = shared.intake.snapshot();
        let output = shared.output.snapshot();
        let fault = shared.faults.get();

        let status = if shared.fault_token.is_cancelled() {
            CompletionStatus::Failed
        } else if output.state == PhaseState::Complete {
            if shared.is_limit_reached() {
                CompletionStatus::LimitReached
            } else {
                CompletionStatus::IntakeDepleted
            }
        } else if shared.is_timed_out() {
            CompletionStatus::TimedOut
        } else {
            CompletionStatus::Canceled
        };

        tracing::info!(
            %status,
            rows_read = intake.record_count,
            clusters_read = intake.cluster_count,
            rows_written = output.record_count,
            clusters_written = output.cluster_count,
            "pipeline finished"
        );

        ProcessResult {
            status,
            rows_read: intake.record_count,
            clusters_read: intake.cluster_count,
            clusters_written: output.cluster_count,
            rows_written: output.record_count,
            global_cache: self.global_cache.snapshot(),
            error: fault.map(|f| f.error.to_string()),
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("observers", &self.observers.len())
            .field("executed", &self.executed.load(Ordering::SeqCst))
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{CollectingOutput, VecIntake};

    fn orchestrator() -> Orchestrator {
        match Orchestrator::new(
            OrchestratorConfig::default(),
            VecIntake::new(["A=1", "A=2"]),
            CollectingOutput::new(),
        ) {
            Ok(orchestrator) => orchestrator,
            Err(err) => panic!("orchestrator not built: {err}"),
        }
    }

    #[tokio::test]
    async fn test_second_execution_is_invalid() {
        let orchestrator = orchestrator();
        assert_eq!(orchestrator.execute().await.status, CompletionStatus::IntakeDepleted);
        assert_eq!(orchestrator.execute().await.status, CompletionStatus::InvalidAttempt);
    }

    #[tokio::test]
    async fn test_execute_after_dispose_is_invalid() {
        let orchestrator = orchestrator();
        orchestrator.dispose().await;
        orchestrator.dispose().await;
        assert_eq!(orchestrator.execute().await.status, CompletionStatus::InvalidAttempt);
    }

    #[tokio::test]
    async fn test_cancel_before_execute() {
        let orchestrator = orchestrator();
        orchestrator.cancel();
        let result = orchestrator.execute().await;
        assert_eq!(result.status, CompletionStatus::Canceled);
        assert_eq!(result.rows_written, 0);
    }

    #[test]
    fn test_invalid_settings_rejected_up_front() {
        let mut config = OrchestratorConfig::default();
        config.settings.concurrency_level = 0;
        let built = Orchestrator::new(config, VecIntake::new(["A=1"]), CollectingOutput::new());
        assert!(matches!(built, Err(PipelineError::Config(_))));
    }
}
