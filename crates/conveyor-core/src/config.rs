//! Pipeline configuration.
//!
//! [`PipelineSettings`] carries every data-only knob and can be loaded from a
//! settings file; [`PipelineFunctions`] carries the caller-supplied logic.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result};
use crate::global_cache::CacheValue;
use crate::item::{is_valid_datetime_format, ItemType};
use crate::readonly::ReadOnlyRecord;
use crate::record::{DuplicateKeyPolicy, PropertyBinEntities};
use crate::routing::Router;
use crate::transform::Transformer;
use crate::types::{FieldTypeSpec, TypeDefiner};

// ============================================================================
// Defaults
// ============================================================================

/// Default name used in logs.
pub const DEFAULT_PIPELINE_NAME: &str = "conveyor";

/// Default base capacity of the links between stages.
pub const DEFAULT_BUFFER_SIZE: i64 = 100;

/// Capacity value meaning "no bound".
pub const UNBOUNDED: i64 = -1;

/// Default number of concurrent transform workers.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 1;

/// Default polling period for cluster-order and global cache waits.
pub const DEFAULT_CLUSTER_SYNC_INTERVAL_MS: u64 = 10;

/// Default number of clusters between progress notifications.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 10;

/// When the transform stage is linked to the clustering stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeferTransformation {
    #[default]
    NotDeferred,
    /// Until the record initiator first returns `true`, or intake ends.
    UntilRecordInitiation,
    UntilIntakeCompletion,
    /// Never; for testing only.
    Indefinitely,
}

/// When the output side is linked to the hold buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeferOutput {
    /// As soon as the output fields are known.
    #[default]
    Auto,
    /// Never; for testing only.
    Indefinitely,
}

/// Per-link multipliers applied to [`PipelineSettings::buffer_size`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferFactors {
    /// Line parsing -> clustering.
    pub clustering: f64,
    /// Clustering -> transforming.
    pub transforming: f64,
    /// Transforming -> holding.
    pub holding: f64,
    /// Holding -> unclustering.
    pub unclustering: f64,
    /// Unclustering -> formatting.
    pub formatting: f64,
    /// Formatting -> output.
    pub output: f64,
}

impl Default for BufferFactors {
    fn default() -> Self {
        Self {
            clustering: 1.0,
            transforming: 1.0,
            holding: 1.0,
            unclustering: 1.0,
            formatting: 1.0,
            output: 1.0,
        }
    }
}

impl BufferFactors {
    fn all(&self) -> [(&'static str, f64); 6] {
        [
            ("clustering", self.clustering),
            ("transforming", self.transforming),
            ("holding", self.holding),
            ("unclustering", self.unclustering),
            ("formatting", self.formatting),
            ("output", self.output),
        ]
    }
}

/// Scale `base` by `factor`; unbounded stays unbounded and a bound never drops below 1.
pub fn scaled_capacity(base: i64, factor: f64) -> i64 {
    if base == UNBOUNDED {
        return UNBOUNDED;
    }
    ((base as f64 * factor).round() as i64).max(1)
}

/// Data-only pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub pipeline_name: String,
    /// Base capacity of inter-stage links; -1 means unbounded.
    pub buffer_size: i64,
    pub buffer_factors: BufferFactors,
    /// Number of concurrent transform workers.
    pub concurrency_level: usize,
    /// `true`: the marker flags the first record of a cluster; `false`: the last.
    pub marker_starts_cluster: bool,
    pub prepend_head_cluster: bool,
    pub append_foot_cluster: bool,
    pub defer_transformation: DeferTransformation,
    pub defer_output: DeferOutput,
    /// Stop reading after this many records.
    pub intake_record_limit: Option<u64>,
    pub time_limit_secs: Option<f64>,
    pub action_on_duplicate_key: DuplicateKeyPolicy,
    pub allow_transform_to_alter_fields: bool,
    pub cluster_sync_interval_ms: u64,
    /// Global cache seed, as `key|value` strings.
    pub global_cache_elements: Vec<String>,
    pub report_progress: bool,
    pub progress_interval: u64,
    /// Explicit output field names; empty means "whatever intake produced".
    pub output_fields: Vec<String>,
    pub type_definitions: Vec<FieldTypeSpec>,
    pub property_bin_entities: PropertyBinEntities,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            pipeline_name: DEFAULT_PIPELINE_NAME.to_string(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_factors: BufferFactors::default(),
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            marker_starts_cluster: true,
            prepend_head_cluster: false,
            append_foot_cluster: false,
            defer_transformation: DeferTransformation::default(),
            defer_output: DeferOutput::default(),
            intake_record_limit: None,
            time_limit_secs: None,
            action_on_duplicate_key: DuplicateKeyPolicy::default(),
            allow_transform_to_alter_fields: false,
            cluster_sync_interval_ms: DEFAULT_CLUSTER_SYNC_INTERVAL_MS,
            global_cache_elements: Vec::new(),
            report_progress: false,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            output_fields: Vec::new(),
            type_definitions: Vec::new(),
            property_bin_entities: PropertyBinEntities::default(),
        }
    }
}

impl PipelineSettings {
    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < UNBOUNDED || self.buffer_size == 0 {
            return Err(PipelineError::Config(format!(
                "buffer_size must be positive or -1 (unbounded), got {}",
                self.buffer_size
            )));
        }

        for (link, factor) in self.buffer_factors.all() {
            if !factor.is_finite() || factor <= 0.0 {
                return Err(PipelineError::Config(format!(
                    "buffer factor for {} must be a positive number, got {}",
                    link, factor
                )));
            }
        }

        if self.concurrency_level == 0 {
            return Err(PipelineError::Config(
                "concurrency_level must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval == 0 {
            return Err(PipelineError::Config(
                "progress_interval must be greater than 0".to_string(),
            ));
        }

        if self.cluster_sync_interval_ms == 0 {
            return Err(PipelineError::Config(
                "cluster_sync_interval_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(limit) = self.time_limit_secs {
            if !limit.is_finite() || limit <= 0.0 {
                return Err(PipelineError::Config(format!(
                    "time_limit_secs must be a positive number, got {}",
                    limit
                )));
            }
        }

        if self.action_on_duplicate_key == DuplicateKeyPolicy::AssignDefaultKey {
            return Err(PipelineError::NotImplemented(
                "AssignDefaultKey duplicate key policy",
            ));
        }

        for element in &self.global_cache_elements {
            CacheValue::parse_element(element)?;
        }

        for entry in &self.type_definitions {
            if entry.item_type == ItemType::DateTime && !is_valid_datetime_format(&entry.format) {
                return Err(PipelineError::Config(format!(
                    "invalid datetime format '{}' for field {}",
                    entry.format, entry.field
                )));
            }
        }

        if self.intake_record_limit == Some(0) {
            tracing::warn!("intake_record_limit is 0 - no records will be read");
        }

        Ok(())
    }

    pub fn cluster_sync_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_sync_interval_ms)
    }

    pub fn time_limit(&self) -> Option<Duration> {
        self.time_limit_secs.map(Duration::from_secs_f64)
    }

    /// Capacity of one link after applying its factor.
    pub fn capacity(&self, factor: f64) -> i64 {
        scaled_capacity(self.buffer_size, factor)
    }

    /// `None` when progress reporting is off.
    pub fn progress_every(&self) -> Option<u64> {
        self.report_progress.then_some(self.progress_interval)
    }
}

/// Boundary predicate: `(current, previous, records so far in the cluster)`.
pub type ClusterMarker = Arc<
    dyn Fn(ReadOnlyRecord<'_>, Option<ReadOnlyRecord<'_>>, usize) -> anyhow::Result<bool> + Send + Sync,
>;

/// Decides, record by record, when a deferred transform stage may start.
pub type RecordInitiator = Arc<dyn Fn(ReadOnlyRecord<'_>) -> anyhow::Result<bool> + Send + Sync>;

/// Caller-supplied pipeline logic.
#[derive(Clone, Default)]
pub struct PipelineFunctions {
    /// `None` puts every record in its own cluster.
    pub cluster_marker: Option<ClusterMarker>,
    pub record_initiator: Option<RecordInitiator>,
    pub transformer: Transformer,
    pub router: Router,
    pub type_definer: Option<TypeDefiner>,
}

impl PipelineFunctions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster_marker(
        mut self,
        marker: impl Fn(ReadOnlyRecord<'_>, Option<ReadOnlyRecord<'_>>, usize) -> anyhow::Result<bool>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.cluster_marker = Some(Arc::new(marker));
        self
    }

    pub fn with_record_initiator(
        mut self,
        initiator: impl Fn(ReadOnlyRecord<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        self.record_initiator = Some(Arc::new(initiator));
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_router(mut self, router: Router) -> Self {
        self.router = router;
        self
    }

    pub fn with_type_definer(
        mut self,
        definer: impl Fn(&str) -> anyhow::Result<(crate::item::ItemType, String)> + Send + Sync + 'static,
    ) -> Self {
        self.type_definer = Some(Arc::new(definer));
        self
    }
}

impl std::fmt::Debug for PipelineFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineFunctions")
            .field("cluster_marker", &self.cluster_marker.is_some())
            .field("record_initiator", &self.record_initiator.is_some())
            .field("transformer", &self.transformer)
            .field("router", &self.router)
            .field("type_definer", &self.type_definer.is_some())
            .finish()
    }
}

/// Everything an orchestrator needs besides its providers.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub settings: PipelineSettings,
    pub functions: PipelineFunctions,
}

impl OrchestratorConfig {
    pub fn new(settings: PipelineSettings, functions: PipelineFunctions) -> Self {
        Self {
            settings,
            functions,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;
        if self.settings.defer_transformation == DeferTransformation::UntilRecordInitiation
            && self.functions.record_initiator.is_none()
        {
            tracing::warn!("transformation deferred until record initiation but no initiator is set; it will start when intake ends");
        }
        Ok(())
    }
}
