//! Settings for command-line runs
//!
//! Sources, later ones winning:
//! 1. Built-in defaults
//! 2. A TOML file (`--config`)
//! 3. `CONVEYOR_`-prefixed environment variables, with `__` separating nested
//!    keys (e.g. `CONVEYOR_PIPELINE__CONCURRENCY_LEVEL=4`)
//!
//! A `.env` file in the working directory is loaded first.

use std::path::Path;

use conveyor_common::{ConveyorError, Result};
use conveyor_core::providers::KeywordFormat;
use conveyor_core::{PipelineFunctions, PipelineSettings, Record};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Prefix of environment variables overriding settings.
pub const ENV_PREFIX: &str = "CONVEYOR_";

/// Starts a new cluster at records matching a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRule {
    pub field: String,
    /// Without a value, any record carrying `field` starts a cluster.
    #[serde(default)]
    pub value: Option<String>,
}

impl ClusterRule {
    pub fn matches(&self, record: &Record) -> bool {
        match &self.value {
            Some(value) => record.item(&self.field).is_some_and(|item| item.string_value() == *value),
            None => record.contains_key(&self.field),
        }
    }
}

/// Everything a `conveyor run` needs besides its file paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub pipeline: PipelineSettings,
    pub format: KeywordFormat,
    pub cluster: Option<ClusterRule>,
}

impl RunConfig {
    /// Load settings from defaults, an optional TOML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut figment = Figment::from(Serialized::defaults(RunConfig::default()));
        if let Some(path) = path {
            if !path.is_file() {
                return Err(ConveyorError::Config(format!(
                    "settings file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }
        let config: RunConfig = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConveyorError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline
            .validate()
            .map_err(|e| ConveyorError::Config(e.to_string()))?;
        if let Some(rule) = &self.cluster {
            if rule.field.trim().is_empty() {
                return Err(ConveyorError::Config("cluster field cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Pipeline functions implied by these settings.
    pub fn functions(&self) -> PipelineFunctions {
        let functions = PipelineFunctions::new();
        match self.cluster.clone() {
            Some(rule) => functions.with_cluster_marker(move |record, _previous, _count| Ok(rule.matches(&record))),
            None => functions,
        }
    }
}
