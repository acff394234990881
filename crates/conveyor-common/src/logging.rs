//! Logging setup for pipeline hosts
//!
//! Conveyor libraries only emit `tracing` events and spans; they never install a
//! subscriber themselves. Hosts (the CLI, services embedding the engine, tests)
//! decide where the events go:
//!
//! - [`init_logging`] installs a process-wide subscriber.
//! - [`build_dispatch`] builds the same subscriber as a [`Dispatch`] handle without
//!   installing it, so it can be handed to an orchestrator and scoped to one run.
//!
//! Events go to stdout, to daily-rolling files, or to both, as text or JSON lines.
//!
//! ```no_run
//! use conveyor_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! let config = LogConfig::builder()
//!     .level(LogLevel::Debug)
//!     .filter_directives("conveyor_core=trace")
//!     .build();
//! let _guard = init_logging(&config).unwrap();
//! tracing::info!("pipeline host started");
//! ```

use std::path::PathBuf;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::{self, format::FmtSpan, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::error::{ConveyorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Where events are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    #[serde(alias = "stdout")]
    Console,
    File,
    #[serde(alias = "all")]
    Both,
}

impl LogOutput {
    fn writes_console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn writes_file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    #[serde(alias = "pretty")]
    Text,
    /// One JSON object per event
    Json,
}

/// Case-insensitive parse of a unit variant by its serde name or alias.
fn parse_choice<T: DeserializeOwned>(what: &str, raw: &str) -> Result<T> {
    let name = serde_json::Value::String(raw.trim().to_lowercase());
    serde_json::from_value(name).map_err(|_| ConveyorError::Config(format!("Invalid {what}: {raw}")))
}

impl FromStr for LogLevel {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice("log level", s)
    }
}

impl FromStr for LogOutput {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice("log output", s)
    }
}

impl FromStr for LogFormat {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        parse_choice("log format", s)
    }
}

/// How a host wants pipeline events rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Only read when `output` includes files.
    pub log_dir: PathBuf,
    /// Rolling files are named `<prefix>.<date>`.
    pub log_file_prefix: String,
    /// Comma-separated `EnvFilter` directives, e.g. `conveyor_core=trace`.
    pub filter_directives: Option<String>,
    pub include_location: bool,
    /// Transform workers run on blocking threads, so ids tell them apart.
    pub include_thread_ids: bool,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "conveyor".to_string(),
            filter_directives: None,
            include_location: false,
            include_thread_ids: false,
            include_targets: true,
        }
    }
}

impl LogConfig {
    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    /// Defaults overlaid with the `LOG_*` environment variables.
    ///
    /// `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER`,
    /// plus the switches `LOG_INCLUDE_LOCATION`, `LOG_INCLUDE_THREAD_IDS` and
    /// `LOG_INCLUDE_TARGETS`.
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Overlay the `LOG_*` environment variables on `self`.
    pub fn merge_env(mut self) -> Result<Self> {
        env_parse("LOG_LEVEL", &mut self.level)?;
        env_parse("LOG_OUTPUT", &mut self.output)?;
        env_parse("LOG_FORMAT", &mut self.format)?;
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        self.filter_directives = env_value("LOG_FILTER").or(self.filter_directives);
        env_flag("LOG_INCLUDE_LOCATION", &mut self.include_location);
        env_flag("LOG_INCLUDE_THREAD_IDS", &mut self.include_thread_ids);
        env_flag("LOG_INCLUDE_TARGETS", &mut self.include_targets);
        Ok(self)
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        let base = EnvFilter::from_default_env().add_directive(LevelFilter::from(self.level).into());
        self.filter_directives
            .iter()
            .flat_map(|directives| directives.split(','))
            .map(str::trim)
            .filter(|directive| !directive.is_empty())
            .try_fold(base, |filter, directive| {
                let parsed = directive.parse().map_err(|e| {
                    ConveyorError::Config(format!("Invalid filter directive '{directive}': {e}"))
                })?;
                Ok(filter.add_directive(parsed))
            })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse `name` into `slot` when set; a malformed value is an error.
fn env_parse<T>(name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr<Err = ConveyorError>,
{
    if let Some(raw) = env_value(name) {
        *slot = raw.parse()?;
    }
    Ok(())
}

/// Boolean switches ignore unparseable values.
fn env_flag(name: &str, slot: &mut bool) {
    if let Some(flag) = env_value(name).and_then(|v| v.trim().parse().ok()) {
        *slot = flag;
    }
}

#[derive(Debug, Default)]
#[must_use]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: LogLevel) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, directives: impl Into<String>) -> Self {
        self.config.filter_directives = Some(directives.into());
        self
    }

    pub fn include_thread_ids(mut self, include: bool) -> Self {
        self.config.include_thread_ids = include;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

/// Keeps the non-blocking file writer flushing; drop it at shutdown.
#[must_use = "dropping the guard stops the background log writer"]
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// One fmt layer carrying the config's decorations, in the config's format.
fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(config.include_targets)
        .with_thread_ids(config.include_thread_ids)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);
    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Build a subscriber for `config` and return it as a [`Dispatch`] without
/// installing it globally.
pub fn build_dispatch(config: &LogConfig) -> Result<(Dispatch, LogGuard)> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    if config.output.writes_console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }
    let file_guard = if config.output.writes_file() {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(config, writer, false));
        Some(guard)
    } else {
        None
    };

    let subscriber = tracing_subscriber::registry().with(layers).with(filter);
    Ok((
        Dispatch::new(subscriber),
        LogGuard {
            _file_guard: file_guard,
        },
    ))
}

/// Install the subscriber for `config` process-wide.
///
/// Fails if a global subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> Result<LogGuard> {
    let (dispatch, guard) = build_dispatch(config)?;
    tracing::dispatcher::set_global_default(dispatch)
        .map_err(|e| ConveyorError::Logging(e.to_string()))?;
    Ok(guard)
}
