//! Shared fixtures for pipeline tests

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::providers::{CollectedLines, CollectingOutput, ExternalLine, RawItem, VecIntake};
use conveyor_core::{
    ErrorEvent, IntakeProvider, Orchestrator, OrchestratorConfig, OutputProvider, Phase, PhaseStatus,
    PipelineFunctions, PipelineObserver, PipelineSettings, ProcessResult, Record,
};

/// Ten records in two clusters when split on `RECTYPE=XYZ`: 4 records, then 6
/// ending with a bare `EOF` key.
pub const FIXTURE: [&str; 10] = [
    "RECTYPE=XYZ,NAME=Mary,NUM=123",
    "RECTYPE=ABCD,NAME=Mary,NUM=223",
    "RECTYPE=ABCD,NAME=Mary,NUM=323",
    "RECTYPE=ABCD,NAME=Susan,NUM=423",
    "RECTYPE=XYZ,NAME=Susan,NUM=523",
    "RECTYPE=ABCD,NAME=Mary,NUM=623",
    "RECTYPE=ABCD,NAME=Joe,NUM=723",
    "RECTYPE=ABCD,NAME=Susan,NUM=823",
    "RECTYPE=ABCD,NAME=Ann,NUM=923",
    "EOF",
];

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn field(record: &Record, key: &str) -> Option<String> {
    record.value(key).as_str().map(str::to_string)
}

pub fn is_xyz(record: &Record) -> bool {
    record.value("RECTYPE").as_str() == Some("XYZ")
}

/// Functions that start a new cluster at every `RECTYPE=XYZ` record.
pub fn clustered_by_rectype() -> PipelineFunctions {
    PipelineFunctions::new().with_cluster_marker(|record, _previous, _count| Ok(is_xyz(&record)))
}

pub fn orchestrator(
    settings: PipelineSettings,
    functions: PipelineFunctions,
    intake: impl IntakeProvider + 'static,
    output: impl OutputProvider + 'static,
) -> Orchestrator {
    init_tracing();
    Orchestrator::new(OrchestratorConfig::new(settings, functions), intake, output)
        .expect("valid pipeline configuration")
}

/// Run the fixture through a pipeline that collects its output in memory.
pub async fn run_fixture(settings: PipelineSettings, functions: PipelineFunctions) -> (ProcessResult, CollectedLines) {
    let output = CollectingOutput::new();
    let lines = output.lines();
    let result = orchestrator(settings, functions, VecIntake::new(FIXTURE), output)
        .execute()
        .await;
    (result, lines)
}

/// Wraps [`VecIntake`] and counts `get_line` calls, including the final one
/// that reports the end of intake.
pub struct CountingIntake {
    inner: VecIntake,
    pub calls: Arc<AtomicUsize>,
}

impl CountingIntake {
    pub fn new(inner: VecIntake) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl IntakeProvider for CountingIntake {
    async fn get_line(&mut self) -> anyhow::Result<Option<ExternalLine>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_line().await
    }

    fn tokenize(&self, line: &str) -> Vec<String> {
        self.inner.tokenize(line)
    }

    fn item_from_token(&mut self, token: &str, ordinal: usize) -> anyhow::Result<Option<RawItem>> {
        self.inner.item_from_token(token, ordinal)
    }
}

/// Comma-separated values under a header row naming the fields, e.g.
/// `NAME,NUM` then `Mary,1`.
///
/// With [`HeaderIntake::holding_last_line_until`] the final line is only
/// served once the given output has received a line, so a run finishes only
/// if output was linked while intake was still going.
pub struct HeaderIntake {
    lines: VecDeque<String>,
    header_width: Option<usize>,
    names: Vec<String>,
    hold_last_until: Option<CollectedLines>,
}

impl HeaderIntake {
    pub fn new<S: Into<String>>(lines: impl IntoIterator<Item = S>) -> Self {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            header_width: None,
            names: Vec::new(),
            hold_last_until: None,
        }
    }

    pub fn holding_last_line_until(mut self, output: CollectedLines) -> Self {
        self.hold_last_until = Some(output);
        self
    }

    fn header_read(&self) -> bool {
        self.header_width.is_some_and(|width| self.names.len() == width)
    }
}

#[async_trait]
impl IntakeProvider for HeaderIntake {
    async fn get_line(&mut self) -> anyhow::Result<Option<ExternalLine>> {
        if self.lines.len() == 1 {
            if let Some(output) = &self.hold_last_until {
                let mut waited = Duration::ZERO;
                while output.all().is_empty() {
                    anyhow::ensure!(waited < Duration::from_secs(5), "output was not linked during intake");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    waited += Duration::from_millis(10);
                }
            }
        }
        let Some(text) = self.lines.pop_front() else {
            return Ok(None);
        };
        if self.header_width.is_none() {
            self.header_width = Some(self.tokenize(&text).len());
        }
        Ok(Some(ExternalLine::new(text, 1)))
    }

    fn tokenize(&self, line: &str) -> Vec<String> {
        line.split(',').map(|token| token.trim().to_string()).collect()
    }

    fn item_from_token(&mut self, token: &str, ordinal: usize) -> anyhow::Result<Option<RawItem>> {
        if !self.header_read() {
            self.names.push(token.to_string());
            return Ok(None);
        }
        Ok(self
            .names
            .get(ordinal - 1)
            .map(|name| RawItem::new(name.clone(), Some(token.to_string()))))
    }

    fn fields_in_use(&self) -> Vec<String> {
        self.names.clone()
    }

    fn has_header_row(&self) -> bool {
        true
    }

    fn header_row_complete(&self) -> bool {
        self.header_read()
    }
}

/// Observer that keeps every notification.
#[derive(Default)]
pub struct Recorder {
    pub started: Mutex<Vec<Phase>>,
    pub finished: Mutex<Vec<PhaseStatus>>,
    pub progress: Mutex<Vec<PhaseStatus>>,
    pub errors: Mutex<Vec<(String, String, String)>>,
    /// Phase notifications in arrival order, e.g. "start intake".
    pub timeline: Mutex<Vec<String>>,
}

impl PipelineObserver for Recorder {
    fn phase_starting(&self, status: &PhaseStatus) {
        self.started.lock().unwrap().push(status.phase);
        self.timeline.lock().unwrap().push(format!("start {}", status.phase));
    }

    fn phase_finished(&self, status: &PhaseStatus) {
        self.finished.lock().unwrap().push(*status);
        self.timeline.lock().unwrap().push(format!("finish {}", status.phase));
    }

    fn progress_changed(&self, status: &PhaseStatus) {
        self.progress.lock().unwrap().push(*status);
    }

    fn error_occurred(&self, event: &ErrorEvent<'_>) {
        self.errors.lock().unwrap().push((
            event.origin_label().to_string(),
            event.context.to_string(),
            event.error.to_string(),
        ));
    }
}
