//! Outcome of a pipeline run.

use std::collections::BTreeMap;

use crate::global_cache::CacheValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// Every intake line was processed.
    IntakeDepleted,
    /// Intake stopped at the configured record limit.
    LimitReached,
    Canceled,
    TimedOut,
    /// Caller-supplied code failed; see [`ProcessResult::error`].
    Failed,
    /// A provider could not be initialized; no stage ran.
    InitializationError,
    /// The orchestrator was already executed or disposed.
    InvalidAttempt,
}

impl CompletionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, CompletionStatus::IntakeDepleted | CompletionStatus::LimitReached)
    }
}

impl std::fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    pub status: CompletionStatus,
    pub rows_read: u64,
    pub clusters_read: u64,
    pub clusters_written: u64,
    pub rows_written: u64,
    /// Global cache contents at the end of the run.
    pub global_cache: BTreeMap<String, CacheValue>,
    /// Description of the root-cause fault, for `Failed` and `InitializationError`.
    pub error: Option<String>,
}

impl ProcessResult {
    pub(crate) fn empty(status: CompletionStatus) -> Self {
        Self {
            status,
            rows_read: 0,
            clusters_read: 0,
            clusters_written: 0,
            rows_written: 0,
            global_cache: BTreeMap::new(),
            error: None,
        }
    }
}
