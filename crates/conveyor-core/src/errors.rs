//! Pipeline error model and stage origin labels.

use thiserror::Error;

/// The pipeline stage (or startup step) an error originated from.
///
/// The `Display` form is the label reported through `ErrorOccurred`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageOrigin {
    Initialization,
    LineParsing,
    Clustering,
    Transforming,
    Holding,
    Unclustering,
    Formatting,
    Output,
}

impl StageOrigin {
    pub fn label(self) -> &'static str {
        match self {
            StageOrigin::Initialization => "initialization",
            StageOrigin::LineParsing => "line parsing block",
            StageOrigin::Clustering => "clustering block",
            StageOrigin::Transforming => "transforming block",
            StageOrigin::Holding => "holding block",
            StageOrigin::Unclustering => "unclustering block",
            StageOrigin::Formatting => "formatting block",
            StageOrigin::Output => "output block",
        }
    }
}

impl std::fmt::Display for StageOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Errors surfaced by the engine and by the data model APIs handed to caller code.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Caller-supplied code (marker, transformer, router, type definer, provider)
    /// failed or panicked.
    #[error("{origin} failed {context}: {source:#}")]
    CallerFault {
        origin: StageOrigin,
        context: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("global cache key not found: {0}")]
    KeyNotFound(String),

    #[error("global cache key '{key}' does not hold {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    #[error("unsupported operation on read-only {0}")]
    UnsupportedOperation(&'static str),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("initialization failed: {0:#}")]
    Initialization(#[source] anyhow::Error),

    #[error("pipeline canceled")]
    Canceled,

    #[error("orchestrator has already been executed or disposed")]
    InvalidAttempt,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn caller_fault(
        origin: StageOrigin,
        context: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::CallerFault {
            origin,
            context: context.into(),
            source,
        }
    }

    /// Returns `true` for the cooperative-unwind error produced when a stage
    /// observed cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_labels() {
        assert_eq!(StageOrigin::Transforming.to_string(), "transforming block");
        assert_eq!(StageOrigin::Clustering.label(), "clustering block");
        assert_eq!(StageOrigin::Initialization.label(), "initialization");
    }

    #[test]
    fn test_caller_fault_display_includes_context() {
        let err = PipelineError::caller_fault(
            StageOrigin::Transforming,
            "at cluster #3",
            anyhow::anyhow!("boom"),
        );
        assert_eq!(err.to_string(), "transforming block failed at cluster #3: boom");
        assert!(!err.is_canceled());
        assert!(PipelineError::Canceled.is_canceled());
    }
}
