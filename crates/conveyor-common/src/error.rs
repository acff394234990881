//! Error types shared across the Conveyor workspace

use thiserror::Error;

/// Result type alias for Conveyor operations
pub type Result<T> = std::result::Result<T, ConveyorError>;

/// Main error type for Conveyor hosts and utilities
#[derive(Error, Debug)]
pub enum ConveyorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup error: {0}")]
    Logging(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for ConveyorError {
    fn from(err: anyhow::Error) -> Self {
        ConveyorError::Unknown(format!("{:#}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt");
        let err: ConveyorError = io.into();
        assert!(matches!(err, ConveyorError::Io(_)));
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn test_anyhow_context_is_kept() {
        let err: ConveyorError = anyhow::anyhow!("inner").context("outer").into();
        assert_eq!(err.to_string(), "Unknown error: outer: inner");
    }
}
