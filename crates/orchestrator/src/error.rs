use sheetflow_core::{CoreError, TaskError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("A task is already running on this orchestrator")]
    TaskInProgress,

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task exceeded total timeout of {duration_ms}ms")]
    TotalTimeout { duration_ms: u64 },

    #[error("Retry ceiling reached: {0}")]
    RetryCeilingExceeded(TaskError),

    #[error("Phase {phase} panicked: {message}")]
    PhasePanicked { phase: String, message: String },

    #[error("State store error: {0}")]
    StateStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl OrchestratorError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// True for errors raised before a task was created.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidConfig(_) | Self::InvalidInput(_) | Self::TaskInProgress
        )
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_core::{codes, ErrorCategory};

    #[test]
    fn test_ceiling_error_display_carries_code() {
        let error = OrchestratorError::RetryCeilingExceeded(TaskError::new(
            ErrorCategory::Unknown,
            codes::MAX_RETRIES_EXCEEDED,
            "limit 10 reached",
        ));
        assert!(error.to_string().contains("MAX_RETRIES_EXCEEDED"));
        assert!(!error.is_rejection());
    }

    #[test]
    fn test_serde_error_conversion() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: OrchestratorError = err.into();
        assert!(matches!(error, OrchestratorError::Serialization(_)));
    }
}
