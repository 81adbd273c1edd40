use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error codes the orchestrator itself produces.
pub mod codes {
    pub const MAX_RETRIES_EXCEEDED: &str = "MAX_RETRIES_EXCEEDED";
    pub const CIRCUIT_BREAKER_OPEN: &str = "CIRCUIT_BREAKER_OPEN";
    pub const ACT_EXECUTION_FAILED: &str = "ACT_EXECUTION_FAILED";
    pub const STEP_TIMEOUT: &str = "STEP_TIMEOUT";
    pub const EMPTY_DATASET: &str = "EMPTY_DATASET";
    pub const UNPARSEABLE_RESPONSE: &str = "UNPARSEABLE_RESPONSE";
    pub const MALFORMED_INPUT: &str = "MALFORMED_INPUT";
    pub const EVALUATION_FAILED: &str = "EVALUATION_FAILED";
    pub const TASK_CANCELLED: &str = "TASK_CANCELLED";
    pub const TASK_EXECUTION_FAILED: &str = "TASK_EXECUTION_FAILED";
    pub const TOTAL_TIMEOUT: &str = "TOTAL_TIMEOUT";
    pub const PHASE_PANICKED: &str = "PHASE_PANICKED";
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Data,
    ColumnNotFound,
    AiService,
    CodeExecution,
    Network,
    Storage,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Data => "data",
            Self::ColumnNotFound => "column_not_found",
            Self::AiService => "ai_service",
            Self::CodeExecution => "code_execution",
            Self::Network => "network",
            Self::Storage => "storage",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Validation => Severity::Medium,
            Self::Data => Severity::High,
            Self::ColumnNotFound => Severity::Medium,
            Self::AiService => Severity::High,
            Self::CodeExecution => Severity::Critical,
            Self::Network => Severity::Medium,
            Self::Storage => Severity::High,
            Self::Timeout => Severity::Medium,
            Self::Unknown => Severity::Medium,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::AiService | Self::Network | Self::Timeout)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// A classified task fault. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskError {
    pub id: Uuid,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
    pub severity: Severity,
}

impl TaskError {
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            category,
            code: code.into(),
            message: message.into(),
            details: None,
            timestamp: Utc::now(),
            retryable: category.is_retryable(),
            severity: category.severity(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.category, self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::AiService.is_retryable());
        assert!(ErrorCategory::Network.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::CodeExecution.is_retryable());
        assert!(!ErrorCategory::ColumnNotFound.is_retryable());
    }

    #[test]
    fn test_fixed_severities() {
        assert_eq!(ErrorCategory::CodeExecution.severity(), Severity::Critical);
        assert_eq!(ErrorCategory::AiService.severity(), Severity::High);
        assert_eq!(ErrorCategory::Validation.severity(), Severity::Medium);
        assert!(Severity::Critical > Severity::Low);
    }

    #[test]
    fn test_task_error_takes_category_defaults() {
        let error = TaskError::new(ErrorCategory::Timeout, codes::STEP_TIMEOUT, "slow");
        assert!(error.retryable);
        assert_eq!(error.severity, Severity::Medium);
        assert!(error.is(codes::STEP_TIMEOUT));
        assert_eq!(error.to_string(), "[timeout:STEP_TIMEOUT] slow");
    }

    #[test]
    fn test_category_serialization() {
        let json = serde_json::to_string(&ErrorCategory::ColumnNotFound).unwrap();
        assert_eq!(json, "\"column_not_found\"");
    }
}
