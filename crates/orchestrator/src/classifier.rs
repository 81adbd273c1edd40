use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::json;
use sheetflow_core::{codes, ErrorCategory, TaskError};

use crate::collaborators::{CollaboratorError, FaultKind};

fn missing_column() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bKeyError\b|column\s+\S.*\bnot\s+found|no\s+such\s+column")
            .expect("Invalid missing column regex pattern")
    })
}

/// Maps collaborator faults onto the task error taxonomy.
pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn category_for(fault: &CollaboratorError) -> ErrorCategory {
        match fault.kind {
            FaultKind::Timeout => ErrorCategory::Timeout,
            FaultKind::Network => ErrorCategory::Network,
            FaultKind::Unavailable | FaultKind::InvalidResponse | FaultKind::RateLimited => {
                ErrorCategory::AiService
            }
            FaultKind::Execution if Self::is_missing_column(&fault.message) => {
                ErrorCategory::ColumnNotFound
            }
            FaultKind::Execution => ErrorCategory::CodeExecution,
            FaultKind::Storage => ErrorCategory::Storage,
            FaultKind::InvalidInput => ErrorCategory::Validation,
            FaultKind::Data => ErrorCategory::Data,
            FaultKind::Other => ErrorCategory::Unknown,
        }
    }

    pub fn classify(fault: &CollaboratorError, code: &str) -> TaskError {
        TaskError::new(Self::category_for(fault), code, fault.message.clone())
            .with_details(json!({ "fault": fault.kind.as_str() }))
    }

    pub fn step_timeout(operation: &str, limit: Duration) -> TaskError {
        TaskError::new(
            ErrorCategory::Timeout,
            codes::STEP_TIMEOUT,
            format!("{operation} exceeded {}ms", limit.as_millis()),
        )
    }

    pub fn is_missing_column(message: &str) -> bool {
        missing_column().is_match(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetflow_core::Severity;

    #[test]
    fn test_fault_kind_mapping() {
        let cases = [
            (CollaboratorError::timeout("slow"), ErrorCategory::Timeout),
            (CollaboratorError::network("reset"), ErrorCategory::Network),
            (CollaboratorError::unavailable("503"), ErrorCategory::AiService),
            (
                CollaboratorError::new(FaultKind::RateLimited, "429"),
                ErrorCategory::AiService,
            ),
            (
                CollaboratorError::execution("ZeroDivisionError"),
                ErrorCategory::CodeExecution,
            ),
            (
                CollaboratorError::new(FaultKind::InvalidInput, "bad"),
                ErrorCategory::Validation,
            ),
            (
                CollaboratorError::new(FaultKind::Other, "?"),
                ErrorCategory::Unknown,
            ),
        ];

        for (fault, expected) in cases {
            assert_eq!(ErrorClassifier::category_for(&fault), expected, "{fault}");
        }
    }

    #[test]
    fn test_missing_column_detection() {
        assert!(ErrorClassifier::is_missing_column("KeyError: 'Revenue'"));
        assert!(ErrorClassifier::is_missing_column("column 'Revenue' not found"));
        assert!(ErrorClassifier::is_missing_column("no such column: total"));
        assert!(!ErrorClassifier::is_missing_column("SyntaxError: invalid syntax"));

        let fault = CollaboratorError::execution("KeyError: 'Revenue'");
        assert_eq!(
            ErrorClassifier::category_for(&fault),
            ErrorCategory::ColumnNotFound
        );
    }

    #[test]
    fn test_classify_sets_fixed_attributes() {
        let error = ErrorClassifier::classify(
            &CollaboratorError::execution("NameError: name 'df2' is not defined"),
            codes::ACT_EXECUTION_FAILED,
        );
        assert_eq!(error.category, ErrorCategory::CodeExecution);
        assert_eq!(error.severity, Severity::Critical);
        assert!(!error.retryable);
        assert_eq!(error.details.as_ref().unwrap()["fault"], "execution");
    }

    #[test]
    fn test_step_timeout() {
        let error = ErrorClassifier::step_timeout("reasoning call", Duration::from_millis(250));
        assert!(error.is(codes::STEP_TIMEOUT));
        assert!(error.retryable);
        assert!(error.message.contains("250ms"));
    }
}
