use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Continue,
    Retry,
    Repair,
    Complete,
    Fail,
}

impl NextAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continue => "continue",
            Self::Retry => "retry",
            Self::Repair => "repair",
            Self::Complete => "complete",
            Self::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Issues {
    pub critical: Vec<String>,
    pub warning: Vec<String>,
    pub info: Vec<String>,
}

impl Issues {
    pub fn total(&self) -> usize {
        self.critical.len() + self.warning.len()
    }
}

/// The three quality axes, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityScores {
    pub completeness: f64,
    pub accuracy: f64,
    pub consistency: f64,
}

impl QualityScores {
    pub fn average(&self) -> f64 {
        (self.completeness + self.accuracy + self.consistency) / 3.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub passed: bool,
    pub quality_score: f64,
    pub next_action: NextAction,
    pub issues: Issues,
    pub scores: QualityScores,
    pub suggestions: Vec<String>,
}

impl EvaluationResult {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            passed: false,
            quality_score: 0.0,
            next_action: NextAction::Fail,
            issues: Issues {
                critical: vec![reason.into()],
                ..Default::default()
            },
            scores: QualityScores::default(),
            suggestions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QualityMetrics {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub retried_steps: usize,
    pub total_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    pub overall_quality: f64,
    pub scores: QualityScores,
    pub total_issues: usize,
    pub critical_issues: usize,
    pub suggestions: Vec<String>,
    pub metrics: QualityMetrics,
}

impl QualityReport {
    pub fn from_evaluation(evaluation: &EvaluationResult, metrics: QualityMetrics) -> Self {
        Self {
            overall_quality: evaluation.quality_score,
            scores: evaluation.scores,
            total_issues: evaluation.issues.total(),
            critical_issues: evaluation.issues.critical.len(),
            suggestions: evaluation.suggestions.clone(),
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_score() {
        let scores = QualityScores {
            completeness: 0.9,
            accuracy: 0.8,
            consistency: 1.0,
        };
        assert!((scores.average() - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_failed_evaluation() {
        let evaluation = EvaluationResult::failed("Execution step failed");
        assert!(!evaluation.passed);
        assert_eq!(evaluation.next_action, NextAction::Fail);
        assert_eq!(evaluation.issues.critical.len(), 1);
    }

    #[test]
    fn test_report_counts_issues() {
        let mut evaluation = EvaluationResult::failed("bad");
        evaluation.issues.warning.push("incomplete".to_string());
        evaluation.issues.info.push("fyi".to_string());

        let report = QualityReport::from_evaluation(&evaluation, QualityMetrics::default());
        assert_eq!(report.total_issues, 2);
        assert_eq!(report.critical_issues, 1);
    }
}
