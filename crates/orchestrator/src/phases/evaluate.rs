use std::collections::BTreeSet;

use serde_json::Value;
use sheetflow_core::{EvaluationResult, Issues, NextAction, OutputData, QualityScores, TaskContext};

/// Score below which a result is sent to repair rather than another cycle.
pub const REPAIR_BELOW: f64 = 0.5;

/// Consistency assigned to outputs without row tables.
const NON_TABULAR_CONSISTENCY: f64 = 0.8;

/// Accuracy scoring hook. There is no ground truth to score against yet, so
/// the default is a constant.
pub trait AccuracyScorer: Send + Sync {
    fn score(&self, output: &OutputData, context: &TaskContext) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct ConstantAccuracy(pub f64);

impl Default for ConstantAccuracy {
    fn default() -> Self {
        Self(0.8)
    }
}

impl AccuracyScorer for ConstantAccuracy {
    fn score(&self, _output: &OutputData, _context: &TaskContext) -> f64 {
        self.0
    }
}

pub fn evaluate(
    output: &OutputData,
    context: &TaskContext,
    scorer: &dyn AccuracyScorer,
    threshold: f64,
) -> EvaluationResult {
    let scores = QualityScores {
        completeness: completeness(output),
        accuracy: scorer.score(output, context).clamp(0.0, 1.0),
        consistency: consistency(output),
    };
    let quality_score = scores.average();
    let passed = quality_score >= threshold;

    let next_action = if passed {
        NextAction::Complete
    } else if quality_score >= REPAIR_BELOW {
        NextAction::Continue
    } else {
        NextAction::Repair
    };

    let mut issues = Issues::default();
    let mut suggestions = Vec::new();

    if output.is_empty() {
        issues.critical.push("Execution produced no output".to_string());
        suggestions.push("Make sure the code assigns its result to an output table".to_string());
    }
    for (name, value) in output {
        match value {
            Value::Array(rows) if rows.is_empty() => {
                issues.warning.push(format!("Output '{name}' is empty"));
            }
            Value::Array(rows) if table_consistency(rows).is_some_and(|c| c < 1.0) => {
                issues
                    .warning
                    .push(format!("Rows in output '{name}' have differing columns"));
                suggestions.push(format!("Normalize the columns of '{name}'"));
            }
            _ => {}
        }
    }
    issues.info.push(format!(
        "Quality score {quality_score:.2} against threshold {threshold:.2}"
    ));
    if !passed && suggestions.is_empty() {
        suggestions.push("Refine the transformation to raise result quality".to_string());
    }

    EvaluationResult {
        passed,
        quality_score,
        next_action,
        issues,
        scores,
        suggestions,
    }
}

/// 0 for empty output, otherwise 0.8 plus 0.1 per non-empty table, capped at 1.
fn completeness(output: &OutputData) -> f64 {
    if output.is_empty() {
        return 0.0;
    }
    let non_empty = output
        .values()
        .filter(|value| matches!(value, Value::Array(rows) if !rows.is_empty()))
        .count();
    (0.8 + 0.1 * non_empty as f64).min(1.0)
}

fn consistency(output: &OutputData) -> f64 {
    let tables: Vec<f64> = output
        .values()
        .filter_map(|value| match value {
            Value::Array(rows) => table_consistency(rows),
            _ => None,
        })
        .collect();

    if tables.is_empty() {
        NON_TABULAR_CONSISTENCY
    } else {
        tables.iter().sum::<f64>() / tables.len() as f64
    }
}

/// Share of rows whose key set matches the first row's; `None` unless the
/// table is a non-empty array of objects.
fn table_consistency(rows: &[Value]) -> Option<f64> {
    let keys = |row: &Value| -> Option<BTreeSet<String>> {
        row.as_object().map(|obj| obj.keys().cloned().collect())
    };
    let reference = keys(rows.first()?)?;
    let matching = rows
        .iter()
        .filter(|row| keys(row).as_ref() == Some(&reference))
        .count();
    Some(matching as f64 / rows.len() as f64)
}
