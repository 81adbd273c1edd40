//! Repair strategy selection and application.
//!
//! [`RepairEngine::analyze`] proposes candidates for a classified error,
//! ordered by descending priority. [`RepairEngine::apply`] turns one
//! candidate into a [`RepairAction`] for the orchestrator to carry out. The
//! engine never re-runs phases itself; looping and budgets belong to the
//! orchestrator.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sheetflow_core::{ErrorCategory, OutputData, RepairStrategy, StrategyKind, TaskError};
use tracing::{debug, info};

use crate::cache::ResultCache;
use crate::classifier::ErrorClassifier;

fn syntax_error() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(?:SyntaxError|IndentationError)\b").expect("Invalid syntax error regex")
    })
}

/// What the orchestrator should do after a strategy was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairAction {
    /// Run Act again with `hint` appended to the code-generation prompt.
    RerunAct { hint: String },
    /// Skip Act and evaluate a previously cached output.
    UseCachedOutput { output: OutputData },
    /// Run Act once more unchanged, if budget allows.
    ManualRetryRequired,
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairResult {
    pub success: bool,
    pub applied_strategy: RepairStrategy,
    pub remaining_errors: Vec<TaskError>,
    pub attempt_number: u32,
    pub can_continue: bool,
    /// `None` when the strategy could not be applied.
    pub action: Option<RepairAction>,
}

/// Facts about the running task a strategy may draw on.
#[derive(Debug, Clone, Default)]
pub struct RepairContext {
    pub attempt_number: u32,
    pub available_columns: Vec<String>,
    pub cache_key: Option<String>,
}

pub struct RepairEngine {
    cache: Arc<ResultCache>,
}

impl RepairEngine {
    pub fn new(cache: Arc<ResultCache>) -> Self {
        Self { cache }
    }

    pub fn analyze(&self, error: &TaskError) -> Vec<RepairStrategy> {
        let mut strategies = Self::catalogue(error);
        strategies.push(RepairStrategy::user_intervention(
            "Automatic repair exhausted; manual intervention required",
        ));
        strategies.sort_by(|a, b| b.priority.cmp(&a.priority));

        debug!(
            category = %error.category,
            candidates = strategies.len(),
            "Repair strategies analysed"
        );
        strategies
    }

    fn catalogue(error: &TaskError) -> Vec<RepairStrategy> {
        use StrategyKind::*;

        match error.category {
            ErrorCategory::ColumnNotFound => vec![
                RepairStrategy::new(
                    CodeFix,
                    "fix_column_reference",
                    "Analyze and fix column name error",
                    90,
                    0.7,
                ),
                RepairStrategy::new(
                    SimpleApproach,
                    "use_basic_operations",
                    "Use simplified data processing",
                    60,
                    0.5,
                ),
            ],
            ErrorCategory::CodeExecution => {
                let mut strategies = Vec::with_capacity(4);
                if syntax_error().is_match(&error.message) {
                    strategies.push(RepairStrategy::new(
                        CodeFix,
                        "fix_syntax",
                        "Fix Python syntax error",
                        100,
                        0.4,
                    ));
                }
                strategies.extend([
                    RepairStrategy::new(
                        CodeFix,
                        "analyze_and_fix",
                        "Analyze and attempt to fix code error",
                        80,
                        0.3,
                    ),
                    RepairStrategy::new(
                        SimpleApproach,
                        "simplify_logic",
                        "Use simplified processing approach",
                        60,
                        0.5,
                    ),
                    RepairStrategy::new(
                        Retry,
                        "regenerate_code",
                        "Retry with new code generation",
                        40,
                        0.4,
                    ),
                ]);
                strategies
            }
            ErrorCategory::AiService => vec![
                RepairStrategy::new(
                    Fallback,
                    "use_cache",
                    "Use cached response or simplified approach",
                    90,
                    0.8,
                ),
                RepairStrategy::new(Retry, "retry_ai_call", "Retry AI service call", 70, 0.6),
            ],
            ErrorCategory::Data => vec![RepairStrategy::new(
                SimpleApproach,
                "clean_data",
                "Clean and normalize data",
                70,
                0.6,
            )],
            _ => vec![
                RepairStrategy::new(SimpleApproach, "simplify", "Use simplified approach", 60, 0.5),
                RepairStrategy::new(Retry, "simple_retry", "Retry the operation", 40, 0.3),
            ],
        }
    }

    pub fn apply(
        &self,
        strategy: &RepairStrategy,
        error: &TaskError,
        context: &RepairContext,
    ) -> RepairResult {
        info!(
            strategy = %strategy.kind,
            action = %strategy.action,
            attempt = context.attempt_number,
            "Applying repair strategy"
        );

        let action = match strategy.kind {
            StrategyKind::Retry => Some(RepairAction::ManualRetryRequired),
            StrategyKind::CodeFix => Some(RepairAction::RerunAct {
                hint: code_fix_hint(error, &context.available_columns),
            }),
            StrategyKind::SimpleApproach => Some(RepairAction::RerunAct {
                hint: simple_approach_hint(strategy, error),
            }),
            StrategyKind::Fallback => context
                .cache_key
                .as_deref()
                .and_then(|key| self.cache.get(key))
                .map(|output| RepairAction::UseCachedOutput { output }),
            StrategyKind::UserIntervention => Some(RepairAction::Abort),
        };

        let success = !matches!(action, None | Some(RepairAction::Abort));
        RepairResult {
            success,
            applied_strategy: strategy.clone(),
            remaining_errors: if success { Vec::new() } else { vec![error.clone()] },
            attempt_number: context.attempt_number,
            can_continue: strategy.kind != StrategyKind::UserIntervention,
            action,
        }
    }
}

/// Concrete guidance for the next code-generation round, derived from the
/// failure message.
pub fn code_fix_hint(error: &TaskError, available_columns: &[String]) -> String {
    let message = &error.message;
    let mut hint = if message.contains("NameError") || message.contains("name '") {
        "Check that every variable is defined and that column names are spelled exactly as in the data.".to_string()
    } else if ErrorClassifier::is_missing_column(message) || message.contains("column") {
        "A referenced column does not exist. Use only the available column names.".to_string()
    } else if message.contains("IndentationError") {
        "Fix the code indentation; use four spaces consistently.".to_string()
    } else if message.contains("SyntaxError") {
        "Fix the Python syntax error; make sure brackets and quotes are balanced.".to_string()
    } else {
        "Analyze the error and correct the code.".to_string()
    };

    if !available_columns.is_empty() {
        hint.push_str(&format!(
            " Available columns: {}.",
            available_columns.join(", ")
        ));
    }
    format!("{hint} Previous error: {message}")
}

fn simple_approach_hint(strategy: &RepairStrategy, error: &TaskError) -> String {
    if error.category == ErrorCategory::Data || strategy.action == "clean_data" {
        "Clean the data first: drop empty rows, trim text, coerce numeric columns, then retry the transformation.".to_string()
    } else {
        "Use the simplest approach possible: plain pandas operations, no chained transformations, one output table.".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetflow_core::codes;

    fn engine() -> RepairEngine {
        RepairEngine::new(Arc::new(ResultCache::new()))
    }

    fn execution_error(message: &str) -> TaskError {
        TaskError::new(
            ErrorCategory::CodeExecution,
            codes::ACT_EXECUTION_FAILED,
            message,
        )
    }

    #[test]
    fn test_syntax_error_prefers_syntax_fix() {
        let strategies = engine().analyze(&execution_error("SyntaxError: invalid syntax"));
        assert_eq!(strategies[0].kind, StrategyKind::CodeFix);
        assert_eq!(strategies[0].action, "fix_syntax");
        assert!(strategies
            .windows(2)
            .all(|pair| pair[0].priority >= pair[1].priority));
        assert_eq!(
            strategies.last().map(|s| s.kind),
            Some(StrategyKind::UserIntervention)
        );
    }

    #[test]
    fn test_generic_execution_error_has_no_syntax_fix() {
        let strategies = engine().analyze(&execution_error("ZeroDivisionError"));
        let kinds: Vec<_> = strategies.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["analyze_and_fix", "simplify_logic", "regenerate_code", ""]
        );
    }

    #[test]
    fn test_catalogue_by_category() {
        let engine = engine();
        let column = TaskError::new(ErrorCategory::ColumnNotFound, "X", "KeyError: 'a'");
        assert_eq!(engine.analyze(&column)[0].action, "fix_column_reference");

        let ai = TaskError::new(ErrorCategory::AiService, "X", "503");
        assert_eq!(engine.analyze(&ai)[0].kind, StrategyKind::Fallback);

        let data = TaskError::new(ErrorCategory::Data, "X", "empty");
        assert_eq!(engine.analyze(&data)[0].action, "clean_data");

        let timeout = TaskError::new(ErrorCategory::Timeout, "X", "slow");
        assert_eq!(engine.analyze(&timeout)[0].kind, StrategyKind::SimpleApproach);
    }

    #[test]
    fn test_retry_surfaces_manual_retry() {
        let engine = engine();
        let error = execution_error("boom");
        let retry = RepairStrategy::new(StrategyKind::Retry, "regenerate_code", "r", 40, 0.4);

        let result = engine.apply(&retry, &error, &RepairContext::default());
        assert!(result.success);
        assert!(result.can_continue);
        assert_eq!(result.action, Some(RepairAction::ManualRetryRequired));
    }

    #[test]
    fn test_code_fix_hint_lists_columns() {
        let engine = engine();
        let error = TaskError::new(ErrorCategory::ColumnNotFound, "X", "KeyError: 'Revenue'");
        let strategy = engine.analyze(&error).remove(0);
        let context = RepairContext {
            attempt_number: 1,
            available_columns: vec!["Sales".to_string(), "Region".to_string()],
            cache_key: None,
        };

        let result = engine.apply(&strategy, &error, &context);
        match result.action {
            Some(RepairAction::RerunAct { hint }) => {
                assert!(hint.contains("Sales, Region"));
                assert!(hint.contains("KeyError: 'Revenue'"));
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(result.attempt_number, 1);
    }

    #[test]
    fn test_fallback_needs_cache_hit() {
        let cache = Arc::new(ResultCache::new());
        let engine = RepairEngine::new(cache.clone());
        let error = TaskError::new(ErrorCategory::AiService, "X", "503");
        let fallback = engine.analyze(&error).remove(0);
        let context = RepairContext {
            cache_key: Some("key".to_string()),
            ..Default::default()
        };

        let miss = engine.apply(&fallback, &error, &context);
        assert!(!miss.success);
        assert!(miss.can_continue);
        assert!(miss.action.is_none());
        assert_eq!(miss.remaining_errors.len(), 1);

        let output = json!({"out": [1]}).as_object().cloned().unwrap();
        cache.insert("key".to_string(), output.clone());
        let hit = engine.apply(&fallback, &error, &context);
        assert!(hit.success);
        assert_eq!(hit.action, Some(RepairAction::UseCachedOutput { output }));
    }

    #[test]
    fn test_user_intervention_aborts() {
        let result = engine().apply(
            &RepairStrategy::user_intervention("manual"),
            &execution_error("boom"),
            &RepairContext::default(),
        );
        assert!(!result.success);
        assert!(!result.can_continue);
        assert_eq!(result.action, Some(RepairAction::Abort));
    }
}
