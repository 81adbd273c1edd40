use std::time::Instant;

use serde_json::{json, Value};
use sheetflow_core::{
    codes, Datasets, ErrorCategory, ExecutionPlan, FilePreview, OutputData, TaskError,
};
use tracing::{debug, info, warn};

use super::{CallFailure, PhaseFailure, StepGuard};
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::ErrorClassifier;
use crate::collaborators::{ExecutionSandbox, ReasoningService};
use crate::response_parser::ReasoningResponse;

/// Longest code excerpt attached to a failure for diagnostics.
const CODE_FRAGMENT_CHARS: usize = 500;

/// Per-task bound on failed Act attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryCeiling {
    pub used: u32,
    pub limit: u32,
}

impl RetryCeiling {
    pub fn new(used: u32, limit: u32) -> Self {
        Self { used, limit }
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    fn exceeded(&self, last: Option<&TaskError>) -> TaskError {
        let error = TaskError::new(
            ErrorCategory::Unknown,
            codes::MAX_RETRIES_EXCEEDED,
            format!("Act failed {} times; retry ceiling is {}", self.used, self.limit),
        );
        match last {
            Some(last) => error.with_details(json!({ "last_error": last })),
            None => error,
        }
    }
}

pub struct ActRequest<'a> {
    pub user_input: &'a str,
    pub plan: &'a ExecutionPlan,
    pub previews: &'a [FilePreview],
    pub datasets: &'a Datasets,
    pub hint: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct ActOutcome {
    pub output: OutputData,
    pub code: String,
    pub duration_ms: u64,
}

pub struct ActRunner<'a> {
    pub reasoning: &'a dyn ReasoningService,
    pub sandbox: &'a dyn ExecutionSandbox,
    pub breaker: &'a CircuitBreaker,
    pub guard: &'a StepGuard,
}

impl ActRunner<'_> {
    /// One Act attempt: generate code, then execute it.
    ///
    /// The ceiling and the breaker are checked before anything goes out. A
    /// failed attempt bumps `ceiling.used` and records a failed breaker call;
    /// if that reaches the limit the ceiling error is returned instead. A
    /// cancelled or dropped attempt records nothing and frees its breaker
    /// permit.
    pub async fn run(
        &self,
        request: &ActRequest<'_>,
        ceiling: &mut RetryCeiling,
    ) -> Result<ActOutcome, PhaseFailure> {
        if ceiling.is_exhausted() {
            return Err(ceiling.exceeded(None).into());
        }
        if request.previews.is_empty() || request.datasets.is_empty() {
            return Err(TaskError::new(
                ErrorCategory::Data,
                codes::EMPTY_DATASET,
                "No non-empty sheet to process",
            )
            .into());
        }
        let Some(permit) = self.breaker.admit() else {
            return Err(TaskError::new(
                ErrorCategory::AiService,
                codes::CIRCUIT_BREAKER_OPEN,
                "Circuit breaker is open; external calls are suspended",
            )
            .into());
        };

        let started = Instant::now();
        match self.attempt(request).await {
            Ok((output, code)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                permit.record(true, duration_ms);
                info!(duration_ms, outputs = output.len(), "Act succeeded");
                Ok(ActOutcome {
                    output,
                    code,
                    duration_ms,
                })
            }
            Err(PhaseFailure::Cancelled) => {
                if permit.is_probe() {
                    debug!("Cancelled during a half-open probe");
                }
                drop(permit);
                Err(PhaseFailure::Cancelled)
            }
            Err(PhaseFailure::Error(error)) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                permit.record(false, duration_ms);
                ceiling.used += 1;
                warn!(
                    failures = ceiling.used,
                    limit = ceiling.limit,
                    error = %error,
                    "Act failed"
                );

                if ceiling.is_exhausted() {
                    Err(ceiling.exceeded(Some(&error)).into())
                } else {
                    Err(error.into())
                }
            }
        }
    }

    async fn attempt(&self, request: &ActRequest<'_>) -> Result<(OutputData, String), PhaseFailure> {
        let prompt = code_prompt(request);

        let response = self
            .guard
            .run(self.reasoning.generate_code(&prompt, request.previews))
            .await
            .map_err(|failure| map_failure(failure, "code generation", None))?;

        let code = match response {
            ReasoningResponse::Parsed(generated) => generated.code,
            ReasoningResponse::PartiallyRecovered(generated) => {
                warn!("Using partially recovered reasoning response");
                generated.code
            }
            ReasoningResponse::Failed { explanation, raw_excerpt } => {
                return Err(TaskError::new(
                    ErrorCategory::AiService,
                    codes::UNPARSEABLE_RESPONSE,
                    explanation,
                )
                .with_details(json!({ "raw_excerpt": raw_excerpt }))
                .into());
            }
        };

        debug!(code_len = code.len(), "Executing generated code");
        let output = self
            .guard
            .run(
                self.sandbox
                    .execute(&code, request.datasets, self.guard.limit()),
            )
            .await
            .map_err(|failure| map_failure(failure, "sandbox execution", Some(&code)))?;

        Ok((output, code))
    }
}

fn map_failure(failure: CallFailure, operation: &str, code: Option<&str>) -> PhaseFailure {
    let error = match failure {
        CallFailure::Cancelled => return PhaseFailure::Cancelled,
        CallFailure::TimedOut(limit) => ErrorClassifier::step_timeout(operation, limit),
        CallFailure::Fault(fault) => ErrorClassifier::classify(&fault, codes::ACT_EXECUTION_FAILED),
    };

    match code {
        Some(code) => PhaseFailure::Error(attach_code(error, code)),
        None => PhaseFailure::Error(error),
    }
}

fn attach_code(mut error: TaskError, code: &str) -> TaskError {
    let fragment: String = code.chars().take(CODE_FRAGMENT_CHARS).collect();
    let mut details = match error.details.take() {
        Some(Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    details.insert("code_fragment".to_string(), Value::String(fragment));
    error.details = Some(Value::Object(details));
    error
}

fn code_prompt(request: &ActRequest<'_>) -> String {
    let mut prompt = format!(
        "{}\n\nFollow this plan:\n{}",
        request.user_input.trim(),
        request.plan.outline()
    );
    if let Some(hint) = request.hint {
        prompt.push_str("\n\nThe previous attempt failed. ");
        prompt.push_str(hint);
    }
    prompt
}
