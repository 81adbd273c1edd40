use std::sync::OnceLock;

use regex::Regex;
use sheetflow_core::{ExecutionPlan, FilePreview, PlanStep};
use tracing::{debug, warn};

use super::observe::Observation;
use super::{CallFailure, PhaseFailure, StepGuard};
use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::ErrorClassifier;
use crate::collaborators::ReasoningService;
use crate::response_parser::ReasoningResponse;

/// Confidence assigned to the fallback plan.
pub const FALLBACK_CONFIDENCE: f64 = 0.5;

fn plan_step() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*(?:step\s+\d+\s*[:.\-]|\d+[.)])\s*(.+?)\s*$")
            .expect("Invalid plan step regex pattern")
    })
}

#[derive(Debug, Clone)]
pub struct ThinkOutcome {
    pub plan: ExecutionPlan,
    pub confidence: f64,
    /// Reasoning attempts beyond the first.
    pub retries: u32,
    /// Set when the plan is the basic-processing fallback.
    pub fallback_reason: Option<String>,
}

pub struct Thinker<'a> {
    pub reasoning: &'a dyn ReasoningService,
    pub breaker: &'a CircuitBreaker,
    pub guard: &'a StepGuard,
    pub max_attempts: u32,
}

impl Thinker<'_> {
    /// Asks the reasoning service for a plan. Never fails the task: retryable
    /// faults are retried, anything else falls back to a basic plan.
    pub async fn run(
        &self,
        user_input: &str,
        observation: &Observation,
        previews: &[FilePreview],
    ) -> Result<ThinkOutcome, PhaseFailure> {
        if previews.is_empty() {
            return Ok(fallback(0, "no data to reason about"));
        }
        if !self.breaker.would_allow() {
            return Ok(fallback(0, "circuit breaker open"));
        }

        let prompt = planning_prompt(user_input, observation);
        let attempts = self.max_attempts.max(1);
        let mut retries = 0;

        loop {
            let attempt = retries + 1;
            debug!(attempt, "Requesting plan from reasoning service");

            let error = match self
                .guard
                .run(self.reasoning.generate_code(&prompt, previews))
                .await
            {
                Ok(response) => return Ok(plan_from(response, retries)),
                Err(CallFailure::Cancelled) => return Err(PhaseFailure::Cancelled),
                Err(CallFailure::TimedOut(limit)) => {
                    ErrorClassifier::step_timeout("reasoning call", limit)
                }
                Err(CallFailure::Fault(fault)) => ErrorClassifier::classify(&fault, "THINK_FAILED"),
            };

            if error.retryable && attempt < attempts {
                warn!(attempt, error = %error, "Reasoning call failed, retrying");
                retries += 1;
                continue;
            }

            warn!(error = %error, "Reasoning unavailable, using basic plan");
            return Ok(fallback(retries, &error.message));
        }
    }
}

fn plan_from(response: ReasoningResponse, retries: u32) -> ThinkOutcome {
    let Some(generated) = response.generated() else {
        return fallback(retries, response.explanation());
    };

    let steps = extract_plan_steps(&generated.explanation);
    ThinkOutcome {
        plan: ExecutionPlan::new(steps),
        confidence: response.confidence(),
        retries,
        fallback_reason: None,
    }
}

fn fallback(retries: u32, reason: &str) -> ThinkOutcome {
    ThinkOutcome {
        plan: ExecutionPlan::basic_processing(),
        confidence: FALLBACK_CONFIDENCE,
        retries,
        fallback_reason: Some(reason.to_string()),
    }
}

/// Ordered steps listed in an explanation (`Step 1: ...`, `1. ...`, `1) ...`),
/// or a single "Data Processing" step when none are listed.
pub fn extract_plan_steps(explanation: &str) -> Vec<PlanStep> {
    let steps: Vec<PlanStep> = plan_step()
        .captures_iter(explanation)
        .filter_map(|caps| caps.get(1))
        .map(|title| title.as_str())
        .filter(|title| !title.is_empty())
        .map(|title| {
            let name = title.split([':', '.']).next().unwrap_or(title).trim();
            PlanStep::new(name, title)
        })
        .collect();

    if steps.is_empty() {
        vec![PlanStep::new("Data Processing", explanation.trim())]
    } else {
        steps
    }
}

fn planning_prompt(user_input: &str, observation: &Observation) -> String {
    format!(
        "Plan a data transformation.\n\nRequest:\n{}\n\nData overview:\n{}\n\n\
         Reply with JSON {{\"explanation\": \"...\", \"code\": \"...\"}}; \
         list the plan in the explanation as numbered steps.",
        user_input.trim(),
        observation.summary()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CollaboratorError;
    use crate::config::CircuitBreakerConfig;
    use crate::response_parser::GeneratedCode;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Scripted {
        failures: u32,
        fault: CollaboratorError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReasoningService for Scripted {
        async fn generate_code(
            &self,
            _prompt: &str,
            _previews: &[FilePreview],
        ) -> Result<ReasoningResponse, CollaboratorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(self.fault.clone());
            }
            Ok(ReasoningResponse::Parsed(GeneratedCode::new(
                "x = 1",
                "Step 1: Load the sheet\nStep 2: Sum column X",
            )))
        }
    }

    fn preview() -> Vec<FilePreview> {
        vec![FilePreview {
            file_name: "f.xlsx".to_string(),
            current_sheet: None,
            sheets: Vec::new(),
        }]
    }

    async fn think(service: &Scripted, max_attempts: u32) -> ThinkOutcome {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        let guard = StepGuard::new(Duration::from_secs(1), CancellationToken::new());
        Thinker {
            reasoning: service,
            breaker: &breaker,
            guard: &guard,
            max_attempts,
        }
        .run("sum X", &Observation::default(), &preview())
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_retries_timeouts_then_plans() {
        let service = Scripted {
            failures: 2,
            fault: CollaboratorError::timeout("slow"),
            calls: AtomicU32::new(0),
        };
        let outcome = think(&service, 3).await;

        assert_eq!(outcome.retries, 2);
        assert!(outcome.fallback_reason.is_none());
        assert_eq!(outcome.plan.steps.len(), 2);
        assert_eq!(outcome.plan.steps[1].name, "Sum column X");
    }

    #[tokio::test]
    async fn test_exhausted_retries_fall_back() {
        let service = Scripted {
            failures: 5,
            fault: CollaboratorError::unavailable("503"),
            calls: AtomicU32::new(0),
        };
        let outcome = think(&service, 3).await;

        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(outcome.plan.steps[0].name, "Basic Processing");
    }

    #[tokio::test]
    async fn test_non_retryable_fault_falls_back_at_once() {
        let service = Scripted {
            failures: 1,
            fault: CollaboratorError::new(crate::collaborators::FaultKind::InvalidInput, "bad"),
            calls: AtomicU32::new(0),
        };
        let outcome = think(&service, 3).await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.fallback_reason.is_some());
    }

    #[test]
    fn test_extract_plan_steps_formats() {
        let steps = extract_plan_steps("Plan:\n1. Filter rows\n2) Group by region\nStep 3: Sum. Then export");
        let names: Vec<_> = steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["Filter rows", "Group by region", "Sum"]);
    }

    #[test]
    fn test_extract_plan_steps_default() {
        let steps = extract_plan_steps("Just add the numbers together");
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "Data Processing");
        assert_eq!(steps[0].description, "Just add the numbers together");
    }
}
