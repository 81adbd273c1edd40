//! The four OTAE phase runners.
//!
//! Runners know nothing about the task lock, events or persistence: they take
//! inputs, talk to collaborators through a [`StepGuard`], and report faults as
//! [`TaskError`] values. Only cancellation is reported separately.

pub mod act;
pub mod evaluate;
pub mod observe;
pub mod think;

use std::future::Future;
use std::time::Duration;

use sheetflow_core::TaskError;
use tokio_util::sync::CancellationToken;

use crate::collaborators::CollaboratorError;

pub use act::{ActOutcome, ActRequest, ActRunner, RetryCeiling};
pub use evaluate::{evaluate, AccuracyScorer, ConstantAccuracy};
pub use observe::{observe, Observation, SheetSummary};
pub use think::{extract_plan_steps, ThinkOutcome, Thinker};

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseFailure {
    Cancelled,
    Error(TaskError),
}

impl From<TaskError> for PhaseFailure {
    fn from(error: TaskError) -> Self {
        Self::Error(error)
    }
}

#[derive(Debug)]
pub enum CallFailure {
    Cancelled,
    TimedOut(Duration),
    Fault(CollaboratorError),
}

/// Races one external call against the per-step deadline and the task's
/// cancellation token. Losing futures are dropped.
#[derive(Debug, Clone)]
pub struct StepGuard {
    limit: Duration,
    cancel: CancellationToken,
}

impl StepGuard {
    pub fn new(limit: Duration, cancel: CancellationToken) -> Self {
        Self { limit, cancel }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }

    pub async fn run<T, F>(&self, call: F) -> Result<T, CallFailure>
    where
        F: Future<Output = Result<T, CollaboratorError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CallFailure::Cancelled),
            outcome = tokio::time::timeout(self.limit, call) => match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(fault)) => Err(CallFailure::Fault(fault)),
                Err(_) => Err(CallFailure::TimedOut(self.limit)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_guard_times_out() {
        let guard = StepGuard::new(Duration::from_millis(100), CancellationToken::new());
        let outcome = guard
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CollaboratorError>(1)
            })
            .await;
        assert!(matches!(outcome, Err(CallFailure::TimedOut(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guard_observes_cancellation() {
        let token = CancellationToken::new();
        let guard = StepGuard::new(Duration::from_secs(60), token.clone());
        token.cancel();
        let outcome = guard
            .run(std::future::pending::<Result<(), CollaboratorError>>())
            .await;
        assert!(matches!(outcome, Err(CallFailure::Cancelled)));
    }

    #[tokio::test]
    async fn test_guard_passes_faults_through() {
        let guard = StepGuard::new(Duration::from_secs(1), CancellationToken::new());
        let outcome = guard
            .run(async { Err::<(), _>(CollaboratorError::network("reset")) })
            .await;
        assert!(matches!(outcome, Err(CallFailure::Fault(_))));
    }
}
