use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::evaluation::QualityReport;
use super::fault::TaskError;
use super::task::{StepStatus, Task, TaskStatus};

/// Output tables produced by the sandbox, keyed by output file name.
pub type OutputData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionSummary {
    pub total_steps: usize,
    pub successful_steps: usize,
    pub failed_steps: usize,
    pub retried_steps: usize,
    pub total_time_ms: u64,
    pub average_step_time_ms: u64,
}

impl ExecutionSummary {
    pub fn from_task(task: &Task, now: DateTime<Utc>) -> Self {
        let total_steps = task.steps.len();
        let successful_steps = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count();
        let failed_steps = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .count();
        let retried_steps = task.steps.iter().map(|s| s.retries as usize).sum();
        let total_time_ms = (now - task.metadata.created_at).num_milliseconds().max(0) as u64;

        Self {
            total_steps,
            successful_steps,
            failed_steps,
            retried_steps,
            total_time_ms,
            average_step_time_ms: total_time_ms / total_steps.max(1) as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub completed_at: DateTime<Utc>,
    pub session_id: Uuid,
    pub task_id: Uuid,
    pub final_status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub data: Option<OutputData>,
    pub logs: Vec<String>,
    pub quality_report: Option<QualityReport>,
    pub execution_summary: ExecutionSummary,
    pub metadata: ResultMetadata,
    pub error: Option<TaskError>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::fault::{ErrorCategory, TaskError};

    #[test]
    fn test_summary_counts_steps() {
        let mut task = Task::new("p", Vec::new(), Uuid::new_v4());

        let observe = task.begin_step(TaskStatus::Observing);
        task.step_mut(observe).unwrap().complete();

        let think = task.begin_step(TaskStatus::Thinking);
        task.step_mut(think).unwrap().retries = 2;
        task.step_mut(think).unwrap().complete();

        let act = task.begin_step(TaskStatus::Acting);
        task.step_mut(act)
            .unwrap()
            .fail(TaskError::new(ErrorCategory::CodeExecution, "X", "y"));

        let summary = ExecutionSummary::from_task(&task, Utc::now());
        assert_eq!(summary.total_steps, 3);
        assert_eq!(summary.successful_steps, 2);
        assert_eq!(summary.failed_steps, 1);
        assert_eq!(summary.retried_steps, 2);
    }

    #[test]
    fn test_summary_of_empty_task() {
        let task = Task::new("p", Vec::new(), Uuid::new_v4());
        let summary = ExecutionSummary::from_task(&task, Utc::now());
        assert_eq!(summary.total_steps, 0);
        assert_eq!(summary.failed_steps, 0);
    }
}
