use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::repair::RepairStrategy;

/// Default duration estimate for a plan, in milliseconds.
pub const DEFAULT_PLAN_DURATION_MS: u64 = 30_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanStepStatus {
    #[default]
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: PlanStepStatus,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl PlanStep {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: description.into(),
            status: PlanStepStatus::default(),
            input: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionPlan {
    pub id: Uuid,
    pub steps: Vec<PlanStep>,
    pub estimated_duration_ms: u64,
    pub required_resources: Vec<String>,
    #[serde(default)]
    pub fallback_strategies: HashMap<Uuid, Vec<RepairStrategy>>,
}

impl ExecutionPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self {
            id: Uuid::new_v4(),
            steps,
            estimated_duration_ms: DEFAULT_PLAN_DURATION_MS,
            required_resources: vec!["cpu".to_string(), "memory".to_string()],
            fallback_strategies: HashMap::new(),
        }
    }

    pub fn single_step(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(vec![PlanStep::new(name, description)])
    }

    /// Plan used when reasoning fails: one step, no AI optimisation.
    pub fn basic_processing() -> Self {
        Self::single_step(
            "Basic Processing",
            "Basic data processing without AI optimization",
        )
    }

    pub fn mark_all(&mut self, status: PlanStepStatus) {
        for step in &mut self.steps {
            step.status = status;
        }
    }

    /// Numbered step list, one per line.
    pub fn outline(&self) -> String {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}: {}", i + 1, step.name, step.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_processing_plan() {
        let plan = ExecutionPlan::basic_processing();
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].name, "Basic Processing");
        assert_eq!(plan.steps[0].status, PlanStepStatus::Pending);
        assert_eq!(plan.estimated_duration_ms, DEFAULT_PLAN_DURATION_MS);
    }

    #[test]
    fn test_outline_numbers_steps() {
        let plan = ExecutionPlan::new(vec![
            PlanStep::new("Load", "Read the sheet"),
            PlanStep::new("Sum", "Sum column X"),
        ]);
        assert_eq!(plan.outline(), "1. Load: Read the sheet\n2. Sum: Sum column X");
    }

    #[test]
    fn test_mark_all() {
        let mut plan = ExecutionPlan::single_step("A", "a");
        plan.mark_all(PlanStepStatus::Done);
        assert!(plan.steps.iter().all(|s| s.status == PlanStepStatus::Done));
    }
}
