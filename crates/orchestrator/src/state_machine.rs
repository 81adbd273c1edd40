use sheetflow_core::TaskStatus;

use crate::error::{OrchestratorError, Result};

pub struct TaskStateMachine;

impl TaskStateMachine {
    pub fn validate_transition(from: &TaskStatus, to: &TaskStatus) -> Result<()> {
        let allowed = Self::allowed_transitions(from);

        if allowed.contains(to) {
            Ok(())
        } else {
            Err(OrchestratorError::InvalidTransition {
                from: from.as_str().to_string(),
                to: to.as_str().to_string(),
            })
        }
    }

    pub fn allowed_transitions(from: &TaskStatus) -> Vec<TaskStatus> {
        let mut next = match from {
            TaskStatus::Idle => vec![TaskStatus::Observing],
            TaskStatus::Observing => vec![TaskStatus::Thinking],
            TaskStatus::Thinking => vec![TaskStatus::Acting],
            TaskStatus::Acting => vec![TaskStatus::Evaluating, TaskStatus::Repairing],
            TaskStatus::Repairing => vec![TaskStatus::Acting, TaskStatus::Evaluating],
            TaskStatus::Evaluating => vec![
                TaskStatus::Acting,
                TaskStatus::Observing,
                TaskStatus::Completed,
            ],
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => return vec![],
        };
        next.extend([TaskStatus::Failed, TaskStatus::Cancelled]);
        next
    }

    pub fn can_transition(from: &TaskStatus, to: &TaskStatus) -> bool {
        Self::validate_transition(from, to).is_ok()
    }

    /// Forward edge taken when the current phase succeeds without detours.
    pub fn next_status(current: &TaskStatus) -> Option<TaskStatus> {
        match current {
            TaskStatus::Idle => Some(TaskStatus::Observing),
            TaskStatus::Observing => Some(TaskStatus::Thinking),
            TaskStatus::Thinking => Some(TaskStatus::Acting),
            TaskStatus::Acting | TaskStatus::Repairing => Some(TaskStatus::Evaluating),
            TaskStatus::Evaluating => Some(TaskStatus::Completed),
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [TaskStatus; 9] = [
        TaskStatus::Idle,
        TaskStatus::Observing,
        TaskStatus::Thinking,
        TaskStatus::Acting,
        TaskStatus::Repairing,
        TaskStatus::Evaluating,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    #[test]
    fn test_valid_transitions() {
        assert!(TaskStateMachine::can_transition(
            &TaskStatus::Idle,
            &TaskStatus::Observing
        ));
        assert!(TaskStateMachine::can_transition(
            &TaskStatus::Acting,
            &TaskStatus::Repairing
        ));
        assert!(TaskStateMachine::can_transition(
            &TaskStatus::Repairing,
            &TaskStatus::Acting
        ));
        assert!(TaskStateMachine::can_transition(
            &TaskStatus::Evaluating,
            &TaskStatus::Observing
        ));
        assert!(TaskStateMachine::can_transition(
            &TaskStatus::Repairing,
            &TaskStatus::Evaluating
        ));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!TaskStateMachine::can_transition(
            &TaskStatus::Idle,
            &TaskStatus::Acting
        ));
        assert!(!TaskStateMachine::can_transition(
            &TaskStatus::Observing,
            &TaskStatus::Completed
        ));
        assert!(!TaskStateMachine::can_transition(
            &TaskStatus::Thinking,
            &TaskStatus::Repairing
        ));
        let err = TaskStateMachine::validate_transition(&TaskStatus::Idle, &TaskStatus::Completed)
            .unwrap_err();
        assert!(err.to_string().contains("idle"));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL.iter() {
                assert!(!TaskStateMachine::can_transition(from, to));
            }
        }
    }

    #[test]
    fn test_every_live_state_can_fail_or_cancel() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(TaskStateMachine::can_transition(from, &TaskStatus::Failed));
            assert!(TaskStateMachine::can_transition(from, &TaskStatus::Cancelled));
        }
    }

    #[test]
    fn test_next_status() {
        assert_eq!(
            TaskStateMachine::next_status(&TaskStatus::Idle),
            Some(TaskStatus::Observing)
        );
        assert_eq!(
            TaskStateMachine::next_status(&TaskStatus::Repairing),
            Some(TaskStatus::Evaluating)
        );
        assert_eq!(TaskStateMachine::next_status(&TaskStatus::Completed), None);
    }
}
