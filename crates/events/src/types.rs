//! Events emitted while a sheetflow task runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "task.created")]
    TaskCreated {
        task_id: Uuid,
        prompt: String,
        file_count: usize,
    },

    #[serde(rename = "task.status_changed")]
    TaskStatusChanged {
        task_id: Uuid,
        from_status: String,
        to_status: String,
    },

    #[serde(rename = "task.progress")]
    TaskProgress {
        task_id: Uuid,
        percentage: u8,
        phase: String,
        message: String,
    },

    /// One repair strategy was applied to a failed step.
    #[serde(rename = "repair.attempted")]
    RepairAttempted {
        task_id: Uuid,
        strategy: String,
        attempt: u32,
        success: bool,
    },

    /// Circuit breaker moved between closed, open and half-open.
    #[serde(rename = "breaker.state_changed")]
    BreakerStateChanged {
        from_state: String,
        to_state: String,
        reason: String,
    },

    #[serde(rename = "task.finished")]
    TaskFinished {
        task_id: Uuid,
        status: String,
        success: bool,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    pub fn task_id(&self) -> Option<Uuid> {
        match self {
            Event::TaskCreated { task_id, .. }
            | Event::TaskStatusChanged { task_id, .. }
            | Event::TaskProgress { task_id, .. }
            | Event::RepairAttempted { task_id, .. }
            | Event::TaskFinished { task_id, .. } => Some(*task_id),
            Event::BreakerStateChanged { .. } | Event::Error { .. } => None,
        }
    }

    /// Wire name of the event, as written in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::TaskCreated { .. } => "task.created",
            Event::TaskStatusChanged { .. } => "task.status_changed",
            Event::TaskProgress { .. } => "task.progress",
            Event::RepairAttempted { .. } => "repair.attempted",
            Event::BreakerStateChanged { .. } => "breaker.state_changed",
            Event::TaskFinished { .. } => "task.finished",
            Event::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_envelope_creation() {
        let envelope = EventEnvelope::new(Event::TaskCreated {
            task_id: Uuid::new_v4(),
            prompt: "sum column X".to_string(),
            file_count: 1,
        });

        assert!(!envelope.id.is_nil());
        assert!(envelope.timestamp <= Utc::now());
    }

    #[test]
    fn test_event_serialization() {
        let event = Event::TaskStatusChanged {
            task_id: Uuid::new_v4(),
            from_status: "idle".to_string(),
            to_status: "observing".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("task.status_changed"));
        assert!(json.contains("from_status"));
        assert!(json.contains("to_status"));
    }

    #[test]
    fn test_event_deserialization() {
        let json = r#"{"type":"breaker.state_changed","from_state":"closed","to_state":"open","reason":"failure rate 60.0%"}"#;
        let event: Event = serde_json::from_str(json).unwrap();

        match event {
            Event::BreakerStateChanged { to_state, .. } => assert_eq!(to_state, "open"),
            _ => panic!("Wrong event type"),
        }
    }

    #[test]
    fn test_event_task_id() {
        let task_id = Uuid::new_v4();
        let event = Event::RepairAttempted {
            task_id,
            strategy: "code_fix".to_string(),
            attempt: 1,
            success: true,
        };
        assert_eq!(event.task_id(), Some(task_id));

        let breaker = Event::BreakerStateChanged {
            from_state: "open".to_string(),
            to_state: "half_open".to_string(),
            reason: "open duration elapsed".to_string(),
        };
        assert_eq!(breaker.task_id(), None);
    }

    #[test]
    fn test_kind_matches_tag() {
        let event = Event::TaskFinished {
            task_id: Uuid::new_v4(),
            status: "completed".to_string(),
            success: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
    }
}
