use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::data::DataFile;
use super::fault::TaskError;
use super::repair::RepairStrategy;

/// Version stamped into every task's metadata.
pub const TASK_SCHEMA_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Idle,
    Observing,
    Thinking,
    Acting,
    Repairing,
    Evaluating,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Observing => "observing",
            Self::Thinking => "thinking",
            Self::Acting => "acting",
            Self::Repairing => "repairing",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "observing" => Some(Self::Observing),
            "thinking" => Some(Self::Thinking),
            "acting" => Some(Self::Acting),
            "repairing" => Some(Self::Repairing),
            "evaluating" => Some(Self::Evaluating),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Progress percentage reported while the task sits in this status.
    pub fn progress_percentage(&self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Observing => 20,
            Self::Thinking => 40,
            Self::Acting => 60,
            Self::Repairing => 70,
            Self::Evaluating => 80,
            Self::Completed => 100,
            Self::Failed | Self::Cancelled => 0,
        }
    }

    pub fn phase_message(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Observing => "Observing data",
            Self::Thinking => "Planning approach",
            Self::Acting => "Executing transformation",
            Self::Repairing => "Repairing errors",
            Self::Evaluating => "Evaluating results",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProgress {
    pub percentage: u8,
    pub current_phase: TaskStatus,
    pub message: String,
}

impl TaskProgress {
    pub fn for_status(status: TaskStatus) -> Self {
        Self {
            percentage: status.progress_percentage(),
            current_phase: status,
            message: status.phase_message().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One executed phase attempt, recorded on the task for the execution summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub id: Uuid,
    pub phase: TaskStatus,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    /// Number of times the step's external call was retried before settling.
    pub retries: u32,
    pub error: Option<TaskError>,
}

impl TaskStep {
    pub fn start(phase: TaskStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase,
            status: StepStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            retries: 0,
            error: None,
        }
    }

    pub fn complete(&mut self) {
        self.finish(StepStatus::Completed);
    }

    pub fn fail(&mut self, error: TaskError) {
        self.error = Some(error);
        self.finish(StepStatus::Failed);
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.duration_ms = Some((now - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(now);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskHistory {
    /// Act attempts made so far.
    pub attempts: u32,
    /// Act failures so far; bounded by the per-task retry ceiling.
    pub act_failures: u32,
    pub errors: Vec<TaskError>,
    pub repairs: Vec<RepairStrategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    user_input: String,
    data_files: Vec<DataFile>,
    pub history: TaskHistory,
    pub session_state: SessionState,
}

impl TaskContext {
    pub fn new(user_input: impl Into<String>, data_files: Vec<DataFile>, session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            user_input: user_input.into(),
            data_files,
            history: TaskHistory::default(),
            session_state: SessionState {
                session_id,
                start_time: now,
                last_update_time: now,
            },
        }
    }

    pub fn user_input(&self) -> &str {
        &self.user_input
    }

    pub fn data_files(&self) -> &[DataFile] {
        &self.data_files
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// `[level] message`, the form returned in task results.
    pub fn render(&self) -> String {
        format!("[{}] {}", self.level.as_str(), self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub context: TaskContext,
    pub steps: Vec<TaskStep>,
    pub progress: TaskProgress,
    pub metadata: TaskMetadata,
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(user_input: impl Into<String>, data_files: Vec<DataFile>, session_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::default(),
            context: TaskContext::new(user_input, data_files, session_id),
            steps: Vec::new(),
            progress: TaskProgress {
                percentage: 0,
                current_phase: TaskStatus::Idle,
                message: "Task created".to_string(),
            },
            metadata: TaskMetadata {
                created_at: now,
                updated_at: now,
                completed_at: None,
                version: TASK_SCHEMA_VERSION.to_string(),
            },
            error: None,
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    /// Applies a status change, refreshing progress and timestamps.
    ///
    /// Callers validate the edge first; this only records it.
    pub fn set_status(&mut self, status: TaskStatus) {
        let now = Utc::now();
        self.status = status;
        self.progress = TaskProgress::for_status(status);
        self.metadata.updated_at = now;
        self.context.session_state.last_update_time = now;
        if status.is_terminal() {
            self.metadata.completed_at = Some(now);
        }
    }

    pub fn begin_step(&mut self, phase: TaskStatus) -> usize {
        self.steps.push(TaskStep::start(phase));
        self.steps.len() - 1
    }

    pub fn step_mut(&mut self, index: usize) -> Option<&mut TaskStep> {
        self.steps.get_mut(index)
    }

    pub fn record_error(&mut self, error: TaskError) {
        self.context.history.errors.push(error);
    }

    pub fn last_error(&self) -> Option<&TaskError> {
        self.context.history.errors.last()
    }
}
