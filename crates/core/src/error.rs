use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Invalid task status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Malformed data file {file}: {reason}")]
    MalformedDataFile { file: String, reason: String },

    #[error("Validation error: {0}")]
    Validation(String),
}
