//! Contracts for the external services the orchestrator drives.
//!
//! The orchestrator never talks HTTP or runs code itself; front ends plug in
//! implementations of [`ReasoningService`] and [`ExecutionSandbox`]. Both are
//! called under a per-step deadline and are dropped at their next await point
//! when the task is cancelled.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sheetflow_core::{Datasets, FilePreview, OutputData};
use thiserror::Error;

use crate::response_parser::ReasoningResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Timeout,
    Network,
    Unavailable,
    RateLimited,
    InvalidResponse,
    Execution,
    Storage,
    InvalidInput,
    Data,
    Other,
}

impl FaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::Unavailable => "unavailable",
            Self::RateLimited => "rate_limited",
            Self::InvalidResponse => "invalid_response",
            Self::Execution => "execution",
            Self::Storage => "storage",
            Self::InvalidInput => "invalid_input",
            Self::Data => "data",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fault raised by a collaborator call.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct CollaboratorError {
    pub kind: FaultKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Network, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Unavailable, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Execution, message)
    }
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Turns an instruction plus data previews into code and an explanation.
    async fn generate_code(
        &self,
        prompt: &str,
        previews: &[FilePreview],
    ) -> Result<ReasoningResponse, CollaboratorError>;
}

#[async_trait]
pub trait ExecutionSandbox: Send + Sync {
    /// Runs `code` against `datasets`, returning output tables keyed by name.
    async fn execute(
        &self,
        code: &str,
        datasets: &Datasets,
        timeout: Duration,
    ) -> Result<OutputData, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = CollaboratorError::execution("SyntaxError: invalid syntax");
        assert_eq!(error.to_string(), "execution: SyntaxError: invalid syntax");
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&FaultKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
