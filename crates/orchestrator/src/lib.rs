pub mod cache;
pub mod circuit_breaker;
pub mod classifier;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod phases;
pub mod repair;
pub mod response_parser;
pub mod state_machine;
pub mod state_store;

pub use cache::ResultCache;
pub use circuit_breaker::{
    BreakerPermit, BreakerState, BreakerStatistics, CircuitBreaker, CircuitBreakerState, Clock,
    DegradationLevel, ManualClock, SystemClock,
};
pub use classifier::ErrorClassifier;
pub use collaborators::{CollaboratorError, ExecutionSandbox, FaultKind, ReasoningService};
pub use config::{CircuitBreakerConfig, OrchestratorConfig};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{CallbackError, OrchestratorStatistics, ProgressCallback, TaskOrchestrator};
pub use phases::{AccuracyScorer, ConstantAccuracy};
pub use repair::{RepairAction, RepairContext, RepairEngine, RepairResult};
pub use response_parser::{parse_reasoning_response, GeneratedCode, ReasoningResponse};
pub use state_machine::TaskStateMachine;
pub use state_store::{ExecutionState, FileStateStore, InMemoryStateStore, StateStore};
