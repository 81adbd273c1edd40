//! Recoverable execution state.
//!
//! The orchestrator saves a snapshot after every status transition. Stores
//! are best effort: the orchestrator logs their failures and carries on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sheetflow_core::{ExecutionPlan, Task, TaskProgress};
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub task: Task,
    pub plan: Option<ExecutionPlan>,
    pub cycle: u32,
    pub saved_at: DateTime<Utc>,
}

impl ExecutionState {
    pub fn new(task: Task, plan: Option<ExecutionPlan>, cycle: u32) -> Self {
        Self {
            task,
            plan,
            cycle,
            saved_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_execution_state(&self, task_id: Uuid, state: &ExecutionState) -> Result<()>;

    /// Patches the progress of an already saved state; no-op when none exists.
    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()>;

    async fn load_execution_state(&self, task_id: Uuid) -> Result<Option<ExecutionState>>;
}

#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<Uuid, ExecutionState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save_execution_state(&self, task_id: Uuid, state: &ExecutionState) -> Result<()> {
        self.states.write().await.insert(task_id, state.clone());
        Ok(())
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        if let Some(state) = self.states.write().await.get_mut(&task_id) {
            state.task.progress = progress.clone();
            state.saved_at = Utc::now();
        }
        Ok(())
    }

    async fn load_execution_state(&self, task_id: Uuid) -> Result<Option<ExecutionState>> {
        Ok(self.states.read().await.get(&task_id).cloned())
    }
}

/// One JSON file per task under a directory, written via temp file + rename.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self, task_id: Uuid) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    async fn write(&self, task_id: Uuid, state: &ExecutionState) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(|e| {
            OrchestratorError::StateStore(format!(
                "Failed to create state directory {:?}: {}",
                self.dir, e
            ))
        })?;

        let path = self.state_path(task_id);
        let temp_path = self.dir.join(format!(".{task_id}.tmp"));
        let json = serde_json::to_string_pretty(state)?;

        fs::write(&temp_path, json).await.map_err(|e| {
            OrchestratorError::StateStore(format!(
                "Failed to write temp state file {:?}: {}",
                temp_path, e
            ))
        })?;
        fs::rename(&temp_path, &path).await.map_err(|e| {
            OrchestratorError::StateStore(format!(
                "Failed to rename state file {:?} -> {:?}: {}",
                temp_path, path, e
            ))
        })?;

        debug!(task_id = %task_id, path = ?path, "Execution state saved");
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn save_execution_state(&self, task_id: Uuid, state: &ExecutionState) -> Result<()> {
        self.write(task_id, state).await
    }

    async fn update_progress(&self, task_id: Uuid, progress: &TaskProgress) -> Result<()> {
        let Some(mut state) = self.load_execution_state(task_id).await? else {
            return Ok(());
        };
        state.task.progress = progress.clone();
        state.saved_at = Utc::now();
        self.write(task_id, &state).await
    }

    async fn load_execution_state(&self, task_id: Uuid) -> Result<Option<ExecutionState>> {
        let path = self.state_path(task_id);

        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            OrchestratorError::StateStore(format!("Failed to read state file {:?}: {}", path, e))
        })?;
        let state = serde_json::from_str(&content).map_err(|e| {
            OrchestratorError::StateStore(format!("Failed to parse state file {:?}: {}", path, e))
        })?;

        Ok(Some(state))
    }
}
