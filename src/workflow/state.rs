//! Execution state and checkpointing
//!
//! The executor's full state is written atomically after every step
//! transition to `<project>/.ntm/runs/<run_id>.json`, so an interrupted
//! run can be inspected or reloaded by run id.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{NtmError, Result};
use crate::history::atomic_write;

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Status of one step within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    #[default]
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Result record for one step (or loop iteration)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Execution attempts, counting retries
    #[serde(default)]
    pub attempts: u32,
}

/// Checkpointable state of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    /// The workflow's name
    pub workflow_id: String,
    pub status: RunStatus,
    /// Bound variable values (defaults merged with overrides)
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Step results keyed by step id; loop iterations use `id[index]`
    pub steps: BTreeMap<String, StepResult>,
}

impl ExecutionState {
    pub fn new(
        workflow_id: impl Into<String>,
        variables: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            status: RunStatus::Pending,
            variables,
            steps: BTreeMap::new(),
        }
    }

    /// Checkpoint path for a run id
    pub fn checkpoint_path(project_dir: &Path, run_id: &str) -> PathBuf {
        project_dir
            .join(".ntm")
            .join("runs")
            .join(format!("{run_id}.json"))
    }

    /// Write the state atomically (temp file, fsync, rename)
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = Self::checkpoint_path(project_dir, &self.run_id);
        let bytes = serde_json::to_vec_pretty(self)?;
        atomic_write(&path, &bytes)
    }

    /// Reload a checkpoint by run id
    pub fn load(project_dir: &Path, run_id: &str) -> Result<Self> {
        let path = Self::checkpoint_path(project_dir, run_id);
        if !path.exists() {
            return Err(NtmError::CheckpointNotFound(run_id.to_string()));
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// All step results with a given status
    #[allow(dead_code)] // Run inspection; exercised in tests
    pub fn steps_with_status(&self, status: StepStatus) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> ExecutionState {
        let mut vars = BTreeMap::new();
        vars.insert("target".to_string(), serde_json::json!("main"));
        let mut state = ExecutionState::new("build", vars);
        state.status = RunStatus::Completed;
        state.steps.insert(
            "init".to_string(),
            StepResult {
                status: StepStatus::Completed,
                started_at: Some(Utc::now()),
                finished_at: Some(Utc::now()),
                output: Some("ok".to_string()),
                error: None,
                attempts: 1,
            },
        );
        state
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let state = sample_state();
        state.save(dir.path()).unwrap();

        let loaded = ExecutionState::load(dir.path(), &state.run_id).unwrap();
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.workflow_id, "build");
        assert_eq!(loaded.variables["target"], serde_json::json!("main"));
        assert_eq!(loaded.steps.len(), 1);
        assert_eq!(loaded.steps["init"].status, StepStatus::Completed);
        assert_eq!(loaded.steps["init"].attempts, 1);
    }

    #[test]
    fn test_load_missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let err = ExecutionState::load(dir.path(), "no-such-run").unwrap_err();
        assert_eq!(err.code(), Some("CHECKPOINT_NOT_FOUND"));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = sample_state();
        state.save(dir.path()).unwrap();

        state.status = RunStatus::Failed;
        state.save(dir.path()).unwrap();

        let loaded = ExecutionState::load(dir.path(), &state.run_id).unwrap();
        assert_eq!(loaded.status, RunStatus::Failed);

        // No temp file remains next to the checkpoint
        let path = ExecutionState::checkpoint_path(dir.path(), &state.run_id);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_steps_with_status() {
        let mut state = sample_state();
        state.steps.insert(
            "later".to_string(),
            StepResult {
                status: StepStatus::Pending,
                ..StepResult::default()
            },
        );
        assert_eq!(state.steps_with_status(StepStatus::Completed), vec!["init"]);
        assert_eq!(state.steps_with_status(StepStatus::Pending), vec!["later"]);
    }
}
