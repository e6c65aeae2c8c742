//! Durable workflow state: one JSON document per workflow plus sidecar files
//! for large per-pass artifacts. Writes are atomic (write temp, rename), so a
//! crash mid-write never corrupts an existing state file.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{WorkflowState, WorkflowStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    NotFound(String),
    #[error("state I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("state (de)serialization failed: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Brief listing entry for a stored workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub ea_name: String,
    pub symbol: String,
    pub timeframe: String,
    pub status: WorkflowStatus,
    pub composite_score: Option<f64>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl WorkflowSummary {
    pub fn of(state: &WorkflowState) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            ea_name: state.ea_name.clone(),
            symbol: state.symbol.clone(),
            timeframe: state.timeframe.clone(),
            status: state.status,
            composite_score: state.composite_score,
            updated_at: state.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunStore {
    runs_dir: PathBuf,
}

impl RunStore {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    pub fn state_path(&self, workflow_id: &str) -> PathBuf {
        self.runs_dir.join(format!("workflow_{workflow_id}.json"))
    }

    fn results_dir(&self, workflow_id: &str) -> PathBuf {
        self.runs_dir.join(workflow_id)
    }

    pub fn dashboards_dir(&self, workflow_id: &str) -> PathBuf {
        self.runs_dir.join("dashboards").join(workflow_id)
    }

    pub fn leaderboard_dir(&self) -> PathBuf {
        self.runs_dir.join("leaderboard")
    }

    pub fn boards_dir(&self) -> PathBuf {
        self.runs_dir.join("boards")
    }

    /// Persist the full workflow state atomically.
    pub fn save_state(&self, state: &WorkflowState) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.runs_dir)?;
        let path = self.state_path(&state.workflow_id);
        write_atomic(&path, &serde_json::to_vec_pretty(state)?)?;
        Ok(())
    }

    pub fn load_state(&self, workflow_id: &str) -> Result<WorkflowState, StoreError> {
        let path = self.state_path(workflow_id);
        if !path.exists() {
            return Err(StoreError::NotFound(workflow_id.to_string()));
        }
        let raw = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Save a large artifact as a sidecar file; returns the path recorded in
    /// the referencing `StageResult`.
    pub fn save_sidecar<T: Serialize>(
        &self,
        workflow_id: &str,
        name: &str,
        value: &T,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.results_dir(workflow_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.json"));
        write_atomic(&path, &serde_json::to_vec_pretty(value)?)?;
        Ok(path)
    }

    /// Save a plain (non-JSON) artifact next to the sidecars.
    pub fn write_artifact(
        &self,
        workflow_id: &str,
        file_name: &str,
        content: &str,
    ) -> Result<PathBuf, StoreError> {
        let dir = self.results_dir(workflow_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(file_name);
        std::fs::write(&path, content)?;
        Ok(path)
    }

    pub fn load_sidecar<T: DeserializeOwned>(
        &self,
        workflow_id: &str,
        name: &str,
    ) -> Result<T, StoreError> {
        let path = self.results_dir(workflow_id).join(format!("{name}.json"));
        if !path.exists() {
            return Err(StoreError::NotFound(format!("{workflow_id}/{name}")));
        }
        let raw = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// All stored workflows, newest first. Unreadable files are skipped.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let mut summaries: Vec<WorkflowSummary> = self
            .scan_states()
            .iter()
            .map(WorkflowSummary::of)
            .collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries
    }

    /// Load every parseable workflow state (aggregator input).
    pub fn scan_states(&self) -> Vec<WorkflowState> {
        let Ok(entries) = std::fs::read_dir(&self.runs_dir) else {
            return Vec::new();
        };
        let mut states = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("workflow_") || !name.ends_with(".json") {
                continue;
            }
            let Ok(raw) = std::fs::read(&path) else { continue };
            match serde_json::from_slice::<WorkflowState>(&raw) {
                Ok(state) => states.push(state),
                Err(err) => {
                    tracing::warn!(file = %path.display(), %err, "skipping unreadable state file");
                }
            }
        }
        states.sort_by(|a, b| a.workflow_id.cmp(&b.workflow_id));
        states
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
