use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Session phase within a wave cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Development,
    Validation,
    Merge,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Development => "development",
            Self::Validation => "validation",
            Self::Merge => "merge",
        };
        write!(f, "{}", s)
    }
}

/// Orchestrator snapshot persisted for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub session_id: String,
    pub wave_cycle: u32,
    pub phase: Phase,
    pub session_cost_usd: f64,
    pub session_tokens: u64,
    pub start_time: DateTime<Utc>,
    pub last_save: DateTime<Utc>,
}

impl OrchestratorState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            wave_cycle: 1,
            phase: Phase::Planning,
            session_cost_usd: 0.0,
            session_tokens: 0,
            start_time: now,
            last_save: now,
        }
    }
}

/// Atomic persistence for the recovery state file.
pub struct RecoveryStore {
    path: PathBuf,
}

impl RecoveryStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("state.json"),
        }
    }

    pub async fn save(&self, state: &mut OrchestratorState) -> Result<()> {
        state.last_save = Utc::now();
        let json = serde_json::to_string_pretty(state)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, &json).await?;
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(phase = %state.phase, wave_cycle = state.wave_cycle, "Recovery state saved");
        Ok(())
    }

    pub async fn load(&self) -> Result<OrchestratorState> {
        let content = fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Delete the state file. Missing is fine (fresh start, completed
    /// session).
    pub async fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
