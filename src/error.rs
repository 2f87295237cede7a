use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlotillaError>;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported schema_version {found} (max supported: {max})")]
    UnsupportedSchema { found: u32, max: u32 },

    #[error("Invalid task dependencies: {0}")]
    Dependency(String),

    #[error("Cannot {action} task {task_id}: status is {actual}, want {expected}")]
    InvalidTransition {
        task_id: String,
        action: &'static str,
        actual: crate::task::TaskStatus,
        expected: &'static str,
    },

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent not tracked: {0}")]
    AgentNotFound(String),

    #[error("Lock conflict on {path:?}")]
    LockConflict { path: String },

    #[error("Worktree error: {0}")]
    Worktree(String),

    #[error("Merge conflict while folding branch {branch}")]
    MergeConflict { branch: String },

    #[error("Git command failed: {0}")]
    Git(String),

    #[error(transparent)]
    GitRepo(#[from] git2::Error),

    #[error("Failed to spawn {role} agent: {source}")]
    Spawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent output parse error: {0}")]
    Envelope(String),

    #[error("Planner produced no tasks")]
    EmptyPlan,

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Plan rejected by user")]
    PlanRejected,

    #[error("Session budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error(
        "Insufficient disk space: {available_mb} MB available, {required_mb} MB required at {path:?}"
    )]
    DiskSpace {
        path: PathBuf,
        available_mb: u64,
        required_mb: u64,
    },

    #[error("Memory provider error: {0}")]
    Memory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml_bw::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FlotillaError {
    /// Lock conflicts keep the task pending for the next wave instead of
    /// failing it.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self, Self::LockConflict { .. })
    }
}
