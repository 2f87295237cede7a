pub mod agent;
pub mod config;
pub mod error;
pub mod git;
pub mod locks;
pub mod memory;
pub mod orchestrator;
pub mod recovery;
pub mod sanitize;
pub mod task;
pub mod ui;
pub mod worktree;

pub use agent::{AgentResult, AgentRole, AgentSpawner, LifecycleConfig, LifecycleTracker};
pub use config::FlotillaConfig;
pub use error::{FlotillaError, Result};
pub use locks::LockManager;
pub use orchestrator::{cleanup_stale_state, Orchestrator, Scheduler};
pub use recovery::{OrchestratorState, Phase, RecoveryStore};
pub use task::{Task, TaskFile, TaskStatus, TaskStore};
pub use ui::{Prompter, ScriptedPrompter, TerminalPrompter};
pub use worktree::WorktreeManager;
