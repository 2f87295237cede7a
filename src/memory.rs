//! Optional cross-session memory, backed by an external CLI.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::MemoryConfig;
use crate::error::{FlotillaError, Result};

/// Summary of a completed session for archival.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionResult {
    pub id: String,
    pub all_tasks: Vec<TaskSummary>,
    pub completed_tasks: Vec<TaskSummary>,
    pub failed_tasks: Vec<TaskSummary>,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub wave_cycles: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub result_status: String,
    #[serde(default)]
    pub validator_notes: String,
    #[serde(default)]
    pub failure_reason: String,
    #[serde(default)]
    pub retry_count: u32,
}

/// Prior-session context loaded for the planner.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub prior_failures: Vec<TaskSummary>,
    #[serde(default)]
    pub session_count: u32,
}

impl SessionContext {
    /// Render as planner context. Empty when there is nothing useful.
    pub fn to_prompt_context(&self) -> String {
        if self.session_count == 0 {
            return String::new();
        }
        let mut context = format!(
            "Prior sessions: {}. Prior failures: {}.",
            self.session_count,
            self.prior_failures.len()
        );
        for failure in &self.prior_failures {
            context.push_str(&format!(
                "\n- Task {} ({}): {}",
                failure.id, failure.title, failure.failure_reason
            ));
        }
        context
    }
}

#[async_trait]
pub trait MemoryProvider: Send + Sync {
    async fn save(&self, session: &SessionResult) -> Result<()>;
    async fn load(&self) -> Result<SessionContext>;
}

/// Memory disabled.
pub struct NoopMemory;

#[async_trait]
impl MemoryProvider for NoopMemory {
    async fn save(&self, _session: &SessionResult) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<SessionContext> {
        Ok(SessionContext::default())
    }
}

/// Memory via the `beads` CLI. Load degrades gracefully when the CLI is
/// unavailable; save surfaces errors so the operator notices lost context.
pub struct BeadsMemory {
    config: MemoryConfig,
}

impl BeadsMemory {
    pub fn new(config: MemoryConfig) -> Self {
        Self { config }
    }

    async fn save_record(&self, kind: &str, data: serde_json::Value) -> Result<()> {
        let payload = data.to_string();
        let status = Command::new("beads")
            .args(["save", "--type", kind, "--data", &payload])
            .status()
            .await
            .map_err(|e| FlotillaError::Memory(format!("beads save {}: {}", kind, e)))?;
        if !status.success() {
            return Err(FlotillaError::Memory(format!(
                "beads save {} exited with {}",
                kind, status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MemoryProvider for BeadsMemory {
    async fn save(&self, session: &SessionResult) -> Result<()> {
        for task in &session.completed_tasks {
            self.save_record(
                "task-result",
                serde_json::json!({
                    "task_id": task.id,
                    "title": task.title,
                    "result": task.result_status,
                    "validator_notes": task.validator_notes,
                }),
            )
            .await?;
        }

        if self.config.include_failure_notes {
            for task in &session.failed_tasks {
                self.save_record(
                    "task-failure",
                    serde_json::json!({
                        "task_id": task.id,
                        "title": task.title,
                        "failure_reason": task.failure_reason,
                        "retry_count": task.retry_count,
                    }),
                )
                .await?;
            }
        }

        self.save_record(
            "session-summary",
            serde_json::json!({
                "session_id": session.id,
                "total_tasks": session.all_tasks.len(),
                "completed": session.completed_tasks.len(),
                "failed": session.failed_tasks.len(),
                "total_cost_usd": session.total_cost_usd,
                "wave_cycles": session.wave_cycles,
            }),
        )
        .await
    }

    async fn load(&self) -> Result<SessionContext> {
        let output = Command::new("beads")
            .args([
                "load",
                "--type",
                "task-failure,session-summary",
                "--format",
                "json",
                "--limit",
                "20",
            ])
            .output()
            .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(_) | Err(_) => {
                debug!("No beads data available, continuing without prior context");
                return Ok(SessionContext::default());
            }
        };

        match serde_json::from_slice(&output.stdout) {
            Ok(context) => Ok(context),
            Err(e) => {
                warn!(error = %e, "Failed to parse beads output");
                Ok(SessionContext::default())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_memory_is_empty() {
        let memory = NoopMemory;
        memory.save(&SessionResult::default()).await.unwrap();
        let context = memory.load().await.unwrap();
        assert_eq!(context.session_count, 0);
        assert!(context.to_prompt_context().is_empty());
    }

    #[test]
    fn prompt_context_lists_failures() {
        let context = SessionContext {
            session_count: 2,
            prior_failures: vec![TaskSummary {
                id: "task-009".to_string(),
                title: "Flaky thing".to_string(),
                failure_reason: "timeout".to_string(),
                ..Default::default()
            }],
        };
        let rendered = context.to_prompt_context();
        assert!(rendered.contains("Prior sessions: 2"));
        assert!(rendered.contains("task-009"));
        assert!(rendered.contains("timeout"));
    }
}
