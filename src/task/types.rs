use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FlotillaError, Result};

pub const TASK_SCHEMA_VERSION: u32 = 1;

/// Top-level `tasks.yaml` structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFile {
    pub schema_version: u32,
    pub session_id: String,
    pub wave_cycle: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl TaskFile {
    pub fn new(session_id: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            schema_version: TASK_SCHEMA_VERSION,
            session_id: session_id.into(),
            wave_cycle: 1,
            tasks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Claimed,
    Done,
    Failed,
    Blocked,
    Merged,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Blocked | Self::Merged)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Merged => "merged",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cohesion_group: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default)]
    pub file_locks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub result: TaskResult,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            status: TaskStatus::Pending,
            priority: 1,
            cohesion_group: None,
            dependencies: Vec::new(),
            file_locks: Vec::new(),
            agent_id: None,
            worktree: None,
            branch: None,
            retry_count: 0,
            result: TaskResult::default(),
            history: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn with_file_locks(mut self, locks: Vec<String>) -> Self {
        self.file_locks = locks;
        self
    }

    pub fn with_cohesion_group(mut self, group: impl Into<String>) -> Self {
        self.cohesion_group = Some(group.into());
        self
    }

    pub fn depends_on(&self, task_id: &str) -> bool {
        self.dependencies.iter().any(|dep| dep == task_id)
    }

    /// pending -> claimed, recording the assigned agent, worktree, and branch.
    pub fn claim(
        &mut self,
        agent_id: impl Into<String>,
        worktree: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Result<()> {
        if self.status != TaskStatus::Pending {
            return Err(self.bad_transition("claim", "pending"));
        }
        self.status = TaskStatus::Claimed;
        self.agent_id = Some(agent_id.into());
        self.worktree = Some(worktree.into());
        self.branch = Some(branch.into());
        Ok(())
    }

    /// claimed -> done.
    pub fn complete(&mut self) -> Result<()> {
        if self.status != TaskStatus::Claimed {
            return Err(self.bad_transition("complete", "claimed"));
        }
        self.status = TaskStatus::Done;
        Ok(())
    }

    /// claimed -> failed, recording the reason.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.status != TaskStatus::Claimed {
            return Err(self.bad_transition("fail", "claimed"));
        }
        self.status = TaskStatus::Failed;
        self.result.notes = reason.into();
        Ok(())
    }

    /// pending/failed -> blocked (failure cascade).
    pub fn mark_blocked(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.status != TaskStatus::Pending && self.status != TaskStatus::Failed {
            return Err(self.bad_transition("block", "pending or failed"));
        }
        self.status = TaskStatus::Blocked;
        self.result.notes = reason.into();
        Ok(())
    }

    /// failed/done -> pending. Appends the attempt to history, clears the
    /// agent assignment, and bumps the retry counter.
    pub fn requeue(&mut self, entry: HistoryEntry) -> Result<()> {
        if self.status != TaskStatus::Failed && self.status != TaskStatus::Done {
            return Err(self.bad_transition("requeue", "failed or done"));
        }
        self.history.push(entry);
        self.status = TaskStatus::Pending;
        self.agent_id = None;
        self.worktree = None;
        self.branch = None;
        // The next attempt gets a fresh validation verdict.
        self.result = TaskResult::default();
        self.retry_count += 1;
        Ok(())
    }

    /// done -> merged. Only tasks that passed validation may merge.
    pub fn approve(&mut self) -> Result<()> {
        if self.status != TaskStatus::Done {
            return Err(self.bad_transition("approve", "done"));
        }
        if self.result.status != "pass" {
            return Err(self.bad_transition("approve", "done with a passing validation"));
        }
        self.status = TaskStatus::Merged;
        Ok(())
    }

    /// Records the validator's verdict on a done task.
    pub fn set_validation_result(
        &mut self,
        status: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<()> {
        if self.status != TaskStatus::Done {
            return Err(self.bad_transition("set validation result on", "done"));
        }
        self.result.status = status.into();
        self.result.notes = notes.into();
        Ok(())
    }

    pub fn validation_passed(&self) -> bool {
        self.status == TaskStatus::Done && self.result.status == "pass"
    }

    fn bad_transition(&self, action: &'static str, expected: &'static str) -> FlotillaError {
        FlotillaError::InvalidTransition {
            task_id: self.id.clone(),
            action,
            actual: self.status,
            expected,
        }
    }
}

/// Validation verdict attached to a task after the validation wave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

/// One prior attempt at a task. History is append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    pub result: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
}

impl HistoryEntry {
    pub fn new(attempt: u32, result: impl Into<String>) -> Self {
        Self {
            attempt,
            agent_id: String::new(),
            timestamp: Utc::now(),
            result: result.into(),
            notes: String::new(),
            rejection_reason: None,
            cost_usd: 0.0,
            tokens_used: 0,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = notes.into();
        self
    }

    pub fn with_rejection(mut self, reason: impl Into<String>) -> Self {
        self.rejection_reason = Some(reason.into());
        self
    }

    pub fn with_cost(mut self, cost_usd: f64, tokens_used: u64) -> Self {
        self.cost_usd = cost_usd;
        self.tokens_used = tokens_used;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_complete_approve_path() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("worker-1", "/tmp/wt", "flotilla/task-001").unwrap();
        assert_eq!(task.status, TaskStatus::Claimed);
        assert_eq!(task.agent_id.as_deref(), Some("worker-1"));

        task.complete().unwrap();
        task.set_validation_result("pass", "looks good").unwrap();
        assert!(task.validation_passed());

        task.approve().unwrap();
        assert_eq!(task.status, TaskStatus::Merged);
    }

    #[test]
    fn cannot_claim_twice() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("worker-1", "/tmp/wt", "b").unwrap();
        let err = task.claim("worker-2", "/tmp/wt2", "b").unwrap_err();
        assert!(matches!(err, FlotillaError::InvalidTransition { .. }));
    }

    #[test]
    fn cannot_complete_pending() {
        let mut task = Task::new("task-001", "Add auth");
        assert!(task.complete().is_err());
    }

    #[test]
    fn fail_then_requeue_clears_assignment() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("worker-1", "/tmp/wt", "b").unwrap();
        task.fail("exit code 1").unwrap();
        assert_eq!(task.result.notes, "exit code 1");

        task.requeue(HistoryEntry::new(1, "failed").with_agent("worker-1"))
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert!(task.agent_id.is_none());
        assert!(task.worktree.is_none());
        assert!(task.branch.is_none());
        assert_eq!(task.history.len(), 1);
        assert!(task.result.notes.is_empty());
    }

    #[test]
    fn requeue_clears_stale_validation_verdict() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("w", "/tmp/wt", "b").unwrap();
        task.complete().unwrap();
        task.set_validation_result("pass", "ok").unwrap();

        task.requeue(HistoryEntry::new(1, "rejected")).unwrap();
        assert!(task.result.status.is_empty());
        assert!(!task.validation_passed());
    }

    #[test]
    fn requeue_from_done_allowed() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("w", "/tmp/wt", "b").unwrap();
        task.complete().unwrap();
        assert!(task.requeue(HistoryEntry::new(1, "rejected")).is_ok());
    }

    #[test]
    fn cannot_requeue_claimed() {
        let mut task = Task::new("task-001", "Add auth");
        task.claim("w", "/tmp/wt", "b").unwrap();
        assert!(task.requeue(HistoryEntry::new(1, "failed")).is_err());
    }

    #[test]
    fn block_only_from_pending_or_failed() {
        let mut task = Task::new("task-001", "Add auth");
        task.mark_blocked("dependency task-000 failed").unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);

        let mut done = Task::new("task-002", "Other");
        done.claim("w", "/tmp/wt", "b").unwrap();
        done.complete().unwrap();
        assert!(done.mark_blocked("nope").is_err());
    }

    #[test]
    fn approve_requires_done() {
        let mut task = Task::new("task-001", "Add auth");
        assert!(task.approve().is_err());
    }

    #[test]
    fn task_file_round_trips() {
        let mut task = Task::new("task-001", "Add auth")
            .with_priority(2)
            .with_dependencies(vec!["task-000".to_string()])
            .with_file_locks(vec!["pkg/auth/".to_string()])
            .with_cohesion_group("auth");
        task.history.push(
            HistoryEntry::new(1, "failed")
                .with_notes("exit code 1")
                .with_cost(0.42, 1200),
        );

        let file = TaskFile::new("ses-20260101-120000", vec![task]);
        let yaml = serde_yaml_bw::to_string(&file).unwrap();
        let parsed: TaskFile = serde_yaml_bw::from_str(&yaml).unwrap();

        assert_eq!(parsed.schema_version, TASK_SCHEMA_VERSION);
        assert_eq!(parsed.session_id, file.session_id);
        assert_eq!(parsed.tasks.len(), 1);
        let t = &parsed.tasks[0];
        assert_eq!(t.priority, 2);
        assert_eq!(t.cohesion_group.as_deref(), Some("auth"));
        assert_eq!(t.history[0].cost_usd, 0.42);
        assert_eq!(t.history[0].tokens_used, 1200);
    }
}
