use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;

use super::spawner::{AgentHandle, AgentRole, AgentSpawner, SpawnRequest};

/// Pre-seeded outcome for one mock agent execution.
#[derive(Debug, Clone)]
pub struct MockOutcome {
    pub exit_code: i32,
    pub stdout: String,
}

impl MockOutcome {
    pub fn success(result_json: &str) -> Self {
        let stdout = serde_json::json!({
            "type": "result",
            "subtype": "success",
            "is_error": false,
            "result": result_json,
            "total_cost_usd": 0.05,
            "duration_ms": 10,
            "num_turns": 1,
            "usage": {"input_tokens": 100, "output_tokens": 50},
            "session_id": "mock"
        })
        .to_string();
        Self { exit_code: 0, stdout }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
        }
    }

    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&self.stdout) {
            value["total_cost_usd"] = serde_json::json!(cost_usd);
            self.stdout = value.to_string();
        }
        self
    }
}

/// Test-double spawner: hands back scripted results so the orchestrator
/// can be exercised without invoking external agents.
#[derive(Default)]
pub struct MockSpawner {
    /// Planner outcomes, consumed in order (re-plans pop the next one).
    planner_outcomes: Mutex<Vec<MockOutcome>>,
    /// Per-task worker outcomes; a task may fail then succeed on retry.
    worker_outcomes: Mutex<HashMap<String, Vec<MockOutcome>>>,
    /// Per-task validator outcomes.
    validator_outcomes: Mutex<HashMap<String, Vec<MockOutcome>>>,
    merger_outcome: Mutex<Option<MockOutcome>>,
    delay: Duration,
    spawned_roles: Mutex<Vec<AgentRole>>,
}

impl MockSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_planner(&self, outcome: MockOutcome) {
        self.planner_outcomes.lock().push(outcome);
    }

    /// Convenience: a planner that emits the given tasks JSON once.
    pub fn plan_tasks(&self, tasks_json: &str) {
        self.push_planner(MockOutcome::success(tasks_json));
    }

    pub fn push_worker(&self, task_id: &str, outcome: MockOutcome) {
        self.worker_outcomes
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(outcome);
    }

    pub fn push_validator(&self, task_id: &str, outcome: MockOutcome) {
        self.validator_outcomes
            .lock()
            .entry(task_id.to_string())
            .or_default()
            .push(outcome);
    }

    pub fn set_merger(&self, outcome: MockOutcome) {
        *self.merger_outcome.lock() = Some(outcome);
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Roles spawned so far, in order. Lets tests assert e.g. that no
    /// planner ran on a recovery resume.
    pub fn spawned_roles(&self) -> Vec<AgentRole> {
        self.spawned_roles.lock().clone()
    }

    fn next_for(&self, request: &SpawnRequest) -> MockOutcome {
        match request.role {
            AgentRole::Planner => {
                let mut outcomes = self.planner_outcomes.lock();
                if outcomes.is_empty() {
                    MockOutcome::success(r#"{"tasks": []}"#)
                } else {
                    outcomes.remove(0)
                }
            }
            AgentRole::Worker | AgentRole::Validator => {
                let map = match request.role {
                    AgentRole::Worker => &self.worker_outcomes,
                    _ => &self.validator_outcomes,
                };
                let default = match request.role {
                    AgentRole::Worker => MockOutcome::success(r#"{"done": true}"#),
                    _ => MockOutcome::success(r#"{"status": "pass", "notes": "looks good"}"#),
                };
                let Some(task_id) = request.task_id.as_deref() else {
                    return default;
                };
                let mut map = map.lock();
                match map.get_mut(task_id) {
                    Some(queue) if !queue.is_empty() => queue.remove(0),
                    _ => default,
                }
            }
            AgentRole::Merger => self
                .merger_outcome
                .lock()
                .clone()
                .unwrap_or_else(|| MockOutcome::success(r#"{"merged": true}"#)),
        }
    }
}

#[async_trait]
impl AgentSpawner for MockSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<AgentHandle> {
        self.spawned_roles.lock().push(request.role);
        let outcome = self.next_for(&request);
        Ok(AgentHandle::scripted(
            &request,
            outcome.exit_code,
            outcome.stdout,
            self.delay,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::envelope::parse_validator_output;

    #[tokio::test]
    async fn worker_outcomes_are_consumed_in_order() {
        let spawner = MockSpawner::new();
        spawner.push_worker("task-001", MockOutcome::failure(1));
        spawner.push_worker("task-001", MockOutcome::success(r#"{"ok": true}"#));

        let request = SpawnRequest::new(AgentRole::Worker, "x", "/tmp").with_task_id("task-001");
        let first = spawner.spawn(request.clone()).await.unwrap().wait().await;
        assert_eq!(first.exit_code, 1);

        let second = spawner.spawn(request).await.unwrap().wait().await;
        assert!(second.succeeded());
        assert!(second.cost_usd > 0.0);
    }

    #[tokio::test]
    async fn validator_defaults_to_pass() {
        let spawner = MockSpawner::new();
        let request =
            SpawnRequest::new(AgentRole::Validator, "x", "/tmp").with_task_id("task-001");
        let result = spawner.spawn(request).await.unwrap().wait().await;
        let output = parse_validator_output(&result.raw_stdout).unwrap();
        assert_eq!(output.status, "pass");
    }

    #[tokio::test]
    async fn records_spawned_roles() {
        let spawner = MockSpawner::new();
        spawner.plan_tasks(r#"{"tasks": [{"id": "t", "title": "t", "description": "", "priority": 1, "dependencies": [], "file_locks": []}]}"#);
        let request = SpawnRequest::new(AgentRole::Planner, "plan", "/tmp");
        spawner.spawn(request).await.unwrap().wait().await;
        assert_eq!(spawner.spawned_roles(), vec![AgentRole::Planner]);
    }
}
