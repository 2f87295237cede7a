use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Child;
use tracing::debug;

use crate::config::{BudgetSpec, BudgetUnit, FlotillaConfig};
use crate::error::{FlotillaError, Result};

use super::envelope::AgentEnvelope;
use super::sandbox::sandboxed_command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentRole {
    Planner,
    Worker,
    Validator,
    Merger,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Worker => "worker",
            Self::Validator => "validator",
            Self::Merger => "merger",
        }
    }

    pub fn model<'a>(&self, config: &'a FlotillaConfig) -> &'a str {
        match self {
            Self::Planner => &config.models.planner,
            Self::Worker => &config.models.worker,
            Self::Validator => &config.models.validator,
            Self::Merger => &config.models.merger,
        }
    }

    pub fn budget(&self, config: &FlotillaConfig) -> BudgetSpec {
        let budgets = &config.limits.budgets;
        match self {
            Self::Planner => budgets.planner.resolve(),
            Self::Worker => budgets.worker.resolve(),
            Self::Validator => budgets.validator.resolve(),
            Self::Merger => budgets.merger.resolve(),
        }
    }

    /// Fresh agent id with the role as prefix.
    pub fn new_agent_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.as_str(), &suffix[..8])
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything needed to spawn one agent subprocess.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub agent_id: String,
    pub role: AgentRole,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub working_dir: PathBuf,
    pub task_id: Option<String>,
}

impl SpawnRequest {
    pub fn new(role: AgentRole, prompt: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent_id: role.new_agent_id(),
            role,
            prompt: prompt.into(),
            system_prompt: None,
            working_dir: working_dir.into(),
            task_id: None,
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }
}

/// A spawned (or scripted) agent. `wait` consumes the handle and yields
/// the final result.
pub struct AgentHandle {
    pub agent_id: String,
    pub role: AgentRole,
    pub task_id: Option<String>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    inner: HandleInner,
}

enum HandleInner {
    Process(Child),
    Scripted {
        exit_code: i32,
        stdout: String,
        delay: Duration,
    },
}

impl AgentHandle {
    pub(crate) fn from_child(request: &SpawnRequest, child: Child) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            role: request.role,
            task_id: request.task_id.clone(),
            pid: child.id(),
            started_at: Utc::now(),
            inner: HandleInner::Process(child),
        }
    }

    pub(crate) fn scripted(
        request: &SpawnRequest,
        exit_code: i32,
        stdout: String,
        delay: Duration,
    ) -> Self {
        Self {
            agent_id: request.agent_id.clone(),
            role: request.role,
            task_id: request.task_id.clone(),
            pid: None,
            started_at: Utc::now(),
            inner: HandleInner::Scripted {
                exit_code,
                stdout,
                delay,
            },
        }
    }

    /// Wait for the agent to exit and collect its output envelope.
    pub async fn wait(self) -> AgentResult {
        let started_at = self.started_at;
        let (exit_code, stdout, stderr) = match self.inner {
            HandleInner::Process(child) => match child.wait_with_output().await {
                Ok(output) => (
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stdout).to_string(),
                    String::from_utf8_lossy(&output.stderr).to_string(),
                ),
                Err(e) => (-1, String::new(), format!("wait failed: {}", e)),
            },
            HandleInner::Scripted {
                exit_code,
                stdout,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                (exit_code, stdout, String::new())
            }
        };

        let envelope = AgentEnvelope::parse(&stdout);
        let duration = (Utc::now() - started_at).to_std().unwrap_or_default();

        AgentResult {
            agent_id: self.agent_id,
            role: self.role,
            task_id: self.task_id,
            exit_code,
            cost_usd: envelope.cost_usd(),
            tokens_used: envelope.tokens_used(),
            envelope,
            raw_stdout: stdout,
            raw_stderr: stderr,
            duration,
        }
    }
}

/// Outcome of one agent execution.
#[derive(Debug, Clone)]
pub struct AgentResult {
    pub agent_id: String,
    pub role: AgentRole,
    pub task_id: Option<String>,
    pub exit_code: i32,
    pub envelope: AgentEnvelope,
    pub raw_stdout: String,
    pub raw_stderr: String,
    pub cost_usd: f64,
    pub tokens_used: u64,
    pub duration: Duration,
}

impl AgentResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// The one capability the orchestrator needs from the outside world:
/// spawn a subprocess of a given role and get a waitable handle back.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    async fn spawn(&self, request: SpawnRequest) -> Result<AgentHandle>;
}

/// Spawns real `claude` CLI processes, each in its own process group.
pub struct ClaudeSpawner {
    config: FlotillaConfig,
}

impl ClaudeSpawner {
    pub fn new(config: FlotillaConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &SpawnRequest) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--model".to_string(),
            request.role.model(&self.config).to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];

        match request.role {
            AgentRole::Worker => {
                if !self.config.permissions.allowed_tools.is_empty() {
                    args.push("--allowed-tools".to_string());
                    args.push(self.config.permissions.allowed_tools.join(","));
                }
                if !self.config.permissions.blocked_tools.is_empty() {
                    args.push("--disallowed-tools".to_string());
                    args.push(self.config.permissions.blocked_tools.join(","));
                }
            }
            AgentRole::Validator => {
                args.push("--allowed-tools".to_string());
                args.push("Read,Glob,Grep,Bash".to_string());
                args.push("--disallowed-tools".to_string());
                args.push("Write,Edit,WebFetch,WebSearch,NotebookEdit,Task".to_string());
            }
            AgentRole::Planner | AgentRole::Merger => {}
        }

        if let Some(system_prompt) = &request.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }

        let budget = request.role.budget(&self.config);
        if budget.is_limited() && budget.unit == BudgetUnit::Usd {
            args.push("--max-budget-usd".to_string());
            args.push(format!("{:.2}", budget.value));
        }

        args.push(request.prompt.clone());
        args
    }
}

#[async_trait]
impl AgentSpawner for ClaudeSpawner {
    async fn spawn(&self, request: SpawnRequest) -> Result<AgentHandle> {
        let args = self.build_args(&request);
        let mut command = sandboxed_command("claude", &args, &self.config.sandbox);
        command
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        let child = command.spawn().map_err(|source| FlotillaError::Spawn {
            role: request.role.as_str(),
            source,
        })?;

        debug!(
            agent_id = %request.agent_id,
            role = %request.role,
            pid = child.id(),
            dir = %request.working_dir.display(),
            "Agent spawned"
        );

        Ok(AgentHandle::from_child(&request, child))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_ids_are_role_prefixed_and_unique() {
        let a = AgentRole::Worker.new_agent_id();
        let b = AgentRole::Worker.new_agent_id();
        assert!(a.starts_with("worker-"));
        assert_ne!(a, b);
    }

    #[test]
    fn worker_args_carry_tool_lists_and_budget() {
        let mut config = FlotillaConfig::default();
        config.permissions.allowed_tools = vec!["Read".to_string(), "Edit".to_string()];
        config.permissions.blocked_tools = vec!["WebFetch".to_string()];
        config.limits.budgets.worker.usd = 2.5;

        let spawner = ClaudeSpawner::new(config);
        let request = SpawnRequest::new(AgentRole::Worker, "do the thing", "/tmp");
        let args = spawner.build_args(&request);

        let joined = args.join(" ");
        assert!(joined.contains("--allowed-tools Read,Edit"));
        assert!(joined.contains("--disallowed-tools WebFetch"));
        assert!(joined.contains("--max-budget-usd 2.50"));
        assert_eq!(args.last().unwrap(), "do the thing");
    }

    #[test]
    fn validator_args_pin_read_only_tools() {
        let spawner = ClaudeSpawner::new(FlotillaConfig::default());
        let request = SpawnRequest::new(AgentRole::Validator, "check", "/tmp");
        let args = spawner.build_args(&request);
        let joined = args.join(" ");
        assert!(joined.contains("Read,Glob,Grep,Bash"));
        assert!(joined.contains("Write,Edit"));
    }

    #[test]
    fn token_budget_adds_no_usd_flag() {
        let mut config = FlotillaConfig::default();
        config.limits.budgets.planner.tokens = 10_000;
        let spawner = ClaudeSpawner::new(config);
        let request = SpawnRequest::new(AgentRole::Planner, "plan", "/tmp");
        let args = spawner.build_args(&request);
        assert!(!args.join(" ").contains("--max-budget-usd"));
    }

    #[tokio::test]
    async fn scripted_handle_reports_envelope() {
        let request = SpawnRequest::new(AgentRole::Worker, "x", "/tmp").with_task_id("task-001");
        let stdout =
            r#"{"type":"result","result":"ok","total_cost_usd":0.25,"usage":{"input_tokens":100,"output_tokens":50}}"#;
        let handle = AgentHandle::scripted(&request, 0, stdout.to_string(), Duration::ZERO);

        let result = handle.wait().await;
        assert!(result.succeeded());
        assert_eq!(result.task_id.as_deref(), Some("task-001"));
        assert_eq!(result.cost_usd, 0.25);
        assert_eq!(result.tokens_used, 150);
    }
}
