use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{FlotillaError, Result};

use super::migrate;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlotillaConfig {
    pub schema_version: u32,
    pub project: ProjectConfig,
    pub concurrency: ConcurrencyConfig,
    pub limits: LimitsConfig,
    pub sandbox: SandboxConfig,
    pub models: ModelsConfig,
    pub permissions: PermissionsConfig,
    pub validation: ValidationConfig,
    pub memory: MemoryConfig,
}

impl FlotillaConfig {
    pub async fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            FlotillaError::Config(format!("read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Parse raw YAML, running schema migration and validation.
    pub fn parse(raw: &str) -> Result<Self> {
        let config = migrate(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values for consistency.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.project.repo.as_os_str().is_empty() {
            errors.push("project.repo is required".to_string());
        }

        let dev = self.concurrency.development;
        if !(1..=8).contains(&dev) {
            errors.push(format!("concurrency.development must be 1-8, got {}", dev));
        }

        if self.limits.max_wave_cycles < 1 {
            errors.push(format!(
                "limits.max_wave_cycles must be >= 1, got {}",
                self.limits.max_wave_cycles
            ));
        }

        if self.limits.max_deferred_waves < 1 {
            errors.push(format!(
                "limits.max_deferred_waves must be >= 1, got {}",
                self.limits.max_deferred_waves
            ));
        }

        if self.limits.max_session_cost_usd > 0.0 && self.limits.max_session_tokens > 0 {
            errors.push(
                "at most one of limits.max_session_cost_usd or limits.max_session_tokens may be non-zero"
                    .to_string(),
            );
        }

        for (role, entry) in [
            ("planner", &self.limits.budgets.planner),
            ("worker", &self.limits.budgets.worker),
            ("validator", &self.limits.budgets.validator),
            ("merger", &self.limits.budgets.merger),
        ] {
            if entry.usd > 0.0 && entry.tokens > 0 {
                errors.push(format!(
                    "limits.budgets.{}: at most one of usd or tokens may be non-zero",
                    role
                ));
            }
        }

        for pattern in self
            .permissions
            .allowed_paths
            .iter()
            .chain(self.permissions.blocked_paths.iter())
        {
            if let Err(e) = glob::Pattern::new(pattern) {
                errors.push(format!("invalid path glob {:?}: {}", pattern, e));
            }
        }

        for pattern in &self.permissions.bash_rules.blocked_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("invalid blocked_patterns regex {:?}: {}", pattern, e));
            }
        }

        if !self.validation.commit_format.pattern.is_empty() {
            if let Err(e) = regex::Regex::new(&self.validation.commit_format.pattern) {
                errors.push(format!("invalid commit_format.pattern regex: {}", e));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(FlotillaError::Config(errors.join("; ")))
        }
    }

    /// Root of the per-project state directory (`<repo>/.flotilla`).
    pub fn state_dir(&self) -> PathBuf {
        self.project.repo.join(".flotilla")
    }

    pub fn tasks_path(&self) -> PathBuf {
        self.project.repo.join(&self.project.tasks_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: String,
    pub repo: PathBuf,
    pub base_branch: String,
    pub worktree_dir: PathBuf,
    pub tasks_file: PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            repo: PathBuf::new(),
            base_branch: "main".to_string(),
            worktree_dir: PathBuf::from(".trees"),
            tasks_file: PathBuf::from(".flotilla/tasks.yaml"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub planning: usize,
    pub development: usize,
    pub validation: usize,
    pub merge: usize,
    pub adaptive: bool,
    pub min_ram_per_agent_mb: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            planning: 1,
            development: 4,
            validation: 2,
            merge: 1,
            adaptive: false,
            min_ram_per_agent_mb: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub agent_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_retries: u32,
    pub max_wave_cycles: u32,
    /// Consecutive merge-review skips a changeset may accumulate before it
    /// is requeued instead of carried forward again.
    pub max_deferred_waves: u32,
    pub max_session_cost_usd: f64,
    pub max_session_tokens: u64,
    pub budgets: RoleBudgets,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            agent_timeout_secs: 300,
            heartbeat_interval_secs: 30,
            max_retries: 2,
            max_wave_cycles: 5,
            max_deferred_waves: 3,
            max_session_cost_usd: 0.0,
            max_session_tokens: 0,
            budgets: RoleBudgets::default(),
        }
    }
}

impl LimitsConfig {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Stall threshold is twice the heartbeat interval.
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * 2)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleBudgets {
    pub planner: BudgetEntry,
    pub worker: BudgetEntry,
    pub validator: BudgetEntry,
    pub merger: BudgetEntry,
    pub warn_threshold: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetEntry {
    pub usd: f64,
    pub tokens: u64,
}

impl BudgetEntry {
    /// Token budgets take precedence when both are set (config validation
    /// rejects that case anyway).
    pub fn resolve(&self) -> BudgetSpec {
        if self.tokens > 0 {
            BudgetSpec {
                unit: BudgetUnit::Tokens,
                value: self.tokens as f64,
            }
        } else {
            BudgetSpec {
                unit: BudgetUnit::Usd,
                value: self.usd,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetUnit {
    Usd,
    Tokens,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetSpec {
    pub unit: BudgetUnit,
    pub value: f64,
}

impl BudgetSpec {
    pub fn is_limited(&self) -> bool {
        self.value > 0.0
    }
}

impl std::fmt::Display for BudgetSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.is_limited() {
            return write!(f, "unlimited");
        }
        match self.unit {
            BudgetUnit::Usd => write!(f, "${:.2} USD", self.value),
            BudgetUnit::Tokens => write!(f, "{:.0} tokens", self.value),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub max_cpu_seconds: u64,
    pub max_memory_mb: u64,
    pub max_file_size_mb: u64,
    pub max_open_files: u64,
    pub allow_network: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_cpu_seconds: 600,
            max_memory_mb: 2048,
            max_file_size_mb: 50,
            max_open_files: 1024,
            allow_network: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub planner: String,
    pub worker: String,
    pub validator: String,
    pub merger: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            planner: "sonnet".to_string(),
            worker: "sonnet".to_string(),
            validator: "haiku".to_string(),
            merger: "sonnet".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionsConfig {
    pub allowed_paths: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub allowed_tools: Vec<String>,
    pub blocked_tools: Vec<String>,
    pub bash_rules: BashRules,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BashRules {
    pub allowed_commands: Vec<String>,
    pub blocked_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub commit_format: CommitFormatConfig,
    pub file_scope: FileScopeConfig,
    pub validator_diagnostics: ValidatorDiagnosticsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitFormatConfig {
    pub pattern: String,
    pub example: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileScopeConfig {
    pub enforce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorDiagnosticsConfig {
    pub enabled: bool,
    pub commands: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ValidatorDiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            commands: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub archive_after_wave: bool,
    pub include_failure_notes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_given_repo() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        assert!(config.validate().is_ok());
        assert_eq!(config.concurrency.development, 4);
        assert_eq!(config.limits.max_wave_cycles, 5);
        assert_eq!(config.limits.max_deferred_waves, 3);
        assert_eq!(config.models.validator, "haiku");
    }

    #[test]
    fn rejects_zero_deferred_waves() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        config.limits.max_deferred_waves = 0;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_deferred_waves"));
    }

    #[test]
    fn rejects_out_of_range_concurrency() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        config.concurrency.development = 9;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("concurrency.development"));
    }

    #[test]
    fn rejects_dual_session_budget() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        config.limits.max_session_cost_usd = 5.0;
        config.limits.max_session_tokens = 100_000;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("at most one of"));
    }

    #[test]
    fn rejects_dual_role_budget() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        config.limits.budgets.worker = BudgetEntry {
            usd: 1.0,
            tokens: 50_000,
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("budgets.worker"));
    }

    #[test]
    fn rejects_bad_glob_and_regex() {
        let mut config = FlotillaConfig::default();
        config.project.repo = PathBuf::from("/tmp");
        config.permissions.allowed_paths = vec!["src/[".to_string()];
        config.permissions.bash_rules.blocked_patterns = vec!["(unclosed".to_string()];
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("glob"));
        assert!(err.contains("regex"));
    }

    #[test]
    fn token_budget_wins_over_usd() {
        let entry = BudgetEntry {
            usd: 0.0,
            tokens: 9000,
        };
        let spec = entry.resolve();
        assert_eq!(spec.unit, BudgetUnit::Tokens);
        assert_eq!(spec.value, 9000.0);
    }
}
