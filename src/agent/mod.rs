mod envelope;
mod hooks;
mod lifecycle;
mod mock;
mod postcheck;
mod prompts;
mod sandbox;
mod spawner;
mod sysinfo;

pub use envelope::{
    extract_result_json, parse_planner_output, parse_validator_output, AgentEnvelope,
    PlannerOutput, PlannerTask, TokenUsage, ValidatorOutput,
};
pub use hooks::{generate_agent_settings, render_watcher_hook, WatcherData};
pub use lifecycle::{
    kill_group, process_alive, terminate_group, AgentEntry, AgentProcessStatus, LifecycleConfig,
    LifecycleTracker,
};
pub use mock::{MockOutcome, MockSpawner};
pub use postcheck::{post_check, PostCheckResult, Violation, ViolationKind};
pub use prompts::{
    merger_prompt, planner_prompt, planner_system_prompt, validator_prompt,
    validator_system_prompt, worker_prompt, worker_system_prompt, BranchInfo,
};
pub use sandbox::sandboxed_command;
pub use spawner::{
    AgentHandle, AgentResult, AgentRole, AgentSpawner, ClaudeSpawner, SpawnRequest,
};
pub use sysinfo::{available_ram_mb, effective_concurrency};
