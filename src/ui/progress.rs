use std::fmt::Write as _;
use std::time::Duration;

use console::style;

use crate::agent::effective_concurrency;
use crate::config::FlotillaConfig;
use crate::recovery::Phase;

/// Live counters for the one-line wave progress display.
#[derive(Debug, Clone)]
pub struct ProgressState {
    pub phase: Phase,
    pub wave_cycle: u32,
    pub running_agents: usize,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub session_cost: f64,
    pub elapsed: Duration,
}

pub fn format_progress(state: &ProgressState) -> String {
    format!(
        "[{}] Wave {} | {} running | {}/{} done | {} failed | ${:.2} | {}s elapsed",
        state.phase,
        state.wave_cycle,
        state.running_agents,
        state.completed,
        state.total_tasks,
        state.failed,
        state.session_cost,
        state.elapsed.as_secs()
    )
}

/// End-of-session accounting.
#[derive(Debug, Clone, Default)]
pub struct CostSummary {
    pub session_id: String,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub wave_cycles: u32,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_merged: usize,
    pub duration: Duration,
    pub cost_limit: f64,
    pub token_limit: u64,
}

pub fn format_cost_summary(summary: &CostSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n=== Session Summary ===");
    let _ = writeln!(out, "Session:    {}", summary.session_id);
    let _ = writeln!(out, "Duration:   {}s", summary.duration.as_secs());
    let _ = writeln!(out, "Waves:      {}", summary.wave_cycles);
    let _ = writeln!(out, "\nTasks:");
    let _ = writeln!(out, "  Completed: {}", summary.tasks_completed);
    let _ = writeln!(out, "  Merged:    {}", summary.tasks_merged);
    let _ = writeln!(out, "  Failed:    {}", summary.tasks_failed);
    let _ = writeln!(out, "\nCost:");
    let _ = writeln!(out, "  Total:     ${:.4}", summary.total_cost);
    if summary.cost_limit > 0.0 {
        let pct = summary.total_cost / summary.cost_limit * 100.0;
        let _ = writeln!(out, "  Limit:     ${:.2} ({:.1}% used)", summary.cost_limit, pct);
    }
    let _ = writeln!(out, "  Tokens:    {}", summary.total_tokens);
    if summary.token_limit > 0 {
        let pct = summary.total_tokens as f64 / summary.token_limit as f64 * 100.0;
        let _ = writeln!(out, "  Limit:     {} ({:.1}% used)", summary.token_limit, pct);
    }
    let _ = writeln!(out, "=======================");
    out
}

pub fn print_banner(config: &FlotillaConfig, task_description: &str, version: &str) {
    println!("{} v{}", style("Flotilla").cyan().bold(), version);
    println!("Project: {}", config.project.name);
    println!("Repo: {}", config.project.repo.display());
    println!("Task: {}", task_description);
    let concurrency = effective_concurrency(&config.concurrency);
    print!("Workers: {}", concurrency);
    if config.concurrency.adaptive && concurrency != config.concurrency.development {
        print!(" (reduced from {} by available RAM)", config.concurrency.development);
    }
    println!("\n");
}

/// Everything a run would do, without spawning anything.
pub fn print_dry_run(config: &FlotillaConfig, task_description: &str) {
    println!("=== Flotilla: Dry Run ===\n");
    println!(
        "Config: {} (schema v{})",
        config.project.name, config.schema_version
    );
    println!(
        "Repo: {} (branch: {})",
        config.project.repo.display(),
        config.project.base_branch
    );
    println!("Task: {}\n", task_description);

    let concurrency = effective_concurrency(&config.concurrency);
    println!("Wave Configuration:");
    println!(
        "  Planning: {} agent(s), model={}",
        config.concurrency.planning, config.models.planner
    );
    println!(
        "  Development: up to {} workers, model={}",
        concurrency, config.models.worker
    );
    if config.concurrency.adaptive {
        println!(
            "    (adaptive: configured={}, effective={})",
            config.concurrency.development, concurrency
        );
    }
    println!(
        "  Validation: up to {} validators, model={}",
        config.concurrency.validation, config.models.validator
    );
    println!(
        "  Merge: {} merger, model={}\n",
        config.concurrency.merge, config.models.merger
    );

    println!("Budget Limits:");
    if config.limits.max_session_cost_usd > 0.0 {
        println!("  Session: ${:.2} USD", config.limits.max_session_cost_usd);
    } else if config.limits.max_session_tokens > 0 {
        println!("  Session: {} tokens", config.limits.max_session_tokens);
    } else {
        println!("  Session: unlimited");
    }
    println!("  Max wave cycles: {}", config.limits.max_wave_cycles);
    println!("  Max retries per task: {}", config.limits.max_retries);
    println!(
        "  Max deferred waves per changeset: {}",
        config.limits.max_deferred_waves
    );
    println!("  Agent timeout: {}s\n", config.limits.agent_timeout_secs);

    println!("Per-Agent Budgets:");
    println!("  Planner:   {}", config.limits.budgets.planner.resolve());
    println!("  Worker:    {}", config.limits.budgets.worker.resolve());
    println!("  Validator: {}", config.limits.budgets.validator.resolve());
    println!("  Merger:    {}\n", config.limits.budgets.merger.resolve());

    println!("Permissions:");
    println!("  Allowed paths: {:?}", config.permissions.allowed_paths);
    println!("  Blocked paths: {:?}", config.permissions.blocked_paths);
    println!("  Allowed tools: {:?}", config.permissions.allowed_tools);
    println!("  Blocked tools: {:?}\n", config.permissions.blocked_tools);

    println!("(Dry run: no agents will be spawned)");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_is_compact() {
        let line = format_progress(&ProgressState {
            phase: Phase::Development,
            wave_cycle: 2,
            running_agents: 3,
            total_tasks: 5,
            completed: 1,
            failed: 0,
            session_cost: 0.75,
            elapsed: Duration::from_secs(90),
        });
        assert!(line.contains("[development] Wave 2"));
        assert!(line.contains("3 running"));
        assert!(line.contains("1/5 done"));
        assert!(line.contains("$0.75"));
    }

    #[test]
    fn cost_summary_shows_limit_percentage() {
        let out = format_cost_summary(&CostSummary {
            session_id: "ses-x".to_string(),
            total_cost: 0.5,
            cost_limit: 1.0,
            total_tokens: 1234,
            wave_cycles: 2,
            tasks_merged: 3,
            ..Default::default()
        });
        assert!(out.contains("ses-x"));
        assert!(out.contains("50.0% used"));
        assert!(out.contains("Merged:    3"));
    }

    #[test]
    fn cost_summary_over_limit_shows_over_100_percent() {
        let out = format_cost_summary(&CostSummary {
            total_cost: 0.5,
            cost_limit: 0.1,
            ..Default::default()
        });
        assert!(out.contains("500.0% used"));
    }
}
