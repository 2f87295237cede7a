use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use flotilla::agent::{ClaudeSpawner, LifecycleConfig, LifecycleTracker};
use flotilla::config::FlotillaConfig;
use flotilla::memory::{BeadsMemory, MemoryProvider, NoopMemory};
use flotilla::orchestrator::{cleanup_stale_state, format_cleanup_report, Orchestrator};
use flotilla::recovery::RecoveryStore;
use flotilla::task::TaskStore;
use flotilla::ui::{self, Prompter, RecoveryDecision, ScriptedPrompter, TerminalPrompter};
use flotilla::worktree::{check_disk_space, WorktreeManager, MIN_DISK_SPACE_MB};
use flotilla::LockManager;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "flotilla", version, about = "Wave-based orchestrator for fleets of Claude agents")]
struct Cli {
    /// Path to the flotilla.yaml config file
    #[arg(long, default_value = "flotilla.yaml", global = true)]
    config: PathBuf,

    /// Task description for the planner
    #[arg(long)]
    task: Option<String>,

    /// Show what would happen without spawning agents
    #[arg(long)]
    dry_run: bool,

    /// Decisions file for non-interactive runs
    #[arg(long)]
    decisions_file: Option<PathBuf>,

    /// Positional task description (alternative to --task)
    description: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Kill orphans, remove stale worktrees, locks, and recovery state
    Cleanup,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run(cli: Cli) -> flotilla::Result<()> {
    let config = FlotillaConfig::load(&cli.config).await?;

    if let Some(Command::Cleanup) = cli.command {
        return run_cleanup(config).await;
    }

    let task_description = match cli.task.or(cli.description) {
        Some(description) => description,
        None => {
            eprintln!("Usage: flotilla --task 'description' [--config flotilla.yaml]");
            eprintln!("       flotilla 'description'");
            eprintln!("       flotilla cleanup [--config flotilla.yaml]");
            std::process::exit(1);
        }
    };

    if cli.dry_run {
        ui::print_dry_run(&config, &task_description);
        return Ok(());
    }

    ui::print_banner(&config, &task_description, VERSION);

    let state_dir = config.state_dir();
    tokio::fs::create_dir_all(&state_dir).await?;

    check_disk_space(&config.project.repo, MIN_DISK_SPACE_MB)?;

    let locks = Arc::new(LockManager::new(state_dir.join("locks")));
    let recovery = RecoveryStore::new(&state_dir);
    let task_store = TaskStore::new(config.tasks_path());
    let lifecycle = Arc::new(LifecycleTracker::new(LifecycleConfig {
        persist_path: state_dir.join("agents.json"),
        heartbeat_interval: config.limits.heartbeat_interval(),
        agent_timeout: config.limits.agent_timeout(),
        stall_threshold: config.limits.stall_threshold(),
        audit_dir: state_dir.join("audit"),
    }));
    let worktrees = Arc::new(WorktreeManager::new(
        config.project.repo.clone(),
        config.project.worktree_dir.clone(),
        config.project.base_branch.clone(),
    ));

    let report = cleanup_stale_state(&lifecycle, &locks, &worktrees, &recovery).await?;
    let summary = format_cleanup_report(&report);
    if summary != "Clean startup, no stale state found." {
        println!("{}", summary);
    }

    let prompter: Arc<dyn Prompter> = match &cli.decisions_file {
        Some(path) => Arc::new(ScriptedPrompter::from_file(path)),
        None => Arc::new(TerminalPrompter::new()),
    };

    let mut recovery_state = None;
    if let Some(found) = report.recovery_state {
        match prompter.crash_recovery(&found) {
            RecoveryDecision::Resume => recovery_state = Some(found),
            RecoveryDecision::Fresh => recovery.remove().await?,
        }
    }

    let memory: Arc<dyn MemoryProvider> = if config.memory.enabled {
        Arc::new(BeadsMemory::new(config.memory.clone()))
    } else {
        Arc::new(NoopMemory)
    };

    let spawner = Arc::new(ClaudeSpawner::new(config.clone()));
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let mut orchestrator = Orchestrator::new(
        config.clone(),
        spawner,
        prompter,
        task_store,
        recovery,
        lifecycle.clone(),
    )
    .with_worktrees(worktrees)
    .with_locks(locks.clone())
    .with_memory(memory)
    .with_hooks_dir(&state_dir)
    .with_cancellation(cancel_rx);
    if let Some(state) = recovery_state {
        orchestrator = orchestrator.with_recovery_state(state);
    }

    // Graceful shutdown: soft-signal wave, 10 s grace, hard kill. A second
    // signal force-exits.
    {
        let lifecycle = lifecycle.clone();
        let locks = locks.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            eprintln!("\nReceived signal, shutting down gracefully...");
            lifecycle
                .graceful_shutdown(std::time::Duration::from_secs(10))
                .await;
            locks.release_all();
            let _ = cancel_tx.send(true);
            wait_for_signal().await;
            eprintln!("Force exit.");
            std::process::exit(1);
        });
    }

    let outcome = orchestrator.run(&task_description).await;

    let mut summary = orchestrator.session_summary();
    summary.cost_limit = config.limits.max_session_cost_usd;
    summary.token_limit = config.limits.max_session_tokens;
    locks.release_all();

    match outcome {
        Ok(()) => {
            print!("{}", ui::format_cost_summary(&summary));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn run_cleanup(config: FlotillaConfig) -> flotilla::Result<()> {
    let state_dir = config.state_dir();

    let locks = LockManager::new(state_dir.join("locks"));
    let recovery = RecoveryStore::new(&state_dir);
    let lifecycle = LifecycleTracker::new(LifecycleConfig::new(&state_dir));
    let worktrees = WorktreeManager::new(
        config.project.repo.clone(),
        config.project.worktree_dir.clone(),
        config.project.base_branch.clone(),
    );

    println!("Flotilla Cleanup\n");

    let report = cleanup_stale_state(&lifecycle, &locks, &worktrees, &recovery).await?;
    println!("{}", format_cleanup_report(&report));

    if !report.stale_worktrees.is_empty() {
        println!("\nRemoving {} stale worktree(s)...", report.stale_worktrees.len());
        for worktree in &report.stale_worktrees {
            println!("  Removing: {}", worktree.display());
            if let Err(e) = tokio::fs::remove_dir_all(worktree).await {
                warn!(path = %worktree.display(), error = %e, "Worktree removal failed");
            }
        }
    }

    if report.recovery_state.is_some() {
        recovery.remove().await?;
        println!("Removed recovery state.");
    }

    println!("\nCleanup complete.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(_) => return std::future::pending().await,
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
