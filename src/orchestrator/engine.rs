use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::agent::{
    self, post_check, AgentHandle, AgentResult, AgentRole, AgentSpawner, LifecycleTracker,
    SpawnRequest, WatcherData,
};
use crate::config::FlotillaConfig;
use crate::error::{FlotillaError, Result};
use crate::locks::LockManager;
use crate::memory::{MemoryProvider, NoopMemory, SessionResult, TaskSummary};
use crate::recovery::{OrchestratorState, Phase, RecoveryStore};
use crate::task::{
    cascade_failure, validate_dependencies, HistoryEntry, Task, TaskFile, TaskStatus, TaskStore,
};
use crate::ui::{
    ChangesetDecision, ChangesetInfo, CostSummary, PlanDecision, Prompter, SessionDecision,
    SessionState, ValidatorDecision,
};
use crate::worktree::WorktreeManager;

/// A cohesion group of validated tasks presented to the human as a unit.
#[derive(Debug, Clone)]
struct Changeset {
    cohesion_group: String,
    task_ids: Vec<String>,
    description: String,
}

enum MergeOutcome {
    Merged,
    Requeued,
    Deferred,
}

/// The outer wave loop: planning, then repeated development, validation,
/// and merge waves until the session completes, the budget trips, or the
/// human stops it.
pub struct Orchestrator {
    config: FlotillaConfig,
    spawner: Arc<dyn AgentSpawner>,
    prompter: Arc<dyn Prompter>,
    task_store: TaskStore,
    scheduler: super::Scheduler,
    recovery: RecoveryStore,
    lifecycle: Arc<LifecycleTracker>,
    worktrees: Option<Arc<WorktreeManager>>,
    locks: Option<Arc<LockManager>>,
    memory: Arc<dyn MemoryProvider>,
    hooks_dir: Option<PathBuf>,

    state: OrchestratorState,
    session_cost: f64,
    session_tokens: u64,

    /// Lock paths held per agent, for per-agent release after results.
    agent_locks: HashMap<String, Vec<String>>,
    /// Consecutive waves each cohesion group has been skipped.
    deferred: HashMap<String, u32>,
    /// Crash recovery state; when set, planning is skipped.
    recovery_state: Option<OrchestratorState>,

    cancel: watch::Receiver<bool>,
    _cancel_tx: Option<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        config: FlotillaConfig,
        spawner: Arc<dyn AgentSpawner>,
        prompter: Arc<dyn Prompter>,
        task_store: TaskStore,
        recovery: RecoveryStore,
        lifecycle: Arc<LifecycleTracker>,
    ) -> Self {
        let concurrency = agent::effective_concurrency(&config.concurrency);
        let session_id = format!("ses-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let (cancel_tx, cancel) = watch::channel(false);
        Self {
            scheduler: super::Scheduler::new(concurrency),
            config,
            spawner,
            prompter,
            task_store,
            recovery,
            lifecycle,
            worktrees: None,
            locks: None,
            memory: Arc::new(NoopMemory),
            hooks_dir: None,
            state: OrchestratorState::new(session_id),
            session_cost: 0.0,
            session_tokens: 0,
            agent_locks: HashMap::new(),
            deferred: HashMap::new(),
            recovery_state: None,
            cancel,
            _cancel_tx: Some(cancel_tx),
        }
    }

    pub fn with_worktrees(mut self, worktrees: Arc<WorktreeManager>) -> Self {
        self.worktrees = Some(worktrees);
        self
    }

    pub fn with_locks(mut self, locks: Arc<LockManager>) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryProvider>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_hooks_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.hooks_dir = Some(dir.into());
        self
    }

    /// When set, `run` skips planning and resumes at the recovered cycle.
    pub fn with_recovery_state(mut self, state: OrchestratorState) -> Self {
        self.recovery_state = Some(state);
        self
    }

    /// External cancellation (signal handler). Replaces the internal
    /// never-firing channel.
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self._cancel_tx = None;
        self
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    pub fn session_id(&self) -> &str {
        &self.state.session_id
    }

    /// Execute the full session. Returns Ok on normal completion,
    /// including budget stops and human stops.
    pub async fn run(&mut self, task_description: &str) -> Result<()> {
        let (monitor_tx, monitor_rx) = watch::channel(false);
        let monitor = {
            let lifecycle = self.lifecycle.clone();
            tokio::spawn(async move { lifecycle.monitor_loop(monitor_rx).await })
        };

        let outcome = self.run_session(task_description).await;

        let _ = monitor_tx.send(true);
        monitor.abort();
        outcome
    }

    async fn run_session(&mut self, task_description: &str) -> Result<()> {
        let start_cycle = match self.recovery_state.take() {
            Some(recovered) => self.restore_recovered_session(recovered).await?,
            None => {
                self.run_planning_phase(task_description).await?;
                1
            }
        };

        let mut last_approved = 0;
        let mut last_requeued = 0;

        for cycle in start_cycle..=self.config.limits.max_wave_cycles {
            if self.cancelled() {
                info!("Cancellation requested, leaving wave loop");
                break;
            }

            self.state.wave_cycle = cycle;
            if let Some(file) = self.task_store.file_mut() {
                file.wave_cycle = cycle;
            }

            if let Err(e) = self.check_budget() {
                self.prompter.warn(&e.to_string());
                break;
            }

            self.enter_phase(Phase::Development).await;
            let results = self.run_development().await;
            self.apply_development_results(results).await;
            self.save_tasks_best_effort("development").await;
            self.prompter.info(&crate::ui::format_progress(&self.progress(Phase::Development)));

            self.enter_phase(Phase::Validation).await;
            let results = self.run_validation().await;
            self.apply_validation_results(results);
            self.save_tasks_best_effort("validation").await;

            self.enter_phase(Phase::Merge).await;
            let changesets = self.collect_changesets();
            let (approved, requeued) = self.review_changesets(changesets).await;
            last_approved = approved;
            last_requeued = requeued;
            self.save_tasks_best_effort("merge").await;

            if self.config.memory.archive_after_wave {
                self.save_session_memory().await;
            }

            if !self.task_store.has_remaining_tasks() {
                self.prompter.info(&format!(
                    "All tasks complete. {} changeset(s) approved.",
                    approved
                ));
                break;
            }

            if self.cancelled() {
                break;
            }

            match self
                .prompter
                .session_continuation(&self.session_state(last_approved, last_requeued))
            {
                SessionDecision::Continue => continue,
                SessionDecision::Replan => return Err(FlotillaError::PlanRejected),
                SessionDecision::Stop => break,
            }
        }

        self.save_session_memory().await;
        self.recovery.remove().await?;
        Ok(())
    }

    // ---- planning ----------------------------------------------------

    async fn run_planning_phase(&mut self, task_description: &str) -> Result<()> {
        self.enter_phase(Phase::Planning).await;

        let mut prior_context = match self.memory.load().await {
            Ok(context) => context.to_prompt_context(),
            Err(e) => {
                warn!(error = %e, "Memory load failed, planning without prior context");
                String::new()
            }
        };

        loop {
            let plan = self.run_planner(task_description, &prior_context).await?;

            self.task_store.set_file(TaskFile::new(
                self.state.session_id.clone(),
                plan.clone(),
            ));
            self.task_store.save().await?;

            self.display_plan(&plan);
            let estimate = estimate_cost(plan.len());
            match self.prompter.plan_approval(plan.len(), &estimate) {
                PlanDecision::Approve => return Ok(()),
                PlanDecision::Abort => return Err(FlotillaError::PlanRejected),
                PlanDecision::Replan { feedback } => {
                    self.prompter.info("Re-planning...");
                    if !feedback.is_empty() {
                        prior_context
                            .push_str(&format!("\n\nUser feedback on previous plan: {}", feedback));
                    }
                }
                PlanDecision::Edit => {
                    // The human edited tasks.yaml on disk; pick it up.
                    self.task_store.load().await?;
                    return Ok(());
                }
            }
        }
    }

    async fn run_planner(&mut self, description: &str, prior_context: &str) -> Result<Vec<Task>> {
        let request = SpawnRequest::new(
            AgentRole::Planner,
            agent::planner_prompt(description, prior_context),
            self.config.project.repo.clone(),
        )
        .with_system_prompt(agent::planner_system_prompt());

        let handle = self.spawner.spawn(request).await?;
        self.lifecycle.register(&handle).await?;
        let agent_id = handle.agent_id.clone();
        let result = handle.wait().await;
        self.lifecycle.unregister(&agent_id, &result).await;
        self.accumulate(&result);

        if !result.succeeded() {
            return Err(FlotillaError::Planning(format!(
                "planner exited with code {}",
                result.exit_code
            )));
        }

        let output = agent::parse_planner_output(&result.raw_stdout)?;
        let tasks: Vec<Task> = output
            .tasks
            .into_iter()
            .map(|pt| {
                let mut task = Task::new(pt.id, pt.title).with_priority(pt.priority);
                task.description = pt.description;
                task.dependencies = pt.dependencies;
                task.file_locks = pt.file_locks;
                task.cohesion_group = pt.cohesion_group;
                task
            })
            .collect();

        validate_dependencies(&tasks)?;
        Ok(tasks)
    }

    fn display_plan(&self, plan: &[Task]) {
        self.prompter.info(&format!(
            "\nPlanned {} task(s), estimated cost: {}\n",
            plan.len(),
            estimate_cost(plan.len())
        ));
        for (i, task) in plan.iter().enumerate() {
            let deps = if task.dependencies.is_empty() {
                "none".to_string()
            } else {
                task.dependencies.join(", ")
            };
            let locks = if task.file_locks.is_empty() {
                "none".to_string()
            } else {
                task.file_locks.join(", ")
            };
            self.prompter.info(&format!(
                "  {}. [{}] {} (priority {})",
                i + 1,
                task.id,
                task.title,
                task.priority
            ));
            self.prompter.info(&format!("     {}", task.description));
            self.prompter
                .info(&format!("     deps: {} | locks: {}", deps, locks));
        }
    }

    // ---- recovery ----------------------------------------------------

    async fn restore_recovered_session(&mut self, recovered: OrchestratorState) -> Result<u32> {
        self.state.session_id = recovered.session_id.clone();
        self.state.start_time = recovered.start_time;
        self.session_cost = recovered.session_cost_usd;
        self.session_tokens = recovered.session_tokens;
        self.state.session_cost_usd = recovered.session_cost_usd;
        self.state.session_tokens = recovered.session_tokens;

        self.task_store.load().await?;

        if let Some(session_id) = self.task_store.session_id() {
            if session_id != recovered.session_id {
                warn!(
                    task_file = session_id,
                    recovery = %recovered.session_id,
                    "Recovery state session id does not match the task file"
                );
            }
        }

        // Claimed tasks belong to dead workers now.
        let reset = self.task_store.reset_claimed_tasks();
        if reset > 0 {
            info!(reset, "Reset claimed tasks back to pending");
        }
        self.task_store.save().await?;

        self.prompter.info(&format!(
            "Resuming session {} from wave cycle {}",
            recovered.session_id, recovered.wave_cycle
        ));
        self.prompter.info(&format!(
            "  Accumulated cost: ${:.2} ({} tokens)",
            self.session_cost, self.session_tokens
        ));
        self.prompter.info(&format!(
            "  Tasks: {} pending, {} done, {} failed, {} merged",
            self.task_store.count_by_status(TaskStatus::Pending),
            self.task_store.count_by_status(TaskStatus::Done),
            self.task_store.count_by_status(TaskStatus::Failed),
            self.task_store.count_by_status(TaskStatus::Merged),
        ));

        Ok(recovered.wave_cycle)
    }

    // ---- development -------------------------------------------------

    async fn run_development(&mut self) -> Vec<AgentResult> {
        let snapshot = self.task_store.tasks();
        let ready = self.scheduler.ready_tasks(&snapshot);
        if ready.is_empty() {
            return Vec::new();
        }

        info!(count = ready.len(), wave_cycle = self.state.wave_cycle, "Starting development wave");

        let mut handles: Vec<AgentHandle> = Vec::new();
        for ready_task in &ready {
            match self.launch_worker(&ready_task.id).await {
                Ok(Some(handle)) => handles.push(handle),
                Ok(None) => {}
                Err(e) => self.prompter.warn(&format!(
                    "could not start worker for {}: {}",
                    ready_task.id, e
                )),
            }
        }

        let lifecycle = self.lifecycle.clone();
        let waits = handles.into_iter().map(|handle| {
            let lifecycle = lifecycle.clone();
            async move {
                let agent_id = handle.agent_id.clone();
                let result = handle.wait().await;
                lifecycle.unregister(&agent_id, &result).await;
                result
            }
        });

        join_all(waits).await
    }

    /// Set up one worker: worktree, locks, hooks, claim, spawn, register.
    /// Each failure rolls back everything acquired before it. `Ok(None)`
    /// means the task was skipped (stays pending for a later wave).
    async fn launch_worker(&mut self, task_id: &str) -> Result<Option<AgentHandle>> {
        let Some(task) = self.task_store.find_task(task_id) else {
            return Ok(None);
        };
        let task = task.clone();

        let agent_id = AgentRole::Worker.new_agent_id();
        let branch = crate::worktree::branch_name(&task.id);

        let worktree_path = match &self.worktrees {
            Some(worktrees) => match worktrees.create(&agent_id, &task.id).await {
                Ok((path, _)) => path,
                Err(e) => {
                    self.prompter
                        .warn(&format!("worktree create for {}: {}", task.id, e));
                    return Ok(None);
                }
            },
            None => self.config.project.repo.clone(),
        };

        if let Some(locks) = &self.locks {
            if !task.file_locks.is_empty() {
                if let Err(e) = locks.acquire(&agent_id, &task.file_locks) {
                    self.prompter
                        .warn(&format!("lock conflict for {}: {}", task.id, e));
                    self.remove_worktree_best_effort(&agent_id).await;
                    return Ok(None);
                }
                self.agent_locks
                    .insert(agent_id.clone(), task.file_locks.clone());
            }
        }

        if let Some(hooks_dir) = self.hooks_dir.clone() {
            let data = WatcherData::build(
                &agent_id,
                AgentRole::Worker,
                Some(&task),
                &self.config,
                &hooks_dir,
            );
            let script_path = hooks_dir
                .join("hooks")
                .join(format!("{}-watcher.sh", agent_id));
            // Hook generation is best-effort; the post-check still stands.
            if let Err(e) = agent::render_watcher_hook(&data, &script_path).await {
                self.prompter
                    .warn(&format!("generate hooks for {}: {}", task.id, e));
            } else if let Err(e) =
                agent::generate_agent_settings(&worktree_path, &script_path).await
            {
                self.prompter
                    .warn(&format!("generate settings for {}: {}", task.id, e));
            }
        }

        let claim_result = match self.task_store.find_task_mut(&task.id) {
            Some(stored) => stored.claim(&agent_id, &worktree_path, &branch),
            None => Err(FlotillaError::TaskNotFound(task.id.clone())),
        };
        if let Err(e) = claim_result {
            warn!(task_id = %task.id, error = %e, "Claim failed");
            self.rollback_worker(&agent_id).await;
            return Ok(None);
        }

        let retry_notes = task
            .history
            .last()
            .map(|entry| entry.notes.clone())
            .unwrap_or_default();
        let request = SpawnRequest::new(
            AgentRole::Worker,
            agent::worker_prompt(&task, &retry_notes),
            worktree_path.clone(),
        )
        .with_agent_id(agent_id.clone())
        .with_system_prompt(agent::worker_system_prompt(&self.config))
        .with_task_id(task.id.clone());

        let handle = match self.spawner.spawn(request).await {
            Ok(handle) => handle,
            Err(e) => {
                // Un-claim and roll back; the task stays pending.
                if let Some(stored) = self.task_store.find_task_mut(&task.id) {
                    stored.status = TaskStatus::Pending;
                    stored.agent_id = None;
                    stored.worktree = None;
                    stored.branch = None;
                }
                self.rollback_worker(&agent_id).await;
                return Err(e);
            }
        };

        self.lifecycle.register(&handle).await?;
        debug!(task_id = %task.id, agent_id = %agent_id, "Worker launched");
        Ok(Some(handle))
    }

    async fn rollback_worker(&mut self, agent_id: &str) {
        if let Some(locks) = &self.locks {
            if self.agent_locks.remove(agent_id).is_some() {
                locks.release(agent_id);
            }
        }
        self.remove_worktree_best_effort(agent_id).await;
    }

    async fn remove_worktree_best_effort(&self, agent_id: &str) {
        if let Some(worktrees) = &self.worktrees {
            if let Err(e) = worktrees.remove(agent_id).await {
                debug!(agent_id, error = %e, "Worktree rollback failed");
            }
        }
    }

    async fn apply_development_results(&mut self, results: Vec<AgentResult>) {
        for result in results {
            self.accumulate(&result);
            self.release_agent_locks(&result.agent_id);

            let Some(task_id) = result.task_id.clone() else {
                continue;
            };
            let Some(task) = self.task_store.find_task(&task_id) else {
                continue;
            };
            let task = task.clone();

            if result.succeeded() {
                match post_check(&task, &self.config).await {
                    Err(e) => {
                        self.prompter
                            .warn(&format!("postcheck error for {}: {}", task_id, e));
                        self.transition(&task_id, |t| t.complete());
                    }
                    Ok(check) if !check.passed() => {
                        let notes = format!("postcheck violations: {}", check.describe());
                        self.transition(&task_id, |t| t.fail(notes.clone()));
                        self.retry_or_cascade(&task_id, &result, "postcheck_failed", &notes);
                    }
                    Ok(_) => {
                        self.transition(&task_id, |t| t.complete());
                    }
                }
            } else {
                let notes = format!("exit code {}", result.exit_code);
                self.transition(&task_id, |t| t.fail(notes.clone()));
                self.retry_or_cascade(&task_id, &result, "failed", &notes);
            }
        }
    }

    /// Requeue when retries remain; otherwise cascade the failure.
    fn retry_or_cascade(
        &mut self,
        task_id: &str,
        result: &AgentResult,
        history_result: &str,
        notes: &str,
    ) {
        let Some(task) = self.task_store.find_task(task_id) else {
            return;
        };

        if task.retry_count < self.config.limits.max_retries {
            let entry = HistoryEntry::new(task.retry_count + 1, history_result)
                .with_agent(result.agent_id.clone())
                .with_notes(notes.to_string())
                .with_cost(result.cost_usd, result.tokens_used);
            self.transition(task_id, |t| t.requeue(entry.clone()));
        } else {
            info!(task_id, "Retries exhausted, cascading failure to dependents");
            if let Some(file) = self.task_store.file_mut() {
                cascade_failure(task_id, &mut file.tasks);
            }
        }
    }

    fn transition(&mut self, task_id: &str, apply: impl Fn(&mut Task) -> Result<()>) {
        if let Some(task) = self.task_store.find_task_mut(task_id) {
            if let Err(e) = apply(task) {
                warn!(task_id, error = %e, "Illegal task transition");
            }
        }
    }

    fn release_agent_locks(&mut self, agent_id: &str) {
        if let Some(locks) = &self.locks {
            if self.agent_locks.remove(agent_id).is_some() {
                locks.release(agent_id);
            }
        }
    }

    // ---- validation --------------------------------------------------

    async fn run_validation(&mut self) -> Vec<AgentResult> {
        let done_tasks: Vec<Task> = self
            .task_store
            .tasks()
            .into_iter()
            .filter(|t| t.status == TaskStatus::Done && t.result.status.is_empty())
            .collect();

        if done_tasks.is_empty() {
            return Vec::new();
        }

        info!(count = done_tasks.len(), "Starting validation wave");

        let mut handles = Vec::new();
        for task in &done_tasks {
            let diff = match &self.worktrees {
                Some(worktrees) => worktrees.diff(&task.id).await.unwrap_or_default(),
                None => String::new(),
            };
            let diagnostics = if self.config.validation.validator_diagnostics.enabled {
                self.config.validation.validator_diagnostics.commands.clone()
            } else {
                Vec::new()
            };

            let working_dir = task
                .worktree
                .clone()
                .unwrap_or_else(|| self.config.project.repo.clone());
            let request = SpawnRequest::new(
                AgentRole::Validator,
                agent::validator_prompt(task, &diff, &diagnostics),
                working_dir,
            )
            .with_system_prompt(agent::validator_system_prompt())
            .with_task_id(task.id.clone());

            match self.spawner.spawn(request).await {
                Ok(handle) => {
                    if let Err(e) = self.lifecycle.register(&handle).await {
                        warn!(error = %e, "Validator registration failed");
                    }
                    handles.push(handle);
                }
                Err(e) => self
                    .prompter
                    .warn(&format!("spawn validator for {}: {}", task.id, e)),
            }
        }

        let lifecycle = self.lifecycle.clone();
        let waits = handles.into_iter().map(|handle| {
            let lifecycle = lifecycle.clone();
            async move {
                let agent_id = handle.agent_id.clone();
                let result = handle.wait().await;
                lifecycle.unregister(&agent_id, &result).await;
                result
            }
        });
        join_all(waits).await
    }

    fn apply_validation_results(&mut self, results: Vec<AgentResult>) {
        for result in results {
            self.accumulate(&result);

            let Some(task_id) = result.task_id.clone() else {
                continue;
            };

            if !result.succeeded() {
                let error = format!("exit code {}", result.exit_code);
                match self.prompter.validator_failed(&task_id, &error) {
                    ValidatorDecision::Retry => {
                        let attempt = self
                            .task_store
                            .find_task(&task_id)
                            .map(|t| t.retry_count + 1)
                            .unwrap_or(1);
                        let entry = HistoryEntry::new(attempt, "validator_failed")
                            .with_agent(result.agent_id.clone())
                            .with_notes(format!("{}, user chose retry", error));
                        self.transition(&task_id, |t| t.requeue(entry.clone()));
                    }
                    ValidatorDecision::SkipTask => {
                        self.transition(&task_id, |t| {
                            t.set_validation_result("fail", "validator failed; skipped by user")
                        });
                    }
                    ValidatorDecision::ManualReview => {
                        self.transition(&task_id, |t| {
                            t.set_validation_result("manual_review", "awaiting manual review")
                        });
                    }
                }
                continue;
            }

            match agent::parse_validator_output(&result.raw_stdout) {
                Ok(output) => {
                    let mut notes = output.notes.clone();
                    if let Some(issues) = &output.issues {
                        if !issues.is_empty() {
                            notes.push_str(&format!("; issues: {}", issues.join(", ")));
                        }
                    }
                    self.transition(&task_id, |t| {
                        t.set_validation_result(output.status.clone(), notes.clone())
                    });
                }
                Err(e) => {
                    self.transition(&task_id, |t| {
                        t.set_validation_result("fail", format!("validator output parse error: {}", e))
                    });
                }
            }
        }
    }

    // ---- merge -------------------------------------------------------

    fn collect_changesets(&self) -> Vec<Changeset> {
        let mut groups: HashMap<String, Changeset> = HashMap::new();

        for task in self.task_store.tasks() {
            if !task.validation_passed() {
                continue;
            }
            let group = task
                .cohesion_group
                .clone()
                .unwrap_or_else(|| "default".to_string());
            let changeset = groups.entry(group.clone()).or_insert_with(|| Changeset {
                cohesion_group: group,
                task_ids: Vec::new(),
                description: String::new(),
            });
            changeset.task_ids.push(task.id.clone());
            changeset.description.push_str(&task.title);
            changeset.description.push_str("; ");
        }

        let mut changesets: Vec<Changeset> = groups.into_values().collect();
        changesets.sort_by(|a, b| a.cohesion_group.cmp(&b.cohesion_group));
        changesets
    }

    async fn review_changesets(&mut self, changesets: Vec<Changeset>) -> (usize, usize) {
        let mut approved = 0;
        let mut requeued = 0;
        let total = changesets.len();

        for (index, changeset) in changesets.into_iter().enumerate() {
            let mut diff = String::new();
            if let Some(worktrees) = &self.worktrees {
                for task_id in &changeset.task_ids {
                    if let Ok(task_diff) = worktrees.diff(task_id).await {
                        diff.push_str(&task_diff);
                    }
                }
            }

            let info = ChangesetInfo {
                index: index + 1,
                total,
                cohesion_group: changeset.cohesion_group.clone(),
                description: changeset.description.clone(),
                task_ids: changeset.task_ids.clone(),
                diff,
                deferred_waves: *self.deferred.get(&changeset.cohesion_group).unwrap_or(&0),
            };

            match self.prompter.changeset_review(&info) {
                ChangesetDecision::Approve => {
                    self.deferred.remove(&changeset.cohesion_group);
                    match self.merge_changeset(&changeset).await {
                        MergeOutcome::Merged => approved += 1,
                        MergeOutcome::Requeued => requeued += changeset.task_ids.len(),
                        MergeOutcome::Deferred => {
                            *self
                                .deferred
                                .entry(changeset.cohesion_group.clone())
                                .or_insert(0) += 1;
                        }
                    }
                }
                ChangesetDecision::Reject { reason } => {
                    self.deferred.remove(&changeset.cohesion_group);
                    requeued += changeset.task_ids.len();
                    self.requeue_changeset(&changeset, "rejected", &reason);
                }
                ChangesetDecision::Skip => {
                    let skips = {
                        let counter = self
                            .deferred
                            .entry(changeset.cohesion_group.clone())
                            .or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    // Repeated skipping cannot carry a changeset forever:
                    // past the bound it goes back through development.
                    if skips >= self.config.limits.max_deferred_waves {
                        let note =
                            format!("skipped in {} consecutive waves without a decision", skips);
                        self.prompter.warn(&format!(
                            "changeset {} {}; requeueing",
                            changeset.cohesion_group, note
                        ));
                        self.deferred.remove(&changeset.cohesion_group);
                        requeued += changeset.task_ids.len();
                        self.requeue_changeset(&changeset, "deferred", &note);
                    }
                }
            }
        }

        (approved, requeued)
    }

    /// Merge one approved changeset.
    async fn merge_changeset(&mut self, changeset: &Changeset) -> MergeOutcome {
        let branches: Vec<agent::BranchInfo> = changeset
            .task_ids
            .iter()
            .filter_map(|task_id| {
                let task = self.task_store.find_task(task_id)?;
                Some(agent::BranchInfo {
                    name: task.branch.clone()?,
                    task_id: task.id.clone(),
                    task_title: task.title.clone(),
                })
            })
            .collect();

        if !branches.is_empty() {
            let request = SpawnRequest::new(
                AgentRole::Merger,
                agent::merger_prompt(&branches, &self.config.project.base_branch),
                self.config.project.repo.clone(),
            );
            match self.spawner.spawn(request).await {
                Ok(handle) => {
                    if let Err(e) = self.lifecycle.register(&handle).await {
                        warn!(error = %e, "Merger registration failed");
                    }
                    let agent_id = handle.agent_id.clone();
                    let result = handle.wait().await;
                    self.lifecycle.unregister(&agent_id, &result).await;
                    self.accumulate(&result);

                    if !result.succeeded() {
                        let note = format!(
                            "merger exited with code {} for group {}",
                            result.exit_code, changeset.cohesion_group
                        );
                        self.prompter.warn(&note);
                        self.requeue_changeset(changeset, "merge_failed", &note);
                        return MergeOutcome::Requeued;
                    }
                }
                Err(e) => {
                    // Transient: the changeset stays done+pass for the next
                    // wave.
                    self.prompter.warn(&format!(
                        "spawn merger for group {}: {}",
                        changeset.cohesion_group, e
                    ));
                    return MergeOutcome::Deferred;
                }
            }
        }

        // Fold branches into base mechanically; the merger agent's work
        // makes this a fast-forward in the common case.
        if let Some(worktrees) = self.worktrees.clone() {
            for task_id in &changeset.task_ids {
                if let Some(agent_id) = self
                    .task_store
                    .find_task(task_id)
                    .and_then(|t| t.agent_id.clone())
                {
                    self.remove_worktree_best_effort(&agent_id).await;
                }
                if let Err(e) = worktrees.merge_branch(task_id).await {
                    let note = format!("merge conflict folding {}: {}", task_id, e);
                    self.prompter.warn(&note);
                    self.requeue_changeset(changeset, "merge_conflict", &note);
                    return MergeOutcome::Requeued;
                }
            }
        }

        for task_id in &changeset.task_ids {
            self.transition(task_id, |t| t.approve());
            if let Some(worktrees) = &self.worktrees {
                // A leftover branch is recoverable via `flotilla cleanup`.
                if let Err(e) = worktrees.remove_branch(task_id).await {
                    self.prompter
                        .warn(&format!("remove branch for {}: {}", task_id, e));
                }
            }
        }

        MergeOutcome::Merged
    }

    fn requeue_changeset(&mut self, changeset: &Changeset, result: &str, reason: &str) {
        for task_id in &changeset.task_ids {
            let attempt = self
                .task_store
                .find_task(task_id)
                .map(|t| t.retry_count + 1)
                .unwrap_or(1);
            let entry = HistoryEntry::new(attempt, result).with_rejection(reason.to_string());
            self.transition(task_id, |t| t.requeue(entry.clone()));
        }
    }

    // ---- bookkeeping -------------------------------------------------

    async fn enter_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.session_cost_usd = self.session_cost;
        self.state.session_tokens = self.session_tokens;
        if let Err(e) = self.recovery.save(&mut self.state).await {
            warn!(error = %e, "Failed to persist recovery state");
        }
    }

    async fn save_tasks_best_effort(&self, phase: &str) {
        if let Err(e) = self.task_store.save().await {
            self.prompter
                .warn(&format!("save tasks after {}: {}", phase, e));
        }
    }

    fn check_budget(&self) -> Result<()> {
        let limits = &self.config.limits;
        if limits.max_session_cost_usd > 0.0 && self.session_cost >= limits.max_session_cost_usd {
            return Err(FlotillaError::BudgetExceeded(format!(
                "session cost ${:.2} exceeds limit ${:.2}",
                self.session_cost, limits.max_session_cost_usd
            )));
        }
        if limits.max_session_tokens > 0 && self.session_tokens >= limits.max_session_tokens {
            return Err(FlotillaError::BudgetExceeded(format!(
                "session tokens {} exceeds limit {}",
                self.session_tokens, limits.max_session_tokens
            )));
        }
        Ok(())
    }

    fn accumulate(&mut self, result: &AgentResult) {
        self.session_cost += result.cost_usd;
        self.session_tokens += result.tokens_used;
        self.state.session_cost_usd = self.session_cost;
        self.state.session_tokens = self.session_tokens;
    }

    fn progress(&self, phase: Phase) -> crate::ui::ProgressState {
        let tasks = self.task_store.tasks();
        crate::ui::ProgressState {
            phase,
            wave_cycle: self.state.wave_cycle,
            running_agents: self.lifecycle.running_count(),
            total_tasks: tasks.len(),
            completed: tasks
                .iter()
                .filter(|t| matches!(t.status, TaskStatus::Done | TaskStatus::Merged))
                .count(),
            failed: self.task_store.count_by_status(TaskStatus::Failed),
            session_cost: self.session_cost,
            elapsed: (Utc::now() - self.state.start_time).to_std().unwrap_or_default(),
        }
    }

    fn session_state(&self, approved: usize, requeued: usize) -> SessionState {
        let mut requeued_tasks = Vec::new();
        let mut blocked = 0;
        for task in self.task_store.tasks() {
            if task.status == TaskStatus::Pending && task.retry_count > 0 {
                requeued_tasks.push(task.id.clone());
            }
            if task.status == TaskStatus::Blocked {
                blocked += 1;
            }
        }

        SessionState {
            wave_cycle: self.state.wave_cycle,
            approved,
            requeued,
            blocked,
            total_cost: self.session_cost,
            cost_limit: self.config.limits.max_session_cost_usd,
            tokens_used: self.session_tokens,
            token_limit: self.config.limits.max_session_tokens,
            requeued_tasks,
        }
    }

    async fn save_session_memory(&self) {
        let mut session = SessionResult {
            id: self.state.session_id.clone(),
            total_cost_usd: self.session_cost,
            total_tokens: self.session_tokens,
            wave_cycles: self.state.wave_cycle,
            ..Default::default()
        };

        for task in self.task_store.tasks() {
            let summary = TaskSummary {
                id: task.id.clone(),
                title: task.title.clone(),
                result_status: task.status.to_string(),
                validator_notes: task.result.notes.clone(),
                failure_reason: if task.status == TaskStatus::Failed {
                    task.result.notes.clone()
                } else {
                    String::new()
                },
                retry_count: task.retry_count,
            };
            match task.status {
                TaskStatus::Merged | TaskStatus::Done => {
                    session.completed_tasks.push(summary.clone())
                }
                TaskStatus::Failed => session.failed_tasks.push(summary.clone()),
                _ => {}
            }
            session.all_tasks.push(summary);
        }

        if let Err(e) = self.memory.save(&session).await {
            self.prompter.warn(&format!("save session memory: {}", e));
        }
    }

    /// Final accounting for the end-of-session summary.
    pub fn session_summary(&self) -> CostSummary {
        CostSummary {
            session_id: self.state.session_id.clone(),
            total_cost: self.session_cost,
            total_tokens: self.session_tokens,
            wave_cycles: self.state.wave_cycle,
            tasks_completed: self.task_store.count_by_status(TaskStatus::Done),
            tasks_failed: self.task_store.count_by_status(TaskStatus::Failed),
            tasks_merged: self.task_store.count_by_status(TaskStatus::Merged),
            duration: (Utc::now() - self.state.start_time).to_std().unwrap_or_default(),
            cost_limit: self.config.limits.max_session_cost_usd,
            token_limit: self.config.limits.max_session_tokens,
        }
    }
}

fn estimate_cost(task_count: usize) -> String {
    let low = task_count as f64 * 0.50;
    let high = task_count as f64 * 3.00;
    format!("${:.2} - ${:.2}", low, high)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_estimate_scales_with_task_count() {
        assert_eq!(estimate_cost(2), "$1.00 - $6.00");
        assert_eq!(estimate_cost(0), "$0.00 - $0.00");
    }
}
