use std::io::{BufRead, Write};
use std::path::Path;

use console::style;
use parking_lot::Mutex;

use crate::recovery::OrchestratorState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Approve,
    /// Human edits tasks.yaml on disk; the file is reloaded afterwards.
    Edit,
    Replan { feedback: String },
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetDecision {
    Approve,
    Reject { reason: String },
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    Continue,
    Replan,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryDecision {
    Resume,
    Fresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorDecision {
    ManualReview,
    SkipTask,
    Retry,
}

/// A changeset presented for human review.
#[derive(Debug, Clone, Default)]
pub struct ChangesetInfo {
    pub index: usize,
    pub total: usize,
    pub cohesion_group: String,
    pub description: String,
    pub task_ids: Vec<String>,
    pub diff: String,
    /// Skipped in this many previous waves.
    pub deferred_waves: u32,
}

/// Session counters shown at the continuation prompt.
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub wave_cycle: u32,
    pub approved: usize,
    pub requeued: usize,
    pub blocked: usize,
    pub total_cost: f64,
    pub cost_limit: f64,
    pub tokens_used: u64,
    pub token_limit: u64,
    pub requeued_tasks: Vec<String>,
}

/// The human-in-the-loop capability. Keep it narrow: decisions in,
/// decisions out, no orchestration logic.
pub trait Prompter: Send + Sync {
    fn plan_approval(&self, task_count: usize, estimated_cost: &str) -> PlanDecision;
    fn changeset_review(&self, changeset: &ChangesetInfo) -> ChangesetDecision;
    fn session_continuation(&self, state: &SessionState) -> SessionDecision;
    fn validator_failed(&self, task_id: &str, error: &str) -> ValidatorDecision;
    fn crash_recovery(&self, state: &OrchestratorState) -> RecoveryDecision;
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
}

/// Interactive prompter over stdin/stdout.
pub struct TerminalPrompter;

impl TerminalPrompter {
    pub fn new() -> Self {
        Self
    }

    fn read_line(&self) -> String {
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        line.trim().to_lowercase()
    }

    fn ask(&self, prompt: &str) -> String {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
        self.read_line()
    }
}

impl Default for TerminalPrompter {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompter for TerminalPrompter {
    fn plan_approval(&self, task_count: usize, estimated_cost: &str) -> PlanDecision {
        println!("\nPlanned {} task(s), estimated cost: {}", task_count, estimated_cost);
        match self
            .ask("(a)pprove / (e)dit tasks.yaml / (r)e-plan / (q)uit? ")
            .as_str()
        {
            "a" | "approve" => PlanDecision::Approve,
            "e" | "edit" => PlanDecision::Edit,
            "r" | "replan" | "re-plan" => {
                let feedback = self.ask("What should change? ");
                PlanDecision::Replan { feedback }
            }
            _ => PlanDecision::Abort,
        }
    }

    fn changeset_review(&self, changeset: &ChangesetInfo) -> ChangesetDecision {
        println!(
            "\nChangeset {}/{}: [{}] {}",
            changeset.index, changeset.total, changeset.cohesion_group, changeset.description
        );
        println!("  Tasks: {}", changeset.task_ids.join(", "));
        if changeset.deferred_waves > 0 {
            println!(
                "  {} skipped in {} previous wave(s)",
                style("NOTE:").yellow(),
                changeset.deferred_waves
            );
        }

        loop {
            match self.ask("  (a)pprove / (r)eject / (v)iew diff / (s)kip? ").as_str() {
                "a" | "approve" => return ChangesetDecision::Approve,
                "r" | "reject" => {
                    let reason = self.ask("  Rejection reason: ");
                    return ChangesetDecision::Reject { reason };
                }
                "v" | "view" => println!("{}", changeset.diff),
                _ => return ChangesetDecision::Skip,
            }
        }
    }

    fn session_continuation(&self, state: &SessionState) -> SessionDecision {
        println!("\nWave cycle {} complete.", state.wave_cycle);
        println!("  Approved: {} changeset(s)", state.approved);
        print!("  Re-queued: {} task(s)", state.requeued);
        if !state.requeued_tasks.is_empty() {
            print!(" ({})", state.requeued_tasks.join(", "));
        }
        println!();
        println!("  Blocked: {} task(s)", state.blocked);
        if state.cost_limit > 0.0 {
            println!(
                "  Session budget: ${:.2} / ${:.2} USD limit",
                state.total_cost, state.cost_limit
            );
        } else if state.token_limit > 0 {
            println!(
                "  Session budget: {} / {} token limit",
                state.tokens_used, state.token_limit
            );
        }

        match self.ask("\n  (c)ontinue / (r)e-plan / (s)top? ").as_str() {
            "c" | "continue" => SessionDecision::Continue,
            "r" | "replan" | "re-plan" => SessionDecision::Replan,
            _ => SessionDecision::Stop,
        }
    }

    fn validator_failed(&self, task_id: &str, error: &str) -> ValidatorDecision {
        println!("\nValidator failed for {}: {}", task_id, error);
        match self.ask("  (m)anual review / (s)kip task / (r)etry? ").as_str() {
            "m" | "manual" => ValidatorDecision::ManualReview,
            "r" | "retry" => ValidatorDecision::Retry,
            _ => ValidatorDecision::SkipTask,
        }
    }

    fn crash_recovery(&self, state: &OrchestratorState) -> RecoveryDecision {
        println!("\nPrevious session found: {}", state.session_id);
        println!("  Wave cycle: {}, phase: {}", state.wave_cycle, state.phase);
        println!(
            "  Cost so far: ${:.2} ({} tokens)",
            state.session_cost_usd, state.session_tokens
        );
        match self.ask("\n(r)esume / (f)resh? ").as_str() {
            "r" | "resume" => RecoveryDecision::Resume,
            _ => RecoveryDecision::Fresh,
        }
    }

    fn info(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        eprintln!("{} {}", style("WARNING:").yellow().bold(), message);
    }
}

/// Pre-populated decisions for CI and tests, loadable from a plain-text
/// decisions file (one decision per line, `#` comments allowed).
#[derive(Default)]
pub struct ScriptedPrompter {
    plan: Mutex<Vec<PlanDecision>>,
    changeset: Mutex<Vec<ChangesetDecision>>,
    session: Mutex<Vec<SessionDecision>>,
    validator: Mutex<Vec<ValidatorDecision>>,
    recovery: Mutex<Vec<RecoveryDecision>>,
    messages: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_plan(&self, decision: PlanDecision) {
        self.plan.lock().push(decision);
    }

    pub fn push_changeset(&self, decision: ChangesetDecision) {
        self.changeset.lock().push(decision);
    }

    pub fn push_session(&self, decision: SessionDecision) {
        self.session.lock().push(decision);
    }

    pub fn push_validator(&self, decision: ValidatorDecision) {
        self.validator.lock().push(decision);
    }

    pub fn push_recovery(&self, decision: RecoveryDecision) {
        self.recovery.lock().push(decision);
    }

    /// Everything info'd or warned so far, for assertions.
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn from_file(path: &Path) -> Self {
        let prompter = Self::new();
        let Ok(content) = std::fs::read_to_string(path) else {
            return prompter;
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match line.to_lowercase().as_str() {
                "approve" | "plan-approve" => prompter.push_plan(PlanDecision::Approve),
                "plan-edit" => prompter.push_plan(PlanDecision::Edit),
                "plan-replan" => prompter.push_plan(PlanDecision::Replan {
                    feedback: String::new(),
                }),
                "plan-abort" => prompter.push_plan(PlanDecision::Abort),
                "changeset-approve" => prompter.push_changeset(ChangesetDecision::Approve),
                "changeset-reject" => prompter.push_changeset(ChangesetDecision::Reject {
                    reason: "rejected via decisions file".to_string(),
                }),
                "changeset-skip" => prompter.push_changeset(ChangesetDecision::Skip),
                "continue" => prompter.push_session(SessionDecision::Continue),
                "replan" => prompter.push_session(SessionDecision::Replan),
                "stop" => prompter.push_session(SessionDecision::Stop),
                "validator-manual" => prompter.push_validator(ValidatorDecision::ManualReview),
                "validator-skip" => prompter.push_validator(ValidatorDecision::SkipTask),
                "validator-retry" => prompter.push_validator(ValidatorDecision::Retry),
                "recovery-resume" => prompter.push_recovery(RecoveryDecision::Resume),
                "recovery-fresh" => prompter.push_recovery(RecoveryDecision::Fresh),
                _ => {}
            }
        }
        prompter
    }

    fn pop<T: Clone>(queue: &Mutex<Vec<T>>) -> Option<T> {
        let mut queue = queue.lock();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn plan_approval(&self, _task_count: usize, _estimated_cost: &str) -> PlanDecision {
        Self::pop(&self.plan).unwrap_or(PlanDecision::Abort)
    }

    fn changeset_review(&self, changeset: &ChangesetInfo) -> ChangesetDecision {
        // A changeset flagged as repeatedly deferred auto-skips so scripted
        // runs cannot wedge on it.
        if changeset.deferred_waves > 0 && self.changeset.lock().is_empty() {
            return ChangesetDecision::Skip;
        }
        Self::pop(&self.changeset).unwrap_or(ChangesetDecision::Approve)
    }

    fn session_continuation(&self, _state: &SessionState) -> SessionDecision {
        Self::pop(&self.session).unwrap_or(SessionDecision::Stop)
    }

    fn validator_failed(&self, _task_id: &str, _error: &str) -> ValidatorDecision {
        Self::pop(&self.validator).unwrap_or(ValidatorDecision::SkipTask)
    }

    fn crash_recovery(&self, _state: &OrchestratorState) -> RecoveryDecision {
        Self::pop(&self.recovery).unwrap_or(RecoveryDecision::Fresh)
    }

    fn info(&self, message: &str) {
        self.messages.lock().push(message.to_string());
    }

    fn warn(&self, message: &str) {
        self.messages.lock().push(format!("WARN: {}", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_prompter_pops_in_order() {
        let prompter = ScriptedPrompter::new();
        prompter.push_plan(PlanDecision::Replan {
            feedback: "more tasks".to_string(),
        });
        prompter.push_plan(PlanDecision::Approve);

        assert_eq!(
            prompter.plan_approval(1, "$1"),
            PlanDecision::Replan {
                feedback: "more tasks".to_string()
            }
        );
        assert_eq!(prompter.plan_approval(1, "$1"), PlanDecision::Approve);
        // Exhausted queue aborts rather than looping forever.
        assert_eq!(prompter.plan_approval(1, "$1"), PlanDecision::Abort);
    }

    #[test]
    fn from_file_parses_decisions() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("decisions.txt");
        std::fs::write(
            &path,
            "# happy path\napprove\nchangeset-approve\nstop\nrecovery-resume\n",
        )
        .unwrap();

        let prompter = ScriptedPrompter::from_file(&path);
        assert_eq!(prompter.plan_approval(2, "$2"), PlanDecision::Approve);
        assert_eq!(
            prompter.changeset_review(&ChangesetInfo::default()),
            ChangesetDecision::Approve
        );
        assert_eq!(
            prompter.session_continuation(&SessionState::default()),
            SessionDecision::Stop
        );
        assert_eq!(
            prompter.crash_recovery(&OrchestratorState::new("s")),
            RecoveryDecision::Resume
        );
    }

    #[test]
    fn deferred_changeset_auto_skips_when_unscripted() {
        let prompter = ScriptedPrompter::new();
        let changeset = ChangesetInfo {
            deferred_waves: 3,
            ..Default::default()
        };
        assert_eq!(prompter.changeset_review(&changeset), ChangesetDecision::Skip);
    }

    #[test]
    fn messages_are_recorded() {
        let prompter = ScriptedPrompter::new();
        prompter.info("hello");
        prompter.warn("uh oh");
        assert_eq!(prompter.messages(), vec!["hello", "WARN: uh oh"]);
    }
}
