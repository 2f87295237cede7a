mod progress;
mod prompt;

pub use progress::{format_cost_summary, format_progress, print_banner, print_dry_run, CostSummary, ProgressState};
pub use prompt::{
    ChangesetDecision, ChangesetInfo, PlanDecision, Prompter, RecoveryDecision, ScriptedPrompter,
    SessionDecision, SessionState, TerminalPrompter, ValidatorDecision,
};
