use std::path::PathBuf;

use tracing::{info, warn};

use crate::agent::{kill_group, process_alive, LifecycleTracker};
use crate::error::Result;
use crate::locks::LockManager;
use crate::recovery::{OrchestratorState, RecoveryStore};
use crate::worktree::WorktreeManager;

/// What startup cleanup found and did.
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub orphans_killed: usize,
    pub stale_locks_cleaned: usize,
    pub stale_worktrees: Vec<PathBuf>,
    pub recovery_state: Option<OrchestratorState>,
}

/// Reconcile leftovers from a crashed prior session before any new work:
/// kill orphan agent processes, clean stale lockfiles, enumerate on-disk
/// worktrees, and surface any recovery state.
pub async fn cleanup_stale_state(
    lifecycle: &LifecycleTracker,
    locks: &LockManager,
    worktrees: &WorktreeManager,
    recovery: &RecoveryStore,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();

    match lifecycle.load_stale_agents().await {
        Ok(stale) => {
            for agent in stale {
                if process_alive(agent.pid) {
                    kill_group(agent.pgid, agent.pid);
                    info!(agent_id = %agent.id, pid = agent.pid, "Killed orphan agent");
                    report.orphans_killed += 1;
                }
            }
        }
        Err(e) => warn!(error = %e, "Could not load stale agent registry"),
    }

    match locks.clean_stale() {
        Ok(cleaned) => report.stale_locks_cleaned = cleaned,
        Err(e) => warn!(error = %e, "Stale lock cleanup failed"),
    }

    match worktrees.find_stale().await {
        Ok(stale) => {
            if !stale.is_empty() {
                info!(count = stale.len(), "Found stale worktrees from a previous session");
            }
            report.stale_worktrees = stale;
        }
        Err(e) => warn!(error = %e, "Stale worktree detection failed"),
    }

    if recovery.exists() {
        match recovery.load().await {
            Ok(state) => {
                info!(
                    wave_cycle = state.wave_cycle,
                    phase = %state.phase,
                    "Found recovery state"
                );
                report.recovery_state = Some(state);
            }
            Err(e) => warn!(error = %e, "Could not load recovery state"),
        }
    }

    Ok(report)
}

pub fn format_cleanup_report(report: &CleanupReport) -> String {
    let mut message = String::new();
    if report.orphans_killed > 0 {
        message.push_str(&format!("Killed {} orphan agent(s). ", report.orphans_killed));
    }
    if report.stale_locks_cleaned > 0 {
        message.push_str(&format!(
            "Cleaned {} stale lock(s). ",
            report.stale_locks_cleaned
        ));
    }
    if !report.stale_worktrees.is_empty() {
        message.push_str(&format!(
            "Found {} stale worktree(s). ",
            report.stale_worktrees.len()
        ));
    }
    if let Some(state) = &report.recovery_state {
        message.push_str(&format!(
            "Recovery state available (wave {}, phase {}).",
            state.wave_cycle, state.phase
        ));
    }
    if message.is_empty() {
        message.push_str("Clean startup, no stale state found.");
    }
    message.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LifecycleConfig;
    use crate::recovery::Phase;
    use tempfile::TempDir;

    fn fixtures(dir: &TempDir) -> (LifecycleTracker, LockManager, WorktreeManager, RecoveryStore) {
        let state_dir = dir.path().join(".flotilla");
        (
            LifecycleTracker::new(LifecycleConfig::new(&state_dir)),
            LockManager::new(state_dir.join("locks")),
            WorktreeManager::new(dir.path(), ".trees", "main"),
            RecoveryStore::new(&state_dir),
        )
    }

    #[tokio::test]
    async fn clean_startup_reports_nothing() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, locks, worktrees, recovery) = fixtures(&dir);

        let report = cleanup_stale_state(&lifecycle, &locks, &worktrees, &recovery)
            .await
            .unwrap();

        assert_eq!(report.orphans_killed, 0);
        assert!(report.stale_worktrees.is_empty());
        assert!(report.recovery_state.is_none());
        assert_eq!(
            format_cleanup_report(&report),
            "Clean startup, no stale state found."
        );
    }

    #[tokio::test]
    async fn detects_recovery_state_and_worktrees() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, locks, worktrees, recovery) = fixtures(&dir);

        let mut state = OrchestratorState::new("ses-prior");
        state.wave_cycle = 2;
        state.phase = Phase::Development;
        recovery.save(&mut state).await.unwrap();

        tokio::fs::create_dir_all(worktrees.worktree_dir().join("agent-old"))
            .await
            .unwrap();

        let report = cleanup_stale_state(&lifecycle, &locks, &worktrees, &recovery)
            .await
            .unwrap();

        assert_eq!(report.stale_worktrees.len(), 1);
        let recovered = report.recovery_state.as_ref().unwrap();
        assert_eq!(recovered.session_id, "ses-prior");
        assert_eq!(recovered.wave_cycle, 2);

        let summary = format_cleanup_report(&report);
        assert!(summary.contains("stale worktree"));
        assert!(summary.contains("wave 2"));
    }

    #[tokio::test]
    async fn dead_pid_in_registry_is_not_counted_as_orphan() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, locks, worktrees, recovery) = fixtures(&dir);

        // Simulate a prior session registry with a long-dead pid.
        let state_dir = dir.path().join(".flotilla");
        tokio::fs::create_dir_all(&state_dir).await.unwrap();
        tokio::fs::write(
            state_dir.join("agents.json"),
            serde_json::json!([{
                "id": "worker-dead",
                "pid": u32::MAX / 2,
                "pgid": u32::MAX / 2,
                "role": "worker",
                "start_time": chrono::Utc::now(),
                "status": "running"
            }])
            .to_string(),
        )
        .await
        .unwrap();

        let report = cleanup_stale_state(&lifecycle, &locks, &worktrees, &recovery)
            .await
            .unwrap();
        assert_eq!(report.orphans_killed, 0);
    }
}
