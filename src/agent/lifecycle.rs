use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::spawner::{AgentHandle, AgentResult};

/// Lifecycle record for one spawned subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEntry {
    pub id: String,
    pub pid: u32,
    pub pgid: u32,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<PathBuf>,
    pub start_time: DateTime<Utc>,
    pub status: AgentProcessStatus,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub persist_path: PathBuf,
    pub heartbeat_interval: Duration,
    pub agent_timeout: Duration,
    pub stall_threshold: Duration,
    pub audit_dir: PathBuf,
}

impl LifecycleConfig {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            persist_path: state_dir.join("agents.json"),
            heartbeat_interval: Duration::from_secs(30),
            agent_timeout: Duration::from_secs(300),
            stall_threshold: Duration::from_secs(60),
            audit_dir: state_dir.join("audit"),
        }
    }
}

type DeathCallback = Box<dyn Fn(&AgentEntry) + Send + Sync>;

/// Registry of live agent subprocesses with liveness, timeout, and stall
/// monitoring. Every mutation persists the registry atomically so a later
/// session can reconcile orphans.
pub struct LifecycleTracker {
    agents: Mutex<HashMap<String, AgentEntry>>,
    config: LifecycleConfig,
    on_agent_death: Mutex<Option<DeathCallback>>,
}

impl LifecycleTracker {
    pub fn new(config: LifecycleConfig) -> Self {
        Self {
            agents: Mutex::new(HashMap::new()),
            config,
            on_agent_death: Mutex::new(None),
        }
    }

    /// Observe monitor-loop death classifications without racing it. Test
    /// instrumentation only; production death handling rides the result
    /// channel and retry path.
    pub fn set_death_callback(&self, callback: impl Fn(&AgentEntry) + Send + Sync + 'static) {
        *self.on_agent_death.lock() = Some(Box::new(callback));
    }

    pub async fn register(&self, handle: &AgentHandle) -> Result<()> {
        let Some(pid) = handle.pid else {
            // Scripted handles have no OS process to track.
            return Ok(());
        };

        let entry = AgentEntry {
            id: handle.agent_id.clone(),
            pid,
            pgid: process_group_of(pid),
            role: handle.role.as_str().to_string(),
            task_id: handle.task_id.clone(),
            worktree: None,
            start_time: handle.started_at,
            status: AgentProcessStatus::Running,
            cost_usd: 0.0,
            tokens_used: 0,
        };

        self.agents.lock().insert(entry.id.clone(), entry);
        self.persist().await;
        Ok(())
    }

    pub async fn unregister(&self, agent_id: &str, result: &AgentResult) {
        {
            let mut agents = self.agents.lock();
            if let Some(mut entry) = agents.remove(agent_id) {
                entry.status = if result.succeeded() {
                    AgentProcessStatus::Completed
                } else {
                    AgentProcessStatus::Failed
                };
                entry.cost_usd = result.cost_usd;
                entry.tokens_used = result.tokens_used;
            }
        }
        self.persist().await;
    }

    pub fn running_agents(&self) -> Vec<AgentEntry> {
        self.agents.lock().values().cloned().collect()
    }

    pub fn running_count(&self) -> usize {
        self.agents.lock().len()
    }

    /// Periodic liveness check loop. Runs until the shutdown channel flips.
    pub async fn monitor_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_agents().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        debug!("Lifecycle monitor shutting down");
                        return;
                    }
                }
            }
        }
    }

    /// One monitor tick: classify every tracked agent as dead, timed out,
    /// or stalled. Signals are sent after the registry lock is released.
    pub async fn check_agents(&self) {
        let mut dead = Vec::new();
        let mut timed_out = Vec::new();
        let mut stalled = Vec::new();

        {
            let agents = self.agents.lock();
            let now = Utc::now();
            for entry in agents.values() {
                if !process_alive(entry.pid) {
                    dead.push(entry.clone());
                    continue;
                }
                let age = (now - entry.start_time).to_std().unwrap_or_default();
                if age > self.config.agent_timeout {
                    timed_out.push(entry.clone());
                    continue;
                }
                if self.is_stalled(entry) {
                    stalled.push(entry.clone());
                }
            }
        }

        for entry in dead {
            self.handle_agent_death(entry).await;
        }

        for entry in timed_out {
            warn!(
                agent_id = %entry.id,
                timeout_secs = self.config.agent_timeout.as_secs(),
                "Agent timed out, killing"
            );
            let _ = self.kill_agent(&entry.id, "timeout").await;
        }

        // Stall is advisory only.
        for entry in stalled {
            warn!(
                agent_id = %entry.id,
                threshold_secs = self.config.stall_threshold.as_secs(),
                "Agent appears stalled (audit log idle)"
            );
        }
    }

    /// An agent is stalled when its audit log exists but has not been
    /// touched within the stall threshold. No audit log means no verdict.
    fn is_stalled(&self, entry: &AgentEntry) -> bool {
        let audit_path = self.config.audit_dir.join(format!("{}.jsonl", entry.id));
        let Ok(metadata) = std::fs::metadata(&audit_path) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        modified
            .elapsed()
            .map(|idle| idle > self.config.stall_threshold)
            .unwrap_or(false)
    }

    async fn handle_agent_death(&self, mut entry: AgentEntry) {
        {
            let mut agents = self.agents.lock();
            agents.remove(&entry.id);
        }
        entry.status = AgentProcessStatus::Failed;
        warn!(agent_id = %entry.id, pid = entry.pid, "Agent died unexpectedly");
        self.persist().await;

        let callback = self.on_agent_death.lock();
        if let Some(callback) = callback.as_ref() {
            callback(&entry);
        }
    }

    /// Soft-signal the agent's process group and pid, give it five seconds
    /// polling at 100 ms, then hard-kill survivors.
    pub async fn kill_agent(&self, agent_id: &str, reason: &str) -> Result<()> {
        let entry = {
            let mut agents = self.agents.lock();
            let Some(mut entry) = agents.remove(agent_id) else {
                return Err(crate::error::FlotillaError::AgentNotFound(
                    agent_id.to_string(),
                ));
            };
            entry.status = AgentProcessStatus::Killed;
            entry
        };

        info!(agent_id, pid = entry.pid, pgid = entry.pgid, reason, "Killing agent");
        terminate_group(entry.pgid, entry.pid);

        let mut exited = false;
        for _ in 0..50 {
            if !process_alive(entry.pid) {
                exited = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if !exited {
            kill_group(entry.pgid, entry.pid);
            warn!(agent_id, pid = entry.pid, "Sent hard kill");
        }

        self.persist().await;
        Ok(())
    }

    /// Terminate every tracked agent: soft-signal wave, poll up to
    /// `timeout`, hard-kill survivors, then clear the registry.
    pub async fn graceful_shutdown(&self, timeout: Duration) {
        let agents = self.running_agents();
        if agents.is_empty() {
            return;
        }

        info!(count = agents.len(), "Graceful shutdown: terminating agents");

        for agent in &agents {
            terminate_group(agent.pgid, agent.pid);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if agents.iter().all(|a| !process_alive(a.pid)) {
                info!("All agents exited gracefully");
                self.clear_all().await;
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        for agent in &agents {
            if process_alive(agent.pid) {
                kill_group(agent.pgid, agent.pid);
                warn!(agent_id = %agent.id, pid = agent.pid, "Sent hard kill");
            }
        }

        self.clear_all().await;
    }

    async fn clear_all(&self) {
        self.agents.lock().clear();
        self.persist().await;
    }

    /// Registry left behind by a previous session, for orphan cleanup.
    pub async fn load_stale_agents(&self) -> Result<Vec<AgentEntry>> {
        let content = match fs::read_to_string(&self.config.persist_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    /// Write the registry atomically. Persistence failures are logged, not
    /// surfaced: tracking must never take down the wave.
    async fn persist(&self) {
        let entries: Vec<AgentEntry> = self.agents.lock().values().cloned().collect();

        let json = match serde_json::to_string_pretty(&entries) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize agent registry");
                return;
            }
        };

        if let Some(dir) = self.config.persist_path.parent() {
            let _ = fs::create_dir_all(dir).await;
        }

        let tmp_path = self.config.persist_path.with_extension("json.tmp");
        if let Err(e) = fs::write(&tmp_path, &json).await {
            warn!(error = %e, "Failed to write agent registry temp file");
            return;
        }
        if let Err(e) = fs::rename(&tmp_path, &self.config.persist_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            warn!(error = %e, "Failed to persist agent registry");
        }
    }
}

/// Signal-0 probe. EPERM still means the process exists.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn process_group_of(pid: u32) -> u32 {
    use nix::unistd::{getpgid, Pid};
    getpgid(Some(Pid::from_raw(pid as i32)))
        .map(|pgid| pgid.as_raw() as u32)
        .unwrap_or(pid)
}

#[cfg(not(unix))]
fn process_group_of(pid: u32) -> u32 {
    pid
}

/// SIGTERM to the process group and the pid itself.
#[cfg(unix)]
pub fn terminate_group(pgid: u32, pid: u32) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGTERM);
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

/// SIGKILL to the process group and the pid itself.
#[cfg(unix)]
pub fn kill_group(pgid: u32, pid: u32) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let _ = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL);
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
pub fn terminate_group(_pgid: u32, _pid: u32) {}

#[cfg(not(unix))]
pub fn kill_group(_pgid: u32, _pid: u32) {}
