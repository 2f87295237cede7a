use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{FlotillaError, Result};

/// Cross-process advisory locks over logical resource paths.
///
/// Each logical path maps to a lockfile under `lock_dir`; exclusion comes
/// from a non-blocking exclusive OS lock on that file. The mutex guards
/// the in-process handle map only.
pub struct LockManager {
    lock_dir: PathBuf,
    inner: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    /// logical path -> open file handle holding the OS lock
    held: HashMap<String, File>,
    /// agent id -> logical paths it holds
    agent_paths: HashMap<String, Vec<String>>,
}

impl LockManager {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            inner: Mutex::new(LockState::default()),
        }
    }

    /// Lockfile for a logical path: separators become double underscores.
    fn lock_file_path(&self, path: &str) -> PathBuf {
        let mangled = path.replace(std::path::MAIN_SEPARATOR, "__");
        self.lock_dir.join(format!("{}.lock", mangled))
    }

    /// Acquire exclusive locks on every path for an agent. Non-blocking:
    /// a conflict fails immediately. All-or-nothing: on any failure every
    /// lock taken in this call is released and its file removed.
    pub fn acquire(&self, agent_id: &str, paths: &[String]) -> Result<()> {
        let mut state = self.inner.lock();

        fs::create_dir_all(&self.lock_dir)?;

        let mut acquired: Vec<String> = Vec::with_capacity(paths.len());
        for path in paths {
            if let Err(e) = self.try_lock_one(&mut state, agent_id, path) {
                self.rollback(&mut state, &acquired);
                return Err(e);
            }
            acquired.push(path.clone());
        }

        state
            .agent_paths
            .entry(agent_id.to_string())
            .or_default()
            .extend(paths.iter().cloned());

        debug!(agent_id, count = paths.len(), "Locks acquired");
        Ok(())
    }

    fn try_lock_one(&self, state: &mut LockState, agent_id: &str, path: &str) -> Result<()> {
        if state.held.contains_key(path) {
            return Err(FlotillaError::LockConflict {
                path: path.to_string(),
            });
        }

        let lock_path = self.lock_file_path(path);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(FlotillaError::LockConflict {
                path: path.to_string(),
            });
        }

        file.set_len(0)?;
        writeln!(
            file,
            "{} {} {}",
            agent_id,
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;

        state.held.insert(path.to_string(), file);
        Ok(())
    }

    fn rollback(&self, state: &mut LockState, acquired: &[String]) {
        for path in acquired {
            if let Some(file) = state.held.remove(path) {
                let _ = FileExt::unlock(&file);
                drop(file);
                let _ = fs::remove_file(self.lock_file_path(path));
            }
        }
    }

    /// Release every lock held by an agent. Unknown agents are a no-op.
    pub fn release(&self, agent_id: &str) {
        let mut state = self.inner.lock();
        let Some(paths) = state.agent_paths.remove(agent_id) else {
            return;
        };
        for path in &paths {
            if let Some(file) = state.held.remove(path) {
                let _ = FileExt::unlock(&file);
                drop(file);
                let _ = fs::remove_file(self.lock_file_path(path));
            }
        }
        debug!(agent_id, count = paths.len(), "Locks released");
    }

    pub fn release_all(&self) {
        let mut state = self.inner.lock();
        let paths: Vec<String> = state.held.keys().cloned().collect();
        for path in &paths {
            if let Some(file) = state.held.remove(path) {
                let _ = FileExt::unlock(&file);
                drop(file);
                let _ = fs::remove_file(self.lock_file_path(path));
            }
        }
        state.agent_paths.clear();
    }

    pub fn is_held(&self, path: &str) -> bool {
        self.inner.lock().held.contains_key(path)
    }

    pub fn held_paths(&self) -> Vec<String> {
        self.inner.lock().held.keys().cloned().collect()
    }

    /// Would any of these paths collide with locks this process holds?
    pub fn has_conflict(&self, paths: &[String]) -> bool {
        let state = self.inner.lock();
        paths.iter().any(|p| state.held.contains_key(p))
    }

    /// Remove lockfiles whose holder is gone. A lock that can be
    /// re-acquired from here was not held by any live process.
    pub fn clean_stale(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.lock_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut cleaned = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "lock") {
                continue;
            }
            let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
                continue;
            };
            if file.try_lock_exclusive().is_ok() {
                let _ = FileExt::unlock(&file);
                drop(file);
                if fs::remove_file(&path).is_ok() {
                    warn!(path = %path.display(), "Removed stale lockfile");
                    cleaned += 1;
                }
            }
        }
        Ok(cleaned)
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LockManager {
        LockManager::new(dir.path().join("locks"))
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        locks.acquire("agent-1", &paths(&["pkg/auth/", "pkg/db/"])).unwrap();
        assert!(locks.is_held("pkg/auth/"));
        assert!(locks.is_held("pkg/db/"));
        assert_eq!(locks.held_paths().len(), 2);

        locks.release("agent-1");
        assert!(!locks.is_held("pkg/auth/"));
        assert!(locks.held_paths().is_empty());
    }

    #[test]
    fn conflict_fails_without_blocking() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        locks.acquire("agent-1", &paths(&["pkg/auth/"])).unwrap();
        let err = locks.acquire("agent-2", &paths(&["pkg/auth/"])).unwrap_err();
        assert!(err.is_lock_conflict());
    }

    #[test]
    fn multi_acquire_is_all_or_nothing() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        locks.acquire("agent-1", &paths(&["pkg/shared/"])).unwrap();

        // Second agent wants a free path plus the contended one.
        let err = locks
            .acquire("agent-2", &paths(&["pkg/free/", "pkg/shared/"]))
            .unwrap_err();
        assert!(err.is_lock_conflict());
        // The free path must have been rolled back.
        assert!(!locks.is_held("pkg/free/"));

        // And is immediately acquirable again.
        locks.acquire("agent-3", &paths(&["pkg/free/"])).unwrap();
    }

    #[test]
    fn lockfile_contains_holder_metadata() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("agent-1", &paths(&["pkg/auth/"])).unwrap();

        let lock_path = locks.lock_file_path("pkg/auth/");
        let content = std::fs::read_to_string(lock_path).unwrap();
        let fields: Vec<&str> = content.split_whitespace().collect();
        assert_eq!(fields[0], "agent-1");
        assert_eq!(fields[1], std::process::id().to_string());
        assert!(fields[2].contains('T'));
    }

    #[test]
    fn path_mangling_flattens_separators() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        let lock_path = locks.lock_file_path("pkg/auth/tokens.rs");
        let name = lock_path.file_name().unwrap().to_string_lossy();
        assert_eq!(name, "pkg__auth__tokens.rs.lock");
    }

    #[test]
    fn release_all_clears_everything() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("agent-1", &paths(&["a"])).unwrap();
        locks.acquire("agent-2", &paths(&["b"])).unwrap();

        locks.release_all();
        assert!(locks.held_paths().is_empty());
        locks.acquire("agent-3", &paths(&["a", "b"])).unwrap();
    }

    #[test]
    fn clean_stale_removes_unheld_lockfiles() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);

        // A lockfile nobody holds, as left behind by a crashed process.
        std::fs::create_dir_all(locks.lock_dir()).unwrap();
        std::fs::write(locks.lock_dir().join("pkg__old.lock"), "dead 99999 t").unwrap();

        // An actively held lock must survive cleanup.
        locks.acquire("agent-1", &paths(&["pkg/live/"])).unwrap();

        let cleaned = locks.clean_stale().unwrap();
        assert_eq!(cleaned, 1);
        assert!(!locks.lock_dir().join("pkg__old.lock").exists());
        assert!(locks.lock_dir().join("pkg__live__.lock").exists());
    }

    #[test]
    fn clean_stale_on_missing_dir_is_ok() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path().join("never-created"));
        assert_eq!(locks.clean_stale().unwrap(), 0);
    }

    #[test]
    fn has_conflict_reflects_held_paths() {
        let dir = TempDir::new().unwrap();
        let locks = manager(&dir);
        locks.acquire("agent-1", &paths(&["pkg/auth/"])).unwrap();

        assert!(locks.has_conflict(&paths(&["pkg/auth/", "pkg/other/"])));
        assert!(!locks.has_conflict(&paths(&["pkg/other/"])));
    }
}
