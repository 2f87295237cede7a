use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::error::{FlotillaError, Result};

use super::{Task, TaskFile, TaskStatus};

/// Authoritative on-disk record of all tasks. The orchestrator owns the
/// in-memory copy; everything else gets snapshots.
pub struct TaskStore {
    path: PathBuf,
    file: Option<TaskFile>,
}

impl TaskStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    pub async fn load(&mut self) -> Result<()> {
        let content = fs::read_to_string(&self.path).await?;
        self.file = Some(serde_yaml_bw::from_str(&content)?);
        Ok(())
    }

    /// Write the task file atomically: temp sibling, then rename.
    pub async fn save(&self) -> Result<()> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| FlotillaError::Config("no task file loaded".to_string()))?;

        let content = serde_yaml_bw::to_string(file)?;

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }

        let tmp_path = self.path.with_extension("yaml.tmp");
        fs::write(&tmp_path, &content).await?;
        if let Err(e) = fs::rename(&tmp_path, &self.path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }

        debug!(path = %self.path.display(), "Task file saved");
        Ok(())
    }

    pub fn file(&self) -> Option<&TaskFile> {
        self.file.as_ref()
    }

    pub fn file_mut(&mut self) -> Option<&mut TaskFile> {
        self.file.as_mut()
    }

    pub fn set_file(&mut self, file: TaskFile) {
        self.file = Some(file);
    }

    pub fn session_id(&self) -> Option<&str> {
        self.file.as_ref().map(|f| f.session_id.as_str())
    }

    /// Snapshot of the current task list (empty when nothing is loaded).
    pub fn tasks(&self) -> Vec<Task> {
        self.file.as_ref().map(|f| f.tasks.clone()).unwrap_or_default()
    }

    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.file.as_ref()?.tasks.iter().find(|t| t.id == id)
    }

    pub fn find_task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.file.as_mut()?.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Reset every claimed task back to pending. Used on crash recovery:
    /// the workers that held those claims are dead.
    pub fn reset_claimed_tasks(&mut self) -> usize {
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        let mut reset = 0;
        for task in &mut file.tasks {
            if task.status == TaskStatus::Claimed {
                task.status = TaskStatus::Pending;
                task.agent_id = None;
                task.worktree = None;
                task.branch = None;
                reset += 1;
            }
        }
        reset
    }

    /// True while any task could still make progress.
    pub fn has_remaining_tasks(&self) -> bool {
        self.file
            .as_ref()
            .map(|f| {
                f.tasks
                    .iter()
                    .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::Done))
            })
            .unwrap_or(false)
    }

    pub fn count_by_status(&self, status: TaskStatus) -> usize {
        self.file
            .as_ref()
            .map(|f| f.tasks.iter().filter(|t| t.status == status).count())
            .unwrap_or(0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::HistoryEntry;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> TaskStore {
        TaskStore::new(dir.path().join("tasks.yaml"))
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let mut task = Task::new("task-001", "First").with_priority(1);
        task.history
            .push(HistoryEntry::new(1, "failed").with_notes("exit code 1"));
        store.set_file(TaskFile::new("ses-test", vec![task]));
        store.save().await.unwrap();

        let mut other = store_in(&dir);
        other.load().await.unwrap();
        assert_eq!(other.session_id(), Some("ses-test"));
        let task = other.find_task("task-001").unwrap();
        assert_eq!(task.history.len(), 1);
    }

    #[tokio::test]
    async fn save_without_file_errors() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        assert!(store.save().await.is_err());
    }

    #[tokio::test]
    async fn no_temp_file_left_behind() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);
        store.set_file(TaskFile::new("ses-test", vec![]));
        store.save().await.unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn reset_claimed_tasks_clears_assignment() {
        let dir = TempDir::new().unwrap();
        let mut store = store_in(&dir);

        let mut claimed = Task::new("task-001", "First");
        claimed.claim("worker-1", "/tmp/wt", "flotilla/task-001").unwrap();
        let pending = Task::new("task-002", "Second");
        store.set_file(TaskFile::new("ses-test", vec![claimed, pending]));

        assert_eq!(store.reset_claimed_tasks(), 1);
        let task = store.find_task("task-001").unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.agent_id.is_none());
    }

    #[test]
    fn remaining_tasks_accounting() {
        let mut store = TaskStore::new("/nonexistent/tasks.yaml");
        assert!(!store.has_remaining_tasks());

        let mut merged = Task::new("task-001", "First");
        merged.claim("w", "/tmp", "b").unwrap();
        merged.complete().unwrap();
        merged.set_validation_result("pass", "ok").unwrap();
        merged.approve().unwrap();
        store.set_file(TaskFile::new("ses-test", vec![merged]));
        assert!(!store.has_remaining_tasks());

        store
            .file_mut()
            .unwrap()
            .tasks
            .push(Task::new("task-002", "Second"));
        assert!(store.has_remaining_tasks());
    }
}
