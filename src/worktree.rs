use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};

use crate::error::{FlotillaError, Result};
use crate::git::GitRunner;

/// Branch name for a task: `flotilla/<task-id>`.
pub fn branch_name(task_id: &str) -> String {
    format!("flotilla/{}", task_id)
}

/// Creates and removes isolated checkouts tied to per-task branches.
pub struct WorktreeManager {
    repo_dir: PathBuf,
    worktree_dir: PathBuf,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(
        repo_dir: impl Into<PathBuf>,
        worktree_dir: impl Into<PathBuf>,
        base_branch: impl Into<String>,
    ) -> Self {
        let repo_dir = repo_dir.into();
        let mut worktree_dir = worktree_dir.into();
        if worktree_dir.is_relative() {
            worktree_dir = repo_dir.join(worktree_dir);
        }
        // Resolve symlinks in the parent so later path comparisons match
        // git's resolved paths (macOS /var -> /private/var).
        if let Some(parent) = worktree_dir.parent() {
            if let (Ok(resolved), Some(name)) = (parent.canonicalize(), worktree_dir.file_name()) {
                worktree_dir = resolved.join(name);
            }
        }
        Self {
            repo_dir,
            worktree_dir,
            base_branch: base_branch.into(),
        }
    }

    fn git(&self) -> GitRunner {
        GitRunner::new(&self.repo_dir)
    }

    pub fn worktree_path(&self, agent_id: &str) -> PathBuf {
        self.worktree_dir.join(agent_id)
    }

    /// Create a worktree for an agent with a fresh task branch off base.
    /// Returns the worktree path and branch name.
    pub async fn create(&self, agent_id: &str, task_id: &str) -> Result<(PathBuf, String)> {
        let wt_path = self.worktree_path(agent_id);
        let branch = branch_name(task_id);

        if let Some(parent) = wt_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.ensure_base_branch().await?;

        // Best-effort delete of a branch carried over from an aborted run.
        let _ = self.git().run(&["branch", "-D", &branch]).await;

        let wt_str = wt_path.to_string_lossy().to_string();
        self.git()
            .run_checked(&["worktree", "add", "-b", &branch, &wt_str, &self.base_branch])
            .await
            .map_err(|e| FlotillaError::Worktree(format!("worktree add for {}: {}", task_id, e)))?;

        info!(agent_id, task_id, path = %wt_path.display(), "Worktree created");
        Ok((wt_path, branch))
    }

    /// Make sure the base branch exists. An empty repository gets an
    /// initial empty commit, and the default branch is renamed to base.
    async fn ensure_base_branch(&self) -> Result<()> {
        let git = self.git();
        if git.ref_exists(&self.base_branch).await {
            return Ok(());
        }

        git.run_checked(&["commit", "--allow-empty", "-m", "Initial commit (flotilla)"])
            .await
            .map_err(|e| FlotillaError::Worktree(format!("create initial commit: {}", e)))?;

        // Branch naming is best-effort once the commit exists.
        let Ok(output) = git.run(&["symbolic-ref", "--short", "HEAD"]).await else {
            return Ok(());
        };
        if !output.status.success() {
            return Ok(());
        }
        let current = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if current != self.base_branch {
            git.run_checked(&["branch", "-m", &current, &self.base_branch])
                .await
                .map_err(|e| {
                    FlotillaError::Worktree(format!(
                        "rename branch to {}: {}",
                        self.base_branch, e
                    ))
                })?;
        }
        Ok(())
    }

    pub async fn remove(&self, agent_id: &str) -> Result<()> {
        let wt_path = self.worktree_path(agent_id);
        let wt_str = wt_path.to_string_lossy().to_string();
        self.git()
            .run_checked(&["worktree", "remove", "--force", &wt_str])
            .await
            .map_err(|e| FlotillaError::Worktree(format!("worktree remove: {}", e)))?;
        debug!(agent_id, "Worktree removed");
        Ok(())
    }

    pub async fn remove_branch(&self, task_id: &str) -> Result<()> {
        let branch = branch_name(task_id);
        self.git().run_checked(&["branch", "-D", &branch]).await?;
        Ok(())
    }

    /// Fold a task branch into base. A conflicted merge is aborted so the
    /// base branch is never left half-merged.
    pub async fn merge_branch(&self, task_id: &str) -> Result<()> {
        let branch = branch_name(task_id);
        let git = self.git();

        git.run_checked(&["checkout", &self.base_branch]).await?;

        let output = git.run(&["merge", &branch]).await?;
        if !output.status.success() {
            let _ = git.run(&["merge", "--abort"]).await;
            return Err(FlotillaError::MergeConflict { branch });
        }

        info!(branch = %branch, base = %self.base_branch, "Branch merged");
        Ok(())
    }

    /// Diff between the base branch and a task branch.
    pub async fn diff(&self, task_id: &str) -> Result<String> {
        let branch = branch_name(task_id);
        let range = format!("{}...{}", self.base_branch, branch);
        self.git().stdout(&["diff", &range]).await
    }

    /// Worktrees under our managed directory, per git's own records.
    pub async fn list(&self) -> Result<Vec<PathBuf>> {
        let output = self.git().stdout(&["worktree", "list", "--porcelain"]).await?;

        let resolved = self
            .worktree_dir
            .canonicalize()
            .unwrap_or_else(|_| self.worktree_dir.clone());

        let mut paths = Vec::new();
        for line in output.lines() {
            if let Some(path) = line.strip_prefix("worktree ") {
                let path = PathBuf::from(path);
                if path.starts_with(&resolved) || path.starts_with(&self.worktree_dir) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// Directories on disk under the worktree root. Callers intersect this
    /// with live lifecycle records to decide what is actually stale.
    pub async fn find_stale(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match fs::read_dir(&self.worktree_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut stale = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stale.push(entry.path());
            }
        }
        Ok(stale)
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    pub fn worktree_dir(&self) -> &Path {
        &self.worktree_dir
    }
}

/// Minimum free disk space required before creating worktrees.
pub const MIN_DISK_SPACE_MB: u64 = 500;

/// Refuse to run when the filesystem holding `path` is nearly full.
#[cfg(unix)]
pub fn check_disk_space(path: &Path, min_mb: u64) -> Result<()> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|e| FlotillaError::Worktree(format!("statvfs {}: {}", path.display(), e)))?;

    let available_mb =
        (stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64) / (1024 * 1024);

    if available_mb < min_mb {
        warn!(path = %path.display(), available_mb, "Low disk space");
        return Err(FlotillaError::DiskSpace {
            path: path.to_path_buf(),
            available_mb,
            required_mb: min_mb,
        });
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn check_disk_space(_path: &Path, _min_mb: u64) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::process::Command;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@example.com"],
            vec!["config", "user.name", "Test"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .await
                .unwrap();
            assert!(status.success(), "git {:?}", args);
        }
    }

    async fn commit_file(dir: &Path, name: &str, content: &str) {
        tokio::fs::write(dir.join(name), content).await.unwrap();
        for args in [vec!["add", "."], vec!["commit", "-m", "add file"]] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .await
                .unwrap();
            assert!(status.success());
        }
    }

    #[test]
    fn branch_name_carries_prefix() {
        assert_eq!(branch_name("task-001"), "flotilla/task-001");
    }

    #[tokio::test]
    async fn create_makes_worktree_and_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "README.md", "hello").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (wt_path, branch) = manager.create("agent-1", "task-001").await.unwrap();

        assert!(wt_path.exists());
        assert_eq!(branch, "flotilla/task-001");
        assert!(wt_path.join("README.md").exists());
    }

    #[tokio::test]
    async fn create_bootstraps_empty_repo() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (wt_path, _) = manager.create("agent-1", "task-001").await.unwrap();
        assert!(wt_path.exists());
    }

    #[tokio::test]
    async fn create_replaces_leftover_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "README.md", "hello").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (_, branch) = manager.create("agent-1", "task-001").await.unwrap();
        manager.remove("agent-1").await.unwrap();

        // Branch still exists; a second create for the same task must win.
        let (wt_path, branch2) = manager.create("agent-2", "task-001").await.unwrap();
        assert_eq!(branch, branch2);
        assert!(wt_path.exists());
    }

    #[tokio::test]
    async fn merge_branch_folds_commits_into_base() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "README.md", "hello").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (wt_path, _) = manager.create("agent-1", "task-001").await.unwrap();
        commit_file(&wt_path, "feature.txt", "new").await;

        manager.remove("agent-1").await.unwrap();
        manager.merge_branch("task-001").await.unwrap();
        manager.remove_branch("task-001").await.unwrap();

        assert!(dir.path().join("feature.txt").exists());
    }

    #[tokio::test]
    async fn merge_conflict_is_aborted_and_reported() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "shared.txt", "base").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (wt_path, _) = manager.create("agent-1", "task-001").await.unwrap();

        // Diverge: same file edited on the task branch and on base.
        commit_file(&wt_path, "shared.txt", "from-branch").await;
        commit_file(dir.path(), "shared.txt", "from-base").await;
        manager.remove("agent-1").await.unwrap();

        let err = manager.merge_branch("task-001").await.unwrap_err();
        assert!(matches!(err, FlotillaError::MergeConflict { .. }));

        // Base must be clean after the abort.
        let status = GitRunner::new(dir.path())
            .stdout(&["status", "--porcelain"])
            .await
            .unwrap();
        assert!(status.trim().is_empty(), "dirty tree after abort: {}", status);
    }

    #[tokio::test]
    async fn diff_reports_branch_changes() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "README.md", "hello").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        let (wt_path, _) = manager.create("agent-1", "task-001").await.unwrap();
        commit_file(&wt_path, "feature.txt", "new content").await;

        let diff = manager.diff("task-001").await.unwrap();
        assert!(diff.contains("feature.txt"));
        assert!(diff.contains("new content"));
    }

    #[tokio::test]
    async fn find_stale_lists_directories() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        assert!(manager.find_stale().await.unwrap().is_empty());

        tokio::fs::create_dir_all(manager.worktree_dir().join("agent-old"))
            .await
            .unwrap();
        let stale = manager.find_stale().await.unwrap();
        assert_eq!(stale.len(), 1);
    }

    #[tokio::test]
    async fn list_only_reports_managed_worktrees() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path()).await;
        commit_file(dir.path(), "README.md", "hello").await;

        let manager = WorktreeManager::new(dir.path(), ".trees", "main");
        manager.create("agent-1", "task-001").await.unwrap();

        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].ends_with("agent-1"));
    }

    #[test]
    fn disk_space_check_passes_on_tmp() {
        let dir = TempDir::new().unwrap();
        assert!(check_disk_space(dir.path(), 1).is_ok());
    }
}
