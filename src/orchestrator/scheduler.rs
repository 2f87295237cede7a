use std::collections::HashSet;

use crate::task::{dependencies_met, Task, TaskStatus};

/// Selects the next batch of tasks that can safely run in parallel.
///
/// Lock-conflict avoidance here is an optimistic hint; the lock manager's
/// OS locks stay authoritative under races.
pub struct Scheduler {
    max_concurrency: usize,
}

impl Scheduler {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Up to `max_concurrency` tasks that are pending, have all
    /// dependencies done or merged, and have pairwise-disjoint file locks.
    /// Priority ascending, ties in task-list order.
    pub fn ready_tasks(&self, all_tasks: &[Task]) -> Vec<Task> {
        let mut candidates: Vec<&Task> = all_tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| dependencies_met(t, all_tasks))
            .collect();

        // Stable sort keeps insertion order as the deterministic tie-break.
        candidates.sort_by_key(|t| t.priority);

        let mut selected = Vec::new();
        let mut used_locks: HashSet<&str> = HashSet::new();

        for task in candidates {
            if selected.len() >= self.max_concurrency {
                break;
            }
            if task
                .file_locks
                .iter()
                .any(|lock| used_locks.contains(lock.as_str()))
            {
                continue;
            }
            for lock in &task.file_locks {
                used_locks.insert(lock);
            }
            selected.push(task.clone());
        }

        selected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, priority: i32, locks: &[&str], deps: &[&str]) -> Task {
        Task::new(id, id)
            .with_priority(priority)
            .with_file_locks(locks.iter().map(|s| s.to_string()).collect())
            .with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn respects_concurrency_budget() {
        let tasks = vec![
            task("a", 1, &[], &[]),
            task("b", 1, &[], &[]),
            task("c", 1, &[], &[]),
        ];
        let selected = Scheduler::new(2).ready_tasks(&tasks);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn sorts_by_priority_with_stable_ties() {
        let tasks = vec![
            task("low", 5, &[], &[]),
            task("high", 1, &[], &[]),
            task("also-high", 1, &[], &[]),
        ];
        let selected = Scheduler::new(3).ready_tasks(&tasks);
        let ids: Vec<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "also-high", "low"]);
    }

    #[test]
    fn skips_lock_conflicts_but_fills_remaining_slots() {
        let tasks = vec![
            task("a", 1, &["pkg/auth/"], &[]),
            task("b", 2, &["pkg/auth/"], &[]),
            task("c", 3, &["pkg/db/"], &[]),
        ];
        let selected = Scheduler::new(3).ready_tasks(&tasks);
        let ids: Vec<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn selected_tasks_have_disjoint_locks() {
        let tasks = vec![
            task("a", 1, &["x", "y"], &[]),
            task("b", 2, &["y", "z"], &[]),
            task("c", 3, &["z"], &[]),
        ];
        let selected = Scheduler::new(3).ready_tasks(&tasks);
        let mut seen = HashSet::new();
        for t in &selected {
            for lock in &t.file_locks {
                assert!(seen.insert(lock.clone()), "lock {} selected twice", lock);
            }
        }
    }

    #[test]
    fn excludes_unmet_dependencies() {
        let mut done = task("done", 1, &[], &[]);
        done.claim("w", "/tmp", "b").unwrap();
        done.complete().unwrap();

        let tasks = vec![
            done,
            task("ready", 1, &[], &["done"]),
            task("waiting", 1, &[], &["ready"]),
        ];
        let selected = Scheduler::new(8).ready_tasks(&tasks);
        let ids: Vec<&str> = selected.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["ready"]);
    }

    #[test]
    fn excludes_non_pending_statuses() {
        let mut claimed = task("claimed", 1, &[], &[]);
        claimed.claim("w", "/tmp", "b").unwrap();
        let mut blocked = task("blocked", 1, &[], &[]);
        blocked.mark_blocked("nope").unwrap();

        let tasks = vec![claimed, blocked, task("pending", 2, &[], &[])];
        let selected = Scheduler::new(8).ready_tasks(&tasks);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "pending");
    }

    #[test]
    fn two_tasks_sharing_a_lock_yield_one_selection() {
        let tasks = vec![
            task("first", 1, &["src/shared.rs"], &[]),
            task("second", 1, &["src/shared.rs"], &[]),
        ];
        let selected = Scheduler::new(2).ready_tasks(&tasks);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].id, "first");
    }
}
