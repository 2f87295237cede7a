use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{FlotillaError, Result};

use super::{Task, TaskStatus};

/// Validate a planned task list: unique ids, known dependency references,
/// and an acyclic graph.
pub fn validate_dependencies(tasks: &[Task]) -> Result<()> {
    let mut ids = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(FlotillaError::Dependency(format!(
                "duplicate task id: {}",
                task.id
            )));
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(FlotillaError::Dependency(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
        }
    }

    // Kahn's algorithm: a cycle leaves nodes unvisited.
    if kahn_order(tasks).len() != tasks.len() {
        return Err(FlotillaError::Dependency(
            "circular dependency detected".to_string(),
        ));
    }

    Ok(())
}

/// Task ids in dependency order. Errors on cycles.
pub fn topological_sort(tasks: &[Task]) -> Result<Vec<String>> {
    let sorted = kahn_order(tasks);
    if sorted.len() != tasks.len() {
        return Err(FlotillaError::Dependency(
            "circular dependency detected".to_string(),
        ));
    }
    Ok(sorted)
}

fn kahn_order(tasks: &[Task]) -> Vec<String> {
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in tasks {
        in_degree.entry(task.id.as_str()).or_insert(0);
        for dep in &task.dependencies {
            *in_degree.entry(task.id.as_str()).or_insert(0) += 1;
            dependents.entry(dep.as_str()).or_default().push(&task.id);
        }
    }

    // Seed from the task list rather than the map so ties come out in
    // insertion order.
    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()) == Some(&0))
        .map(|t| t.id.as_str())
        .collect();

    let mut sorted = Vec::with_capacity(tasks.len());
    while let Some(id) = queue.pop_front() {
        sorted.push(id.to_string());
        if let Some(deps) = dependents.get(id) {
            for dependent in deps {
                let degree = in_degree.get_mut(dependent).expect("known task id");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(dependent);
                }
            }
        }
    }
    sorted
}

/// True when every dependency of `task` is done or merged.
pub fn dependencies_met(task: &Task, tasks: &[Task]) -> bool {
    if task.dependencies.is_empty() {
        return true;
    }

    let by_id: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    task.dependencies.iter().all(|dep| {
        by_id.get(dep.as_str()).is_some_and(|t| {
            matches!(t.status, TaskStatus::Done | TaskStatus::Merged)
        })
    })
}

/// Mark every pending or failed task that transitively depends on
/// `failed_task_id` as blocked. Breadth-first so the blocking reason can
/// always name the root failure.
pub fn cascade_failure(failed_task_id: &str, tasks: &mut [Task]) {
    let mut queue = VecDeque::from([failed_task_id.to_string()]);

    while let Some(id) = queue.pop_front() {
        for task in tasks.iter_mut() {
            if task.depends_on(&id)
                && matches!(task.status, TaskStatus::Pending | TaskStatus::Failed)
            {
                // Transition cannot fail given the status filter above.
                let _ = task.mark_blocked(format!("dependency {} failed", failed_task_id));
                queue.push_back(task.id.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id).with_dependencies(deps.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn accepts_valid_graph() {
        let tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a", "b"]),
        ];
        assert!(validate_dependencies(&tasks).is_ok());
    }

    #[test]
    fn rejects_duplicate_id() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        let err = validate_dependencies(&tasks).unwrap_err().to_string();
        assert!(err.contains("duplicate task id"));
    }

    #[test]
    fn rejects_unknown_reference() {
        let tasks = vec![task("a", &["ghost"])];
        let err = validate_dependencies(&tasks).unwrap_err().to_string();
        assert!(err.contains("unknown task ghost"));
    }

    #[test]
    fn rejects_cycle() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        let err = validate_dependencies(&tasks).unwrap_err().to_string();
        assert!(err.contains("circular dependency"));
    }

    #[test]
    fn rejects_self_cycle() {
        let tasks = vec![task("a", &["a"])];
        assert!(validate_dependencies(&tasks).is_err());
    }

    #[test]
    fn topological_sort_orders_dependencies_first() {
        let tasks = vec![task("c", &["b"]), task("b", &["a"]), task("a", &[])];
        let order = topological_sort(&tasks).unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn dependencies_met_requires_done_or_merged() {
        let mut tasks = vec![task("a", &[]), task("b", &["a"])];
        assert!(!dependencies_met(&tasks[1].clone(), &tasks));

        tasks[0].claim("w", "/tmp", "br").unwrap();
        tasks[0].complete().unwrap();
        assert!(dependencies_met(&tasks[1].clone(), &tasks));

        tasks[0].set_validation_result("pass", "ok").unwrap();
        tasks[0].approve().unwrap();
        assert!(dependencies_met(&tasks[1].clone(), &tasks));
    }

    #[test]
    fn cascade_blocks_transitive_dependents_only() {
        let mut tasks = vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ];
        tasks[0].claim("w", "/tmp", "br").unwrap();
        tasks[0].fail("exit code 1").unwrap();

        cascade_failure("a", &mut tasks);

        assert_eq!(tasks[1].status, TaskStatus::Blocked);
        assert_eq!(tasks[2].status, TaskStatus::Blocked);
        assert!(tasks[2].result.notes.contains("dependency a failed"));
        assert_eq!(tasks[3].status, TaskStatus::Pending);
    }

    #[test]
    fn cascade_skips_done_dependents() {
        let mut tasks = vec![task("a", &[]), task("b", &["a"])];
        tasks[1].claim("w", "/tmp", "br").unwrap();
        tasks[1].complete().unwrap();

        cascade_failure("a", &mut tasks);
        assert_eq!(tasks[1].status, TaskStatus::Done);
    }
}
