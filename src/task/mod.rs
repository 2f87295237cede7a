mod graph;
mod store;
mod types;

pub use graph::{cascade_failure, dependencies_met, topological_sort, validate_dependencies};
pub use store::TaskStore;
pub use types::{HistoryEntry, Task, TaskFile, TaskResult, TaskStatus, TASK_SCHEMA_VERSION};
