//! Task records and the per-context task graph.

use crate::errors::{Result, TracflowError};
use std::collections::HashMap;

/// Unique task identifier, `<context>:<stage>` or `<context>:<stage>[<unit>]`.
pub type TaskId = String;

/// Lifecycle state of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting on unfinished dependencies.
    Pending,
    /// All dependencies satisfied, not yet submitted.
    Ready,
    /// Submitted to the executor.
    Running,
    /// Completed successfully, or pre-satisfied by a checkpoint.
    Succeeded,
    /// Terminally failed after exhausting retries.
    Failed,
    /// Never submitted because an ancestor terminally failed.
    Skipped,
}

impl TaskState {
    /// Returns true for states a task can never leave.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Returns true iff the task counts as satisfied for its dependents.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == Self::Succeeded
    }
}

/// One schedulable unit of work within a context's graph.
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique identifier within the run.
    pub id: TaskId,
    /// The stage this task belongs to.
    pub stage: String,
    /// Fan-out index, `None` for singleton and fan-in tasks.
    pub unit: Option<usize>,
    /// Tasks that must succeed before this one may start.
    pub dependencies: Vec<TaskId>,
    /// Current lifecycle state.
    pub state: TaskState,
    /// Attempts consumed so far.
    pub attempts: u32,
    /// Deterministic key identifying this exact piece of work.
    pub idempotency_key: String,
    /// Whether this task's success completes its stage, triggering a
    /// checkpoint write. True for singleton and fan-in tasks only.
    pub completes_stage: bool,
    /// The stage input checksum, recorded on stage completion.
    pub checksum: Option<String>,
}

/// The dependency graph of tasks for one context and phase.
///
/// Insertion order is dependency order by construction; the graph also
/// carries a reverse edge map so the driver can walk dependents on
/// completion or failure.
#[derive(Debug, Default)]
pub struct TaskGraph {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    dependents: HashMap<TaskId, Vec<TaskId>>,
}

impl TaskGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task, recording reverse edges for its dependencies.
    pub fn insert(&mut self, task: Task) {
        for dep in &task.dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .push(task.id.clone());
        }
        self.order.push(task.id.clone());
        self.tasks.insert(task.id.clone(), task);
    }

    /// Looks up a task by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Task ids in insertion order.
    #[must_use]
    pub fn task_ids(&self) -> &[TaskId] {
        &self.order
    }

    /// Tasks that directly depend on the given task.
    #[must_use]
    pub fn dependents(&self, id: &str) -> &[TaskId] {
        self.dependents.get(id).map_or(&[], Vec::as_slice)
    }

    /// Number of tasks in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Computes a dependency-respecting execution order.
    ///
    /// # Errors
    ///
    /// Returns [`TracflowError::Internal`] if the graph contains a cycle or
    /// an edge to an unknown task.
    pub fn topological_order(&self) -> Result<Vec<TaskId>> {
        let mut in_degree: HashMap<&str, usize> = self
            .tasks
            .values()
            .map(|task| (task.id.as_str(), task.dependencies.len()))
            .collect();

        let mut ready: Vec<&str> = self
            .order
            .iter()
            .filter(|id| in_degree.get(id.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();

        let mut sorted = Vec::with_capacity(self.tasks.len());
        while let Some(id) = ready.pop() {
            sorted.push(id.to_string());
            for child in self.dependents(id) {
                let Some(count) = in_degree.get_mut(child.as_str()) else {
                    return Err(TracflowError::Internal(format!(
                        "edge to unknown task '{child}'"
                    )));
                };
                *count -= 1;
                if *count == 0 {
                    ready.push(child);
                }
            }
        }

        if sorted.len() != self.tasks.len() {
            return Err(TracflowError::Internal(
                "task graph contains a cycle".to_string(),
            ));
        }
        Ok(sorted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task {
            id: id.to_string(),
            stage: id.to_string(),
            unit: None,
            dependencies: deps.iter().map(ToString::to_string).collect(),
            state: TaskState::Pending,
            attempts: 0,
            idempotency_key: id.to_string(),
            completes_stage: true,
            checksum: None,
        }
    }

    #[test]
    fn test_topological_order_respects_dependencies() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[]));
        graph.insert(task("b", &["a"]));
        graph.insert(task("c", &["a", "b"]));

        let order = graph.topological_order().unwrap();
        let pos = |id: &str| order.iter().position(|t| t == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &["b"]));
        graph.insert(task("b", &["a"]));

        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_dependents_reverse_edges() {
        let mut graph = TaskGraph::new();
        graph.insert(task("a", &[]));
        graph.insert(task("b", &["a"]));
        graph.insert(task("c", &["a"]));

        assert_eq!(graph.dependents("a"), ["b".to_string(), "c".to_string()]);
        assert!(graph.dependents("c").is_empty());
    }

    #[test]
    fn test_state_predicates() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Skipped.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Succeeded.is_success());
        assert!(!TaskState::Skipped.is_success());
    }
}
