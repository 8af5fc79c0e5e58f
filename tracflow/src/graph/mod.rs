//! Per-context task graphs: fan-out expansion, checkpoint pre-satisfaction,
//! and dependency ordering.

mod builder;
mod task;

pub use builder::TaskGraphBuilder;
pub use task::{Task, TaskGraph, TaskId, TaskState};
