//! Execution contexts: one per subject or subject+session unit of work.

mod builder;
mod execution;

pub use builder::{discover_subjects, ContextBuilder};
pub use execution::ExecutionContext;
