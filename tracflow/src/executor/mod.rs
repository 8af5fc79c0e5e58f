//! Executor backends.
//!
//! An [`Executor`] provisions worker capacity once per run and then executes
//! tasks one at a time as the driver releases them. Retry handling is shared
//! across backends; backends differ only in how capacity is provisioned.

mod batch;
mod local;

pub use batch::BatchExecutor;
pub use local::LocalExecutor;

use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::graph::TaskId;
use crate::resources::ResourceProfile;
use crate::stages::TaskRunner;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Provisioned worker capacity for one run.
#[derive(Debug, Clone)]
pub struct ExecutorHandle {
    /// Human-readable backend label.
    pub label: String,
    /// Batch allocation identifier, if the backend submitted one.
    pub allocation: Option<String>,
}

/// Outcome of executing one task, including retries.
#[derive(Debug)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: TaskId,
    /// Attempts consumed, including the first.
    pub attempts: u32,
    /// Final outcome after the last attempt.
    pub outcome: Result<()>,
}

/// Runs tasks against provisioned worker capacity.
#[async_trait]
pub trait Executor: Send + Sync + std::fmt::Debug {
    /// Provisions capacity for the run. Called once, before any task.
    async fn provision(&self, profile: &ResourceProfile) -> Result<ExecutorHandle>;

    /// Executes one task to a terminal outcome, applying the retry policy.
    /// Never panics the caller; all failure is carried in the result.
    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        task_id: TaskId,
        unit: Option<usize>,
        runner: Arc<dyn TaskRunner>,
    ) -> TaskResult;
}

/// Shared dispatch loop: acquire a worker slot, run the task, retry failed
/// attempts up to the limit. Identical across backends.
pub(crate) async fn dispatch_with_retry(
    workers: &Semaphore,
    retry_limit: u32,
    ctx: &ExecutionContext,
    task_id: TaskId,
    unit: Option<usize>,
    runner: &dyn TaskRunner,
) -> TaskResult {
    let permit = match workers.acquire().await {
        Ok(permit) => permit,
        Err(_closed) => {
            return TaskResult {
                attempts: 0,
                outcome: Err(TracflowError::Internal(
                    "worker pool closed during dispatch".to_string(),
                )),
                task_id,
            };
        }
    };

    let mut attempts = 0;
    let outcome = loop {
        attempts += 1;
        match runner.run(ctx, unit).await {
            Ok(()) => break Ok(()),
            Err(err) if attempts <= retry_limit => {
                tracing::warn!(
                    task = %task_id,
                    attempt = attempts,
                    error = %err,
                    "task attempt failed, resubmitting"
                );
            }
            Err(err) => {
                // Re-wrap with the true attempt count; the per-attempt error
                // only knows about its own attempt.
                let reason = match err {
                    TracflowError::TaskExecution { reason, .. } => reason,
                    other => other.to_string(),
                };
                break Err(TracflowError::task_execution(
                    task_id.clone(),
                    attempts,
                    reason,
                ));
            }
        }
    };
    drop(permit);

    TaskResult {
        task_id,
        attempts,
        outcome,
    }
}
