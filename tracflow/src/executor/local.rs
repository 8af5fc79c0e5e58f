//! In-process executor bounded by available cores.

use super::{dispatch_with_retry, Executor, ExecutorHandle, TaskResult};
use crate::context::ExecutionContext;
use crate::errors::Result;
use crate::graph::TaskId;
use crate::resources::{available_cores, ResourceProfile};
use crate::stages::TaskRunner;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Runs tasks on a worker pool inside the current process.
///
/// The pool is a semaphore sized to the number of available cores, so at
/// most that many tasks run concurrently across all contexts.
#[derive(Debug)]
pub struct LocalExecutor {
    workers: Semaphore,
    worker_count: usize,
    retry_limit: u32,
}

impl LocalExecutor {
    /// Creates an executor with one worker slot per available core.
    #[must_use]
    pub fn new(retry_limit: u32) -> Self {
        Self::with_workers(available_cores(), retry_limit)
    }

    /// Creates an executor with an explicit worker count.
    #[must_use]
    pub fn with_workers(worker_count: usize, retry_limit: u32) -> Self {
        Self {
            workers: Semaphore::new(worker_count),
            worker_count,
            retry_limit,
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn provision(&self, profile: &ResourceProfile) -> Result<ExecutorHandle> {
        tracing::info!(
            workers = self.worker_count,
            cores_per_worker = profile.cores_per_worker,
            mem_gb = profile.mem_per_worker_gb,
            "provisioned local worker pool"
        );
        Ok(ExecutorHandle {
            label: "local".to_string(),
            allocation: None,
        })
    }

    async fn execute(
        &self,
        ctx: Arc<ExecutionContext>,
        task_id: TaskId,
        unit: Option<usize>,
        runner: Arc<dyn TaskRunner>,
    ) -> TaskResult {
        dispatch_with_retry(
            &self.workers,
            self.retry_limit,
            &ctx,
            task_id,
            unit,
            runner.as_ref(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_subject, CountingRunner};

    #[tokio::test]
    async fn test_execute_runs_task() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = Arc::new(fixture_subject(tmp.path(), "sub-01"));
        let executor = LocalExecutor::with_workers(2, 0);
        let runner = Arc::new(CountingRunner::new("bedpostx"));

        let result = executor
            .execute(ctx, "sub-01:bedpostx".to_string(), None, runner.clone())
            .await;

        assert!(result.outcome.is_ok());
        assert_eq!(result.attempts, 1);
        assert_eq!(runner.runs(), 1);
    }

    #[tokio::test]
    async fn test_provision_reports_local_handle() {
        let executor = LocalExecutor::new(0);
        let handle = executor.provision(&ResourceProfile::per_core()).await.unwrap();
        assert_eq!(handle.label, "local");
        assert!(handle.allocation.is_none());
    }
}
