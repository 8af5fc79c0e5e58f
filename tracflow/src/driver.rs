//! The scheduler driver.
//!
//! Owns the run: derives one resource profile, provisions the executor once,
//! builds a task graph per context, and drives every graph to completion
//! concurrently. A context failure never aborts sibling contexts; the run
//! always produces a report for every context.

use crate::checkpoint::CheckpointStore;
use crate::config::{Phase, RunConfig};
use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::executor::Executor;
use crate::graph::{TaskGraph, TaskGraphBuilder, TaskId, TaskState};
use crate::resources::{PriorOutputEstimator, ResourceEstimator, ResourceProfile, MEMORY_FLOOR_GB};
use crate::stages::StageRegistry;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

/// Terminal status of one context's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    /// Every task of the context succeeded or was pre-satisfied.
    Succeeded,
    /// At least one task failed or the graph could not be built.
    Failed,
}

/// Per-context summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct ContextReport {
    /// The context this report covers.
    pub context_id: String,
    /// Terminal status.
    pub status: ContextStatus,
    /// The stage whose failure started the cascade, if any.
    pub first_failed_stage: Option<String>,
    /// Human-readable failure detail.
    pub error: Option<String>,
    /// Where the context's external command output was logged.
    pub log_path: PathBuf,
    /// Tasks in the context's graph.
    pub tasks_total: usize,
    /// Tasks that succeeded, pre-satisfied ones included.
    pub tasks_succeeded: usize,
    /// Tasks that terminally failed.
    pub tasks_failed: usize,
    /// Tasks never submitted because an ancestor failed.
    pub tasks_skipped: usize,
}

impl ContextReport {
    fn build_failure(ctx: &ExecutionContext, err: &TracflowError) -> Self {
        let first_failed_stage = match err {
            TracflowError::StageDiscovery { stage, .. } => Some(stage.clone()),
            _ => None,
        };
        Self {
            context_id: ctx.id.clone(),
            status: ContextStatus::Failed,
            first_failed_stage,
            error: Some(err.to_string()),
            log_path: ctx.log_path.clone(),
            tasks_total: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            tasks_skipped: 0,
        }
    }
}

/// Summary of one whole run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// The phase that ran.
    pub phase: Phase,
    /// One report per context, in submission order.
    pub contexts: Vec<ContextReport>,
}

impl RunReport {
    /// Returns true iff every context succeeded.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.contexts
            .iter()
            .all(|report| report.status == ContextStatus::Succeeded)
    }
}

/// Drives every context's task graph against one provisioned executor.
#[derive(Debug)]
pub struct SchedulerDriver {
    config: RunConfig,
    registry: Arc<StageRegistry>,
    executor: Arc<dyn Executor>,
}

impl SchedulerDriver {
    /// Creates a driver for one run.
    #[must_use]
    pub fn new(
        config: RunConfig,
        registry: Arc<StageRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self {
            config,
            registry,
            executor,
        }
    }

    /// Runs the configured phase over all contexts.
    ///
    /// # Errors
    ///
    /// Fails only for run-wide problems: resource estimation or executor
    /// provisioning. Per-context failures are carried in the report.
    pub async fn run(&self, contexts: Vec<ExecutionContext>) -> Result<RunReport> {
        let profile = self.resource_profile(&contexts)?;
        let handle = self.executor.provision(&profile).await?;
        tracing::info!(
            phase = %self.config.phase,
            backend = %handle.label,
            contexts = contexts.len(),
            "run started"
        );

        let count = contexts.len();
        let mut running = FuturesUnordered::new();
        for (index, ctx) in contexts.into_iter().enumerate() {
            let ctx = Arc::new(ctx);
            running.push(async move { (index, self.run_context(ctx).await) });
        }

        let mut slots: Vec<Option<ContextReport>> = (0..count).map(|_| None).collect();
        while let Some((index, report)) = running.next().await {
            slots[index] = Some(report);
        }

        let report = RunReport {
            phase: self.config.phase,
            contexts: slots.into_iter().flatten().collect(),
        };
        tracing::info!(
            phase = %self.config.phase,
            succeeded = report.contexts.iter().filter(|r| r.status == ContextStatus::Succeeded).count(),
            failed = report.contexts.iter().filter(|r| r.status == ContextStatus::Failed).count(),
            "run finished"
        );
        Ok(report)
    }

    /// One resource profile per run. Tractography derives its memory ceiling
    /// from the largest prior model-fitting output across contexts; other
    /// phases claim one worker per core.
    fn resource_profile(&self, contexts: &[ExecutionContext]) -> Result<ResourceProfile> {
        match self.config.phase {
            Phase::Probtrackx => {
                let estimator = PriorOutputEstimator::new("bedpostx_b1000.bedpostX");
                let mut mem = MEMORY_FLOOR_GB;
                for ctx in contexts {
                    if let Some(estimate) = estimator.estimate(ctx)?.mem_per_worker_gb {
                        mem = mem.max(estimate);
                    }
                }
                Ok(ResourceProfile {
                    cores_per_worker: 1,
                    mem_per_worker_gb: Some(mem),
                })
            }
            _ => Ok(ResourceProfile::per_core()),
        }
    }

    /// Runs one context to a terminal report. Infallible so that one
    /// context's failure cannot abort its siblings.
    async fn run_context(&self, ctx: Arc<ExecutionContext>) -> ContextReport {
        let builder = TaskGraphBuilder::new(self.registry.clone());
        let mut graph = match builder.build(&ctx, self.config.phase).await {
            Ok(graph) => graph,
            Err(err) => {
                tracing::error!(context = %ctx.id, error = %err, "graph build failed");
                return ContextReport::build_failure(&ctx, &err);
            }
        };

        match self.execute_graph(&ctx, &mut graph).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(context = %ctx.id, error = %err, "context execution failed");
                ContextReport::build_failure(&ctx, &err)
            }
        }
    }

    /// In-degree scheduling over one graph: tasks are submitted the moment
    /// their dependencies succeed; a terminal failure marks every descendant
    /// skipped without submitting it.
    async fn execute_graph(
        &self,
        ctx: &Arc<ExecutionContext>,
        graph: &mut TaskGraph,
    ) -> Result<ContextReport> {
        let store = CheckpointStore::for_context(ctx);
        let ids: Vec<TaskId> = graph.task_ids().to_vec();
        let total = ids.len();

        let mut terminal = 0usize;
        let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
        for id in &ids {
            let task = graph
                .get(id)
                .ok_or_else(|| TracflowError::Internal(format!("unknown task '{id}'")))?;
            if task.state == TaskState::Succeeded {
                terminal += 1;
                continue;
            }
            let unmet = task
                .dependencies
                .iter()
                .filter(|dep| graph.get(dep).map_or(true, |t| !t.state.is_success()))
                .count();
            in_degree.insert(id.clone(), unmet);
        }

        let mut active: FuturesUnordered<BoxFuture<'_, crate::executor::TaskResult>> =
            FuturesUnordered::new();
        for id in &ids {
            if in_degree.get(id) == Some(&0) {
                let fut = self.spawn_task(ctx, graph, id)?;
                active.push(fut);
            }
        }

        let mut first_failed_stage = None;
        let mut error = None;

        while terminal < total {
            if active.is_empty() {
                return Err(TracflowError::Internal(format!(
                    "deadlocked task graph for context '{}'",
                    ctx.id
                )));
            }
            let Some(result) = active.next().await else {
                break;
            };
            let id = result.task_id;
            terminal += 1;

            match result.outcome {
                Ok(()) => {
                    let (stage, completes_stage, checksum) = {
                        let task = graph.get_mut(&id).ok_or_else(|| {
                            TracflowError::Internal(format!("unknown task '{id}'"))
                        })?;
                        task.state = TaskState::Succeeded;
                        task.attempts = result.attempts;
                        (task.stage.clone(), task.completes_stage, task.checksum.clone())
                    };
                    if completes_stage {
                        if let Some(checksum) = checksum {
                            store.write_checkpoint(&stage, &checksum)?;
                        }
                    }

                    let children: Vec<TaskId> = graph.dependents(&id).to_vec();
                    for child in children {
                        let Some(count) = in_degree.get_mut(&child) else {
                            continue;
                        };
                        *count = count.saturating_sub(1);
                        if *count == 0
                            && graph.get(&child).map(|t| t.state) == Some(TaskState::Pending)
                        {
                            let fut = self.spawn_task(ctx, graph, &child)?;
                            active.push(fut);
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(context = %ctx.id, task = %id, error = %err, "task failed");
                    if let Some(task) = graph.get_mut(&id) {
                        task.state = TaskState::Failed;
                        task.attempts = result.attempts;
                        if first_failed_stage.is_none() {
                            first_failed_stage = Some(task.stage.clone());
                            error = Some(err.to_string());
                        }
                    }

                    let mut queue: VecDeque<TaskId> = graph.dependents(&id).to_vec().into();
                    while let Some(descendant) = queue.pop_front() {
                        let newly_skipped = graph.get_mut(&descendant).is_some_and(|task| {
                            if task.state == TaskState::Pending {
                                task.state = TaskState::Skipped;
                                true
                            } else {
                                false
                            }
                        });
                        if newly_skipped {
                            terminal += 1;
                            let skip = TracflowError::SkippedDueToDependencyFailure {
                                task_id: descendant.clone(),
                                failed_dependency: id.clone(),
                            };
                            tracing::warn!(context = %ctx.id, "{skip}");
                            for next in graph.dependents(&descendant) {
                                queue.push_back(next.clone());
                            }
                        }
                    }
                }
            }
        }

        let mut tasks_succeeded = 0;
        let mut tasks_failed = 0;
        let mut tasks_skipped = 0;
        for id in graph.task_ids() {
            match graph.get(id).map(|t| t.state) {
                Some(TaskState::Succeeded) => tasks_succeeded += 1,
                Some(TaskState::Failed) => tasks_failed += 1,
                Some(TaskState::Skipped) => tasks_skipped += 1,
                _ => {}
            }
        }

        let status = if tasks_succeeded == total {
            ContextStatus::Succeeded
        } else {
            ContextStatus::Failed
        };
        Ok(ContextReport {
            context_id: ctx.id.clone(),
            status,
            first_failed_stage,
            error,
            log_path: ctx.log_path.clone(),
            tasks_total: total,
            tasks_succeeded,
            tasks_failed,
            tasks_skipped,
        })
    }

    /// Marks a task running and hands it to the executor.
    fn spawn_task<'a>(
        &'a self,
        ctx: &Arc<ExecutionContext>,
        graph: &mut TaskGraph,
        id: &TaskId,
    ) -> Result<BoxFuture<'a, crate::executor::TaskResult>> {
        let task = graph
            .get_mut(id)
            .ok_or_else(|| TracflowError::Internal(format!("unknown task '{id}'")))?;
        task.state = TaskState::Running;
        let runner = self.registry.get(&task.stage).ok_or_else(|| {
            TracflowError::Internal(format!("no runner registered for stage '{}'", task.stage))
        })?;
        tracing::debug!(context = %ctx.id, task = %task.id, "submitting task");
        Ok(self
            .executor
            .execute(ctx.clone(), task.id.clone(), task.unit, runner))
    }
}
