//! Builds the per-context task graph for a phase.

use super::task::{Task, TaskGraph, TaskId, TaskState};
use crate::checkpoint::{stage_checksum, CheckpointStore};
use crate::config::Phase;
use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::stages::{phase_stages, StageRegistry, StageSpec};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// Deterministic key for one exact piece of work.
fn idempotency_key(stage: &str, checksum: &str, unit: Option<usize>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());
    hasher.update(checksum.as_bytes());
    if let Some(unit) = unit {
        hasher.update(unit.to_le_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Expands a phase's stage definitions into a concrete task graph for one
/// context.
///
/// Stage checksums are chained through upstream stages, so an input change
/// invalidates every downstream checkpoint. A stage whose checkpoint matches
/// the fresh checksum is pre-satisfied: it contributes a single already
/// succeeded task and, for fan-out stages, skips discovery entirely.
#[derive(Debug)]
pub struct TaskGraphBuilder {
    registry: Arc<StageRegistry>,
}

impl TaskGraphBuilder {
    /// Creates a builder resolving runners through the given registry.
    #[must_use]
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }

    /// Builds the graph for one context.
    ///
    /// # Errors
    ///
    /// Fails with [`TracflowError::StageDiscovery`] if a fan-out cardinality
    /// cannot be determined. No task has been submitted at that point.
    pub async fn build(&self, ctx: &ExecutionContext, phase: Phase) -> Result<TaskGraph> {
        self.build_from_stages(ctx, phase_stages(phase)).await
    }

    async fn build_from_stages(
        &self,
        ctx: &ExecutionContext,
        stages: Vec<StageSpec>,
    ) -> Result<TaskGraph> {
        let store = CheckpointStore::for_context(ctx);
        let mut graph = TaskGraph::new();
        let mut checksums: HashMap<&str, String> = HashMap::new();
        let mut terminal_tasks: HashMap<&str, TaskId> = HashMap::new();

        for spec in stages {
            let upstream: Vec<String> = spec
                .dependencies
                .iter()
                .map(|dep| {
                    checksums.get(dep).cloned().ok_or_else(|| {
                        TracflowError::Internal(format!(
                            "stage '{}' depends on undeclared stage '{dep}'",
                            spec.name
                        ))
                    })
                })
                .collect::<Result<_>>()?;
            let checksum = stage_checksum(spec.name, &spec.resolve_sources(ctx), &upstream)?;

            let deps: Vec<TaskId> = spec
                .dependencies
                .iter()
                .map(|dep| {
                    terminal_tasks.get(dep).cloned().ok_or_else(|| {
                        TracflowError::Internal(format!(
                            "stage '{}' depends on undeclared stage '{dep}'",
                            spec.name
                        ))
                    })
                })
                .collect::<Result<_>>()?;

            let stage_task_id = format!("{}:{}", ctx.id, spec.name);

            if store.has_checkpoint(spec.name, &checksum)? {
                tracing::info!(
                    context = %ctx.id,
                    stage = spec.name,
                    "checkpoint satisfied, skipping stage"
                );
                graph.insert(Task {
                    id: stage_task_id.clone(),
                    stage: spec.name.to_string(),
                    unit: None,
                    dependencies: deps,
                    state: TaskState::Succeeded,
                    attempts: 0,
                    idempotency_key: idempotency_key(spec.name, &checksum, None),
                    completes_stage: false,
                    checksum: Some(checksum.clone()),
                });
            } else if spec.fan_out {
                self.insert_fan_out(&mut graph, ctx, &spec, &checksum, &deps, &stage_task_id)
                    .await?;
            } else {
                graph.insert(Task {
                    id: stage_task_id.clone(),
                    stage: spec.name.to_string(),
                    unit: None,
                    dependencies: deps,
                    state: TaskState::Pending,
                    attempts: 0,
                    idempotency_key: idempotency_key(spec.name, &checksum, None),
                    completes_stage: true,
                    checksum: Some(checksum.clone()),
                });
            }

            checksums.insert(spec.name, checksum);
            terminal_tasks.insert(spec.name, stage_task_id);
        }

        Ok(graph)
    }

    /// Expands a fan-out stage into per-unit tasks plus a fan-in task that
    /// completes the stage.
    async fn insert_fan_out(
        &self,
        graph: &mut TaskGraph,
        ctx: &ExecutionContext,
        spec: &StageSpec,
        checksum: &str,
        deps: &[TaskId],
        fan_in_id: &str,
    ) -> Result<()> {
        let runner = self.registry.get(spec.name).ok_or_else(|| {
            TracflowError::Internal(format!("no runner registered for stage '{}'", spec.name))
        })?;

        let units = runner.discover(ctx).await?.ok_or_else(|| {
            TracflowError::discovery(spec.name, &ctx.id, "runner reported no cardinality")
        })?;
        tracing::debug!(context = %ctx.id, stage = spec.name, units, "fan-out discovered");

        let mut unit_ids = Vec::with_capacity(units);
        for unit in 0..units {
            let id = format!("{}:{}[{unit}]", ctx.id, spec.name);
            graph.insert(Task {
                id: id.clone(),
                stage: spec.name.to_string(),
                unit: Some(unit),
                dependencies: deps.to_vec(),
                state: TaskState::Pending,
                attempts: 0,
                idempotency_key: idempotency_key(spec.name, checksum, Some(unit)),
                completes_stage: false,
                checksum: None,
            });
            unit_ids.push(id);
        }

        graph.insert(Task {
            id: fan_in_id.to_string(),
            stage: spec.name.to_string(),
            unit: None,
            dependencies: unit_ids,
            state: TaskState::Pending,
            attempts: 0,
            idempotency_key: idempotency_key(spec.name, checksum, None),
            completes_stage: true,
            checksum: Some(checksum.to_string()),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::testing::{fixture_subject, freesurfer_invoker, ScriptedInvoker};
    use pretty_assertions::assert_eq;

    fn freesurfer_builder(invoker: Arc<ScriptedInvoker>) -> TaskGraphBuilder {
        let config = RunConfig::new(Phase::Freesurfer, "/out");
        TaskGraphBuilder::new(Arc::new(StageRegistry::for_phase(&config, invoker)))
    }

    #[tokio::test]
    async fn test_fan_out_expansion() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let builder = freesurfer_builder(Arc::new(freesurfer_invoker()));

        let graph = builder.build(&ctx, Phase::Freesurfer).await.unwrap();

        // split, two register units, register fan-in, fit.
        assert_eq!(graph.len(), 5);
        let fan_in = graph.get("sub-01:register").unwrap();
        assert_eq!(
            fan_in.dependencies,
            vec!["sub-01:register[0]".to_string(), "sub-01:register[1]".to_string()]
        );
        assert!(fan_in.completes_stage);

        let unit = graph.get("sub-01:register[0]").unwrap();
        assert_eq!(unit.dependencies, vec!["sub-01:split".to_string()]);
        assert!(!unit.completes_stage);

        let fit = graph.get("sub-01:fit").unwrap();
        assert_eq!(fit.dependencies, vec!["sub-01:register".to_string()]);

        graph.topological_order().unwrap();
    }

    #[tokio::test]
    async fn test_pre_satisfied_stage_skips_discovery() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let store = CheckpointStore::for_context(&ctx);

        // Record checkpoints for split and register with fresh checksums.
        let stages = phase_stages(Phase::Freesurfer);
        let split_sum =
            stage_checksum("split", &stages[0].resolve_sources(&ctx), &[]).unwrap();
        let register_sum = stage_checksum(
            "register",
            &stages[1].resolve_sources(&ctx),
            &[split_sum.clone()],
        )
        .unwrap();
        store.write_checkpoint("split", &split_sum).unwrap();
        store.write_checkpoint("register", &register_sum).unwrap();

        let invoker = Arc::new(freesurfer_invoker());
        let builder = freesurfer_builder(invoker.clone());
        let graph = builder.build(&ctx, Phase::Freesurfer).await.unwrap();

        // One synthesized task per checkpointed stage, no fslinfo probe.
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.get("sub-01:split").unwrap().state, TaskState::Succeeded);
        assert_eq!(graph.get("sub-01:register").unwrap().state, TaskState::Succeeded);
        assert_eq!(graph.get("sub-01:fit").unwrap().state, TaskState::Pending);
        assert_eq!(invoker.invocation_count(), 0);
    }

    #[tokio::test]
    async fn test_input_change_invalidates_downstream_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let store = CheckpointStore::for_context(&ctx);

        let stages = phase_stages(Phase::Freesurfer);
        let split_sum =
            stage_checksum("split", &stages[0].resolve_sources(&ctx), &[]).unwrap();
        store.write_checkpoint("split", &split_sum).unwrap();

        // Changing an input file supersedes the stored checkpoint.
        std::fs::write(ctx.input("bvals"), "changed").unwrap();

        let builder = freesurfer_builder(Arc::new(freesurfer_invoker()));
        let graph = builder.build(&ctx, Phase::Freesurfer).await.unwrap();
        assert_eq!(graph.get("sub-01:split").unwrap().state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_discovery_failure_surfaces_before_submission() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let invoker = Arc::new(ScriptedInvoker::new().with_stdout("fslinfo", "garbage\n"));
        let builder = freesurfer_builder(invoker);

        let err = builder.build(&ctx, Phase::Freesurfer).await.unwrap_err();
        assert!(matches!(err, TracflowError::StageDiscovery { .. }));
    }

    #[tokio::test]
    async fn test_undeclared_dependency_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let builder = freesurfer_builder(Arc::new(freesurfer_invoker()));

        let bad = vec![StageSpec {
            name: "fit",
            dependencies: vec!["ghost"],
            fan_out: false,
            checksum_sources: Vec::new(),
        }];

        let err = builder.build_from_stages(&ctx, bad).await.unwrap_err();
        assert!(matches!(err, TracflowError::Internal(_)));
        assert!(err.to_string().contains("undeclared stage 'ghost'"));
    }

    #[tokio::test]
    async fn test_singleton_phase_graph() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let config = RunConfig::new(Phase::Bedpostx, "/out");
        let registry =
            StageRegistry::for_phase(&config, Arc::new(ScriptedInvoker::new()));
        let builder = TaskGraphBuilder::new(Arc::new(registry));

        let graph = builder.build(&ctx, Phase::Bedpostx).await.unwrap();
        assert_eq!(graph.len(), 1);
        let task = graph.get("sub-01:bedpostx").unwrap();
        assert!(task.completes_stage);
        assert!(task.dependencies.is_empty());
    }

    #[tokio::test]
    async fn test_idempotency_keys_distinguish_units() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = fixture_subject(tmp.path(), "sub-01");
        let builder = freesurfer_builder(Arc::new(freesurfer_invoker()));

        let graph = builder.build(&ctx, Phase::Freesurfer).await.unwrap();
        let unit0 = &graph.get("sub-01:register[0]").unwrap().idempotency_key;
        let unit1 = &graph.get("sub-01:register[1]").unwrap().idempotency_key;
        let fan_in = &graph.get("sub-01:register").unwrap().idempotency_key;
        assert_ne!(unit0, unit1);
        assert_ne!(unit0, fan_in);

        // Rebuilding over unchanged inputs reproduces the same keys.
        let again = builder.build(&ctx, Phase::Freesurfer).await.unwrap();
        assert_eq!(unit0, &again.get("sub-01:register[0]").unwrap().idempotency_key);
    }
}
