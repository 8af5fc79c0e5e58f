//! Batch scheduler executor.
//!
//! Submits one allocation request per run and dispatches tasks to the
//! allocated workers. The scheduler kinds differ only in how the allocation
//! script is rendered and submitted; task dispatch is shared with the local
//! backend.

use super::{dispatch_with_retry, Executor, ExecutorHandle, TaskResult};
use crate::config::{SchedulerKind, SchedulerOptions};
use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::graph::TaskId;
use crate::resources::{available_cores, ResourceProfile};
use crate::stages::TaskRunner;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// Renders the allocation request script for a scheduler kind.
#[must_use]
pub fn render_allocation(
    kind: SchedulerKind,
    options: &SchedulerOptions,
    profile: &ResourceProfile,
) -> String {
    let mut script = String::from("#!/bin/bash\n");
    match kind {
        SchedulerKind::Slurm => {
            script.push_str("#SBATCH --exclusive\n");
            script.push_str(&format!("#SBATCH -A {}\n", options.bank));
            script.push_str(&format!("#SBATCH -p {}\n", options.partition));
            script.push_str(&format!("#SBATCH -N {}\n", options.nodes));
            script.push_str(&format!("#SBATCH -t {}\n", options.walltime));
            if let Some(mem) = profile.mem_per_worker_gb {
                script.push_str(&format!("#SBATCH --mem={}G\n", mem.ceil() as u64));
            }
            script.push_str(&format!(
                "srun -N {} --ntasks-per-node=1 tracflow-worker --cores {}\n",
                options.nodes, profile.cores_per_worker
            ));
        }
        SchedulerKind::Cobalt => {
            script.push_str(&format!("#COBALT -A {}\n", options.bank));
            script.push_str(&format!("#COBALT -q {}\n", options.partition));
            script.push_str(&format!("#COBALT -n {}\n", options.nodes));
            script.push_str(&format!("#COBALT -t {}\n", options.walltime));
            script.push_str(&format!(
                "aprun -n {} tracflow-worker --cores {}\n",
                options.nodes, profile.cores_per_worker
            ));
        }
        SchedulerKind::GridEngine => {
            script.push_str(&format!("#$ -A {}\n", options.bank));
            script.push_str(&format!("#$ -q {}\n", options.partition));
            script.push_str(&format!("#$ -pe smp {}\n", options.nodes));
            script.push_str(&format!("#$ -l h_rt={}\n", options.walltime));
            if let Some(mem) = profile.mem_per_worker_gb {
                script.push_str(&format!("#$ -l h_vmem={}G\n", mem.ceil() as u64));
            }
            script.push_str(&format!(
                "tracflow-worker --cores {}\n",
                profile.cores_per_worker
            ));
        }
    }
    script
}

/// The submit executable for a scheduler kind.
#[must_use]
pub fn submit_command(kind: SchedulerKind) -> &'static str {
    match kind {
        SchedulerKind::Slurm => "sbatch",
        SchedulerKind::Cobalt | SchedulerKind::GridEngine => "qsub",
    }
}

/// Extracts the allocation id from submit output.
///
/// Slurm prints `Submitted batch job <id>`; the qsub family prints the id
/// alone or embedded in a sentence. The first all-digit token wins.
fn parse_allocation_id(stdout: &str) -> String {
    stdout
        .split_whitespace()
        .find(|token| !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()))
        .map_or_else(|| stdout.trim().to_string(), ToString::to_string)
}

/// Dispatches tasks into a batch scheduler allocation.
#[derive(Debug)]
pub struct BatchExecutor {
    kind: SchedulerKind,
    options: SchedulerOptions,
    retry_limit: u32,
    spool_dir: PathBuf,
    workers: Semaphore,
}

impl BatchExecutor {
    /// Creates an executor spooling allocation scripts under `spool_dir`.
    #[must_use]
    pub fn new(
        kind: SchedulerKind,
        options: SchedulerOptions,
        retry_limit: u32,
        spool_dir: impl Into<PathBuf>,
    ) -> Self {
        let worker_count = options.nodes * available_cores();
        Self {
            kind,
            options,
            retry_limit,
            spool_dir: spool_dir.into(),
            workers: Semaphore::new(worker_count),
        }
    }
}

#[async_trait]
impl Executor for BatchExecutor {
    async fn provision(&self, profile: &ResourceProfile) -> Result<ExecutorHandle> {
        tokio::fs::create_dir_all(&self.spool_dir).await?;
        let script = render_allocation(self.kind, &self.options, profile);
        let path = self.spool_dir.join(format!("tracflow-{}.sh", Uuid::new_v4()));
        tokio::fs::write(&path, script).await?;

        let output = tokio::process::Command::new(submit_command(self.kind))
            .arg(&path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(TracflowError::Internal(format!(
                "allocation request via {} failed: {}",
                submit_command(self.kind),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let allocation = parse_allocation_id(&String::from_utf8_lossy(&output.stdout));
        tracing::info!(
            scheduler = %self.kind,
            allocation = %allocation,
            nodes = self.options.nodes,
            "allocation granted"
        );
        Ok(ExecutorHandle {
            label: self.kind.to_string(),
            allocation: Some(allocation),
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

    fn profile() -> ResourceProfile {
        ResourceProfile {
            cores_per_worker: 4,
            mem_per_worker_gb: Some(12.3),
        }
    }

    #[test]
    fn test_slurm_rendering() {
        let script = render_allocation(SchedulerKind::Slurm, &SchedulerOptions::default(), &profile());
        assert!(script.contains("#SBATCH --exclusive"));
        assert!(script.contains("#SBATCH -A asccasc"));
        assert!(script.contains("#SBATCH -p pbatch"));
        assert!(script.contains("#SBATCH -N 1"));
        assert!(script.contains("#SBATCH -t 11:59:00"));
        assert!(script.contains("#SBATCH --mem=13G"));
        assert!(script.contains("srun -N 1"));
    }

    #[test]
    fn test_cobalt_rendering() {
        let script = render_allocation(SchedulerKind::Cobalt, &SchedulerOptions::default(), &profile());
        assert!(script.contains("#COBALT -A asccasc"));
        assert!(script.contains("#COBALT -q pbatch"));
        assert!(script.contains("#COBALT -n 1"));
        assert!(script.contains("aprun -n 1"));
        assert!(!script.contains("#SBATCH"));
    }

    #[test]
    fn test_grid_engine_rendering() {
        let options = SchedulerOptions {
            nodes: 8,
            ..SchedulerOptions::default()
        };
        let script = render_allocation(SchedulerKind::GridEngine, &options, &profile());
        assert!(script.contains("#$ -pe smp 8"));
        assert!(script.contains("#$ -l h_rt=11:59:00"));
        assert!(script.contains("#$ -l h_vmem=13G"));
    }

    #[test]
    fn test_no_memory_directive_without_ceiling() {
        let unbounded = ResourceProfile {
            cores_per_worker: 4,
            mem_per_worker_gb: None,
        };
        let script =
            render_allocation(SchedulerKind::Slurm, &SchedulerOptions::default(), &unbounded);
        assert!(!script.contains("--mem="));
    }

    #[test]
    fn test_submit_commands() {
        assert_eq!(submit_command(SchedulerKind::Slurm), "sbatch");
        assert_eq!(submit_command(SchedulerKind::Cobalt), "qsub");
        assert_eq!(submit_command(SchedulerKind::GridEngine), "qsub");
    }

    #[test]
    fn test_allocation_id_parsing() {
        assert_eq!(parse_allocation_id("Submitted batch job 123456\n"), "123456");
        assert_eq!(parse_allocation_id("987654\n"), "987654");
        assert_eq!(
            parse_allocation_id("Your job 42 (\"tracflow\") has been submitted\n"),
            "42"
        );
        assert_eq!(parse_allocation_id("alloc.abc\n"), "alloc.abc");
    }
}
