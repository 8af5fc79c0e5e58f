//! Run configuration.
//!
//! A single [`RunConfig`] is constructed at run start and passed by reference
//! into the scheduler driver and executor backend. There is no ambient global
//! configuration state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The pipeline phase selected for a run. Exactly one phase runs per
/// invocation; phases are chained across separate runs via checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Step 1: diffusion preprocessing, surface reconstruction, registration.
    Freesurfer,
    /// Step 2: fiber orientation modeling.
    Bedpostx,
    /// Step 3: probabilistic tractography.
    Probtrackx,
    /// Step 2b: alternative tractography pipeline, run after step 1.
    Mrtrix,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Freesurfer => write!(f, "freesurfer"),
            Self::Bedpostx => write!(f, "bedpostx"),
            Self::Probtrackx => write!(f, "probtrackx"),
            Self::Mrtrix => write!(f, "mrtrix"),
        }
    }
}

/// Edge list granularity for tractography seeding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeList {
    /// All 6642 region pairs.
    All,
    /// The reduced 930-pair list.
    #[default]
    Reduced,
}

impl fmt::Display for EdgeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Reduced => write!(f, "reduced"),
        }
    }
}

/// The batch scheduler flavor. Variants differ only in how an allocation
/// request is rendered and how workers are launched; task dispatch is
/// identical across kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Slurm (`sbatch`/`srun`).
    Slurm,
    /// Cobalt (`qsub` with Cobalt options).
    Cobalt,
    /// Grid Engine (`qsub` with a per-core cap).
    GridEngine,
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Slurm => write!(f, "slurm"),
            Self::Cobalt => write!(f, "cobalt"),
            Self::GridEngine => write!(f, "grid_engine"),
        }
    }
}

/// Backend-specific allocation parameters, consumed by the executor but not
/// part of its dispatch logic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerOptions {
    /// Number of nodes per block (cores, for Grid Engine).
    pub nodes: usize,
    /// Accounting bank charged for jobs.
    pub bank: String,
    /// Partition or queue to assign jobs to.
    pub partition: String,
    /// Wall-clock limit in `HH:MM:SS` format.
    pub walltime: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            nodes: 1,
            bank: "asccasc".to_string(),
            partition: "pbatch".to_string(),
            walltime: "11:59:00".to_string(),
        }
    }
}

/// Which executor backend actually runs tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// In-process worker pool bounded by available cores.
    Local,
    /// Submission to an HPC batch scheduler.
    Batch {
        /// The scheduler flavor.
        kind: SchedulerKind,
        /// Allocation parameters.
        options: SchedulerOptions,
    },
}

impl Default for Backend {
    fn default() -> Self {
        Self::Local
    }
}

/// Configuration for one pipeline run.
///
/// Built once in `main` and shared read-only for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// The selected pipeline phase.
    pub phase: Phase,
    /// Root directory for derivatives and work directories.
    pub output_root: PathBuf,
    /// Path to the container image external commands run inside.
    pub container: PathBuf,
    /// Tractography samples per voxel.
    pub sample_count: u32,
    /// Edge list selection for tractography.
    pub edge_list: EdgeList,
    /// Automatic retries per failed task. Zero means no retry.
    pub retry_limit: u32,
    /// The executor backend.
    pub backend: Backend,
}

impl RunConfig {
    /// Creates a configuration for the given phase with original defaults.
    #[must_use]
    pub fn new(phase: Phase, output_root: impl Into<PathBuf>) -> Self {
        Self {
            phase,
            output_root: output_root.into(),
            container: PathBuf::from("image.sif"),
            sample_count: 200,
            edge_list: EdgeList::default(),
            retry_limit: 0,
            backend: Backend::default(),
        }
    }

    /// Sets the container image path.
    #[must_use]
    pub fn with_container(mut self, container: impl Into<PathBuf>) -> Self {
        self.container = container.into();
        self
    }

    /// Sets the per-task retry limit.
    #[must_use]
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    /// Sets the tractography sample count.
    #[must_use]
    pub fn with_sample_count(mut self, count: u32) -> Self {
        self.sample_count = count;
        self
    }

    /// Sets the edge list selection.
    #[must_use]
    pub fn with_edge_list(mut self, edge_list: EdgeList) -> Self {
        self.edge_list = edge_list;
        self
    }

    /// Sets the executor backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Freesurfer.to_string(), "freesurfer");
        assert_eq!(Phase::Probtrackx.to_string(), "probtrackx");
        assert_eq!(Phase::Mrtrix.to_string(), "mrtrix");
    }

    #[test]
    fn test_scheduler_options_defaults() {
        let opts = SchedulerOptions::default();
        assert_eq!(opts.nodes, 1);
        assert_eq!(opts.partition, "pbatch");
        assert_eq!(opts.walltime, "11:59:00");
    }

    #[test]
    fn test_run_config_builder() {
        let config = RunConfig::new(Phase::Probtrackx, "/out")
            .with_container("/images/fsl.sif")
            .with_retry_limit(2)
            .with_sample_count(500)
            .with_edge_list(EdgeList::All)
            .with_backend(Backend::Batch {
                kind: SchedulerKind::Slurm,
                options: SchedulerOptions::default(),
            });

        assert_eq!(config.retry_limit, 2);
        assert_eq!(config.sample_count, 500);
        assert_eq!(config.edge_list, EdgeList::All);
        assert!(matches!(config.backend, Backend::Batch { .. }));
    }

    #[test]
    fn test_phase_serialize() {
        let json = serde_json::to_string(&Phase::Bedpostx).unwrap();
        assert_eq!(json, r#""bedpostx""#);
    }
}
