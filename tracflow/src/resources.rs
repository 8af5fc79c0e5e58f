//! Per-worker resource estimation.
//!
//! Most stages have fixed, input-independent cost. Tractography memory
//! tracks the size of the prior model-fitting stage's output directory, so
//! its estimator walks that directory and applies a safety multiplier.
//! Estimation is pluggable per stage via [`ResourceEstimator`].

use crate::context::ExecutionContext;
use crate::errors::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Safety multiplier applied to measured prior-output size.
pub const MEMORY_SAFETY_MULTIPLIER: f64 = 1.25;

/// Floor for estimated memory per worker, in gigabytes.
pub const MEMORY_FLOOR_GB: f64 = 0.1;

/// Per-worker core/memory request for a stage's submission.
///
/// Immutable once computed for a given submission; every task of the stage
/// receives the same profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    /// Cores allocated to each worker.
    pub cores_per_worker: usize,
    /// Memory per worker in gigabytes; `None` means no explicit ceiling.
    pub mem_per_worker_gb: Option<f64>,
}

impl ResourceProfile {
    /// One worker per available core, no memory ceiling.
    #[must_use]
    pub fn per_core() -> Self {
        Self {
            cores_per_worker: available_cores(),
            mem_per_worker_gb: None,
        }
    }
}

/// Number of cores visible to this process, with a floor of one.
#[must_use]
pub fn available_cores() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Derives the per-worker resource profile for a stage submission.
pub trait ResourceEstimator: Send + Sync + std::fmt::Debug {
    /// Estimates the profile for one execution context.
    fn estimate(&self, ctx: &ExecutionContext) -> Result<ResourceProfile>;
}

/// Static profile for stages with input-independent cost.
#[derive(Debug, Clone)]
pub struct FixedEstimator {
    profile: ResourceProfile,
}

impl FixedEstimator {
    /// Creates an estimator returning the given profile.
    #[must_use]
    pub fn new(profile: ResourceProfile) -> Self {
        Self { profile }
    }

    /// One worker per available core, no explicit memory ceiling.
    #[must_use]
    pub fn per_core() -> Self {
        Self::new(ResourceProfile::per_core())
    }
}

impl ResourceEstimator for FixedEstimator {
    fn estimate(&self, _ctx: &ExecutionContext) -> Result<ResourceProfile> {
        Ok(self.profile)
    }
}

/// Derives memory from the footprint of a prior stage's output directory.
///
/// Walks the directory (symbolic links excluded, to avoid double counting),
/// sums file sizes, applies [`MEMORY_SAFETY_MULTIPLIER`], and floors the
/// result at the configured minimum.
#[derive(Debug, Clone)]
pub struct PriorOutputEstimator {
    /// Prior-stage output directory, relative to the context work dir.
    prior_output: String,
    cores_per_worker: usize,
    floor_gb: f64,
}

impl PriorOutputEstimator {
    /// Creates an estimator reading from `work_dir/<prior_output>`.
    #[must_use]
    pub fn new(prior_output: impl Into<String>) -> Self {
        Self {
            prior_output: prior_output.into(),
            cores_per_worker: 1,
            floor_gb: MEMORY_FLOOR_GB,
        }
    }

    /// Overrides the memory floor in gigabytes.
    #[must_use]
    pub fn with_floor_gb(mut self, floor: f64) -> Self {
        self.floor_gb = floor;
        self
    }
}

impl ResourceEstimator for PriorOutputEstimator {
    fn estimate(&self, ctx: &ExecutionContext) -> Result<ResourceProfile> {
        let dir = ctx.work(&self.prior_output);
        let bytes = directory_size(&dir)?;
        let estimated_gb = MEMORY_SAFETY_MULTIPLIER * (bytes as f64) * 1.0e-9;
        let mem = estimated_gb.max(self.floor_gb);

        tracing::debug!(
            context = %ctx.id,
            dir = %dir.display(),
            bytes,
            mem_gb = mem,
            "estimated memory from prior stage output"
        );

        Ok(ResourceProfile {
            cores_per_worker: self.cores_per_worker,
            mem_per_worker_gb: Some(mem),
        })
    }
}

/// Sums regular-file sizes beneath a directory, skipping symbolic links.
///
/// A missing directory contributes zero bytes; the floor covers the case
/// where the prior stage has not produced output here.
pub fn directory_size(dir: &Path) -> Result<u64> {
    if !dir.exists() {
        return Ok(0);
    }

    let mut total = 0u64;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = std::fs::symlink_metadata(entry.path())?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                pending.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
