//! # Tracflow
//!
//! An orchestration engine for multi-stage tractography processing across
//! subjects.
//!
//! Tracflow drives one pipeline phase per run over any number of execution
//! contexts (subjects or subject sessions):
//!
//! - **Context building**: BIDS-style input partitioning into per-subject
//!   and per-session units with derived work and output directories
//! - **Checkpointing**: durable per-stage completion records keyed by
//!   chained input checksums, so unchanged work is never repeated
//! - **Task graphs**: fan-out stages expand to one task per discovered
//!   unit, with a fan-in task closing the stage
//! - **Executor backends**: an in-process worker pool, or a single batch
//!   scheduler allocation (Slurm, Cobalt, Grid Engine) per run
//! - **Failure isolation**: a failing context never aborts its siblings
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tracflow::prelude::*;
//!
//! let config = RunConfig::new(Phase::Freesurfer, "/data/out");
//! let invoker = Arc::new(SingularityInvoker::new(&config.container));
//! let registry = Arc::new(StageRegistry::for_phase(&config, invoker));
//! let executor = Arc::new(LocalExecutor::new(config.retry_limit));
//!
//! let contexts = ContextBuilder::new(&config.output_root).build_all(&inputs)?;
//! let report = SchedulerDriver::new(config, registry, executor)
//!     .run(contexts)
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod checkpoint;
pub mod config;
pub mod context;
pub mod driver;
pub mod errors;
pub mod executor;
pub mod graph;
pub mod invoker;
pub mod resources;
pub mod stages;

#[cfg(test)]
mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::checkpoint::{stage_checksum, Checkpoint, CheckpointStore};
    pub use crate::config::{
        Backend, EdgeList, Phase, RunConfig, SchedulerKind, SchedulerOptions,
    };
    pub use crate::context::{discover_subjects, ContextBuilder, ExecutionContext};
    pub use crate::driver::{ContextReport, ContextStatus, RunReport, SchedulerDriver};
    pub use crate::errors::{Result, TracflowError};
    pub use crate::executor::{BatchExecutor, Executor, ExecutorHandle, LocalExecutor, TaskResult};
    pub use crate::graph::{Task, TaskGraph, TaskGraphBuilder, TaskId, TaskState};
    pub use crate::invoker::{preflight, InvocationOutput, SingularityInvoker, ToolInvoker};
    pub use crate::resources::{
        FixedEstimator, PriorOutputEstimator, ResourceEstimator, ResourceProfile,
    };
    pub use crate::stages::{StageRegistry, StageSpec, TaskRunner};
}
