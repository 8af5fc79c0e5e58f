//! Error types for the tracflow orchestration engine.
//!
//! The taxonomy separates fatal, run-aborting errors (input layout, missing
//! external dependencies) from per-context failures (discovery, task
//! execution), which never abort unrelated contexts.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for tracflow operations.
#[derive(Debug, Error)]
pub enum TracflowError {
    /// An input location is missing or matches neither the session nor the
    /// subject layout convention. Detected before any task submission.
    #[error("invalid input layout at {path}: {reason}")]
    InvalidInputLayout {
        /// The offending input location.
        path: PathBuf,
        /// Why the location was rejected.
        reason: String,
    },

    /// A required external executable or container image is absent.
    /// Detected before any task submission.
    #[error("missing external dependency: {what}\n{hint}")]
    MissingExternalDependency {
        /// The missing executable or image.
        what: String,
        /// Remediation hint shown to the caller.
        hint: String,
    },

    /// A fan-out cardinality could not be determined from upstream data.
    /// Fails only the owning context.
    #[error("stage '{stage}' discovery failed for context '{context_id}': {reason}")]
    StageDiscovery {
        /// The fan-out stage whose discovery failed.
        stage: String,
        /// The owning context.
        context_id: String,
        /// What went wrong.
        reason: String,
    },

    /// An external command returned nonzero or a declared output is missing,
    /// after the retry limit was exhausted.
    #[error("task '{task_id}' failed after {attempts} attempt(s): {reason}")]
    TaskExecution {
        /// The failed task.
        task_id: String,
        /// Attempts used, including the first.
        attempts: u32,
        /// The failure detail of the last attempt.
        reason: String,
    },

    /// Bookkeeping status for a task whose ancestor terminally failed.
    /// Not a true failure; the task was never submitted.
    #[error("task '{task_id}' skipped: upstream task '{failed_dependency}' failed")]
    SkippedDueToDependencyFailure {
        /// The skipped task.
        task_id: String,
        /// The terminally failed ancestor.
        failed_dependency: String,
    },

    /// A stored checkpoint checksum does not match the freshly computed one.
    /// Treated as "no valid checkpoint"; the stage re-executes.
    #[error(
        "checkpoint for ({context_id}, {stage}) holds checksum {stored}, expected {expected}"
    )]
    ChecksumMismatch {
        /// The owning context.
        context_id: String,
        /// The stage whose checkpoint mismatched.
        stage: String,
        /// The checksum found on disk.
        stored: String,
        /// The freshly computed checksum.
        expected: String,
    },

    /// A malformed checkpoint record on disk.
    #[error("malformed checkpoint record at {path}: {reason}")]
    MalformedCheckpoint {
        /// The record location.
        path: PathBuf,
        /// Why parsing failed.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A spawned task panicked or was aborted.
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TracflowError {
    /// Creates an invalid input layout error.
    #[must_use]
    pub fn invalid_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::InvalidInputLayout {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a missing external dependency error.
    #[must_use]
    pub fn missing_dependency(what: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::MissingExternalDependency {
            what: what.into(),
            hint: hint.into(),
        }
    }

    /// Creates a stage discovery error.
    #[must_use]
    pub fn discovery(
        stage: impl Into<String>,
        context_id: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageDiscovery {
            stage: stage.into(),
            context_id: context_id.into(),
            reason: reason.into(),
        }
    }

    /// Creates a task execution error.
    #[must_use]
    pub fn task_execution(
        task_id: impl Into<String>,
        attempts: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self::TaskExecution {
            task_id: task_id.into(),
            attempts,
            reason: reason.into(),
        }
    }

    /// Returns true if the error aborts the whole run rather than one context.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InvalidInputLayout { .. } | Self::MissingExternalDependency { .. }
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TracflowError>;
