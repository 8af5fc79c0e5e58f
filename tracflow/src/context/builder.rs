//! Partitions input locations into execution contexts.

use super::execution::{dir_name, is_session_dir, is_subject_dir};
use super::ExecutionContext;
use crate::errors::{Result, TracflowError};
use std::path::{Path, PathBuf};

/// Builds [`ExecutionContext`] values from a set of BIDS input locations.
///
/// A subject directory containing `ses-*` subdirectories yields one context
/// per session; a subject directory without sessions yields a single subject
/// context. Output directories are derived deterministically under
/// `<output_root>/derivatives/` and created lazily.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    output_root: PathBuf,
    create_directories: bool,
}

impl ContextBuilder {
    /// Creates a builder rooted at the given output directory.
    #[must_use]
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: output_root.into(),
            create_directories: true,
        }
    }

    /// Disables lazy output directory creation. Used by tests that only
    /// exercise path derivation.
    #[must_use]
    pub fn without_directory_creation(mut self) -> Self {
        self.create_directories = false;
        self
    }

    /// Partitions the input locations and produces one context per unit.
    ///
    /// # Errors
    ///
    /// Returns [`TracflowError::InvalidInputLayout`] if an input location
    /// does not exist, is not a directory, or matches neither the subject
    /// nor the session naming convention.
    pub fn build_all(&self, inputs: &[PathBuf]) -> Result<Vec<ExecutionContext>> {
        let mut session_dirs: Vec<PathBuf> = Vec::new();
        let mut subject_dirs: Vec<PathBuf> = Vec::new();

        for input in inputs {
            if !input.is_dir() {
                return Err(TracflowError::invalid_input(
                    input.clone(),
                    "input location does not exist or is not a directory",
                ));
            }
            let name = dir_name(input).ok_or_else(|| {
                TracflowError::invalid_input(input.clone(), "input path has no directory name")
            })?;
            if !is_subject_dir(name) {
                return Err(TracflowError::invalid_input(
                    input.clone(),
                    "directory name does not follow the sub-* convention",
                ));
            }

            let sessions = session_subdirs(input)?;
            if sessions.is_empty() {
                subject_dirs.push(input.clone());
            } else {
                session_dirs.extend(sessions);
            }
        }

        let mut contexts = Vec::with_capacity(session_dirs.len() + subject_dirs.len());

        for session_dir in &session_dirs {
            contexts.push(self.session_context(session_dir)?);
        }
        for subject_dir in &subject_dirs {
            contexts.push(self.subject_context(subject_dir)?);
        }

        for ctx in &contexts {
            tracing::debug!(context = %ctx.id, input = %ctx.input_dir.display(), "built execution context");
            if self.create_directories {
                ctx.ensure_directories()?;
            }
        }

        Ok(contexts)
    }

    fn session_context(&self, session_dir: &Path) -> Result<ExecutionContext> {
        let session = dir_name(session_dir).ok_or_else(|| {
            TracflowError::invalid_input(session_dir, "session path has no directory name")
        })?;
        let subject = session_dir
            .parent()
            .and_then(dir_name)
            .ok_or_else(|| {
                TracflowError::invalid_input(session_dir, "session directory has no parent subject")
            })?;

        let output_dir = self
            .output_root
            .join("derivatives")
            .join(subject)
            .join(session);
        Ok(ExecutionContext::new(
            format!("{subject}_{session}"),
            session_dir,
            output_dir,
        ))
    }

    fn subject_context(&self, subject_dir: &Path) -> Result<ExecutionContext> {
        let subject = dir_name(subject_dir).ok_or_else(|| {
            TracflowError::invalid_input(subject_dir, "subject path has no directory name")
        })?;
        let output_dir = self.output_root.join("derivatives").join(subject);
        Ok(ExecutionContext::new(subject, subject_dir, output_dir))
    }
}

/// Lists the `sub-*` subdirectories of a dataset or fixture root, sorted by
/// name. Backs the CLI's built-in test fixture mode.
///
/// # Errors
///
/// Returns [`TracflowError::InvalidInputLayout`] if the root is not a
/// directory or holds no subject directories.
pub fn discover_subjects(root: &Path) -> Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Err(TracflowError::invalid_input(
            root,
            "fixture root does not exist or is not a directory",
        ));
    }

    let mut subjects = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() && dir_name(&path).is_some_and(is_subject_dir) {
            subjects.push(path);
        }
    }
    subjects.sort();

    if subjects.is_empty() {
        return Err(TracflowError::invalid_input(
            root,
            "no sub-* directories found",
        ));
    }
    Ok(subjects)
}

/// Lists `ses-*` subdirectories of a subject directory, sorted by name.
fn session_subdirs(subject_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sessions = Vec::new();
    for entry in std::fs::read_dir(subject_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if let Some(name) = dir_name(&path) {
                if is_session_dir(name) {
                    sessions.push(path);
                }
            }
        }
    }
    sessions.sort();
    Ok(sessions)
}
