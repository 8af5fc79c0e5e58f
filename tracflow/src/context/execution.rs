//! The per-context execution record.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Identifies one unit of pipeline work: a subject, or a subject+session.
///
/// Created once by [`super::ContextBuilder`], read-only thereafter. All
/// derived paths are deterministic functions of the subject/session names
/// and the output root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique ID, `<subject>` or `<subject>_<session>`.
    pub id: String,
    /// The BIDS input directory for this unit.
    pub input_dir: PathBuf,
    /// Scratch directory for intermediate stage outputs.
    pub work_dir: PathBuf,
    /// Derivatives directory, `<output_root>/derivatives/<subject>[/<session>]`.
    pub output_dir: PathBuf,
    /// Log sink for external command stdout/stderr.
    pub log_path: PathBuf,
}

impl ExecutionContext {
    /// Creates a context rooted at the given derivatives directory.
    #[must_use]
    pub fn new(id: impl Into<String>, input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        let output_dir = output_dir.into();
        Self {
            id: id.into(),
            input_dir: input_dir.into(),
            work_dir: output_dir.join("work_dir"),
            output_dir: output_dir.clone(),
            log_path: output_dir.join("worker.stdout"),
        }
    }

    /// Returns a path inside the input directory.
    #[must_use]
    pub fn input(&self, name: &str) -> PathBuf {
        self.input_dir.join(name)
    }

    /// Returns a path inside the work directory.
    #[must_use]
    pub fn work(&self, name: &str) -> PathBuf {
        self.work_dir.join(name)
    }

    /// The directory where checkpoint records for this context live.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.work_dir.join("checkpoints")
    }

    /// Creates the work and derivatives directories. Idempotent.
    pub fn ensure_directories(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.work_dir)?;
        std::fs::create_dir_all(self.checkpoint_dir())?;
        Ok(())
    }
}

impl AsRef<ExecutionContext> for ExecutionContext {
    fn as_ref(&self) -> &ExecutionContext {
        self
    }
}

/// Returns true if the directory name follows the session convention.
pub(crate) fn is_session_dir(name: &str) -> bool {
    name.starts_with("ses-") && name.len() > 4
}

/// Returns true if the directory name follows the subject convention.
pub(crate) fn is_subject_dir(name: &str) -> bool {
    name.starts_with("sub-") && name.len() > 4
}

/// Basename helper tolerant of trailing separators.
pub(crate) fn dir_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths() {
        let ctx = ExecutionContext::new(
            "sub-01_ses-02",
            "/data/sub-01/ses-02",
            "/out/derivatives/sub-01/ses-02",
        );

        assert_eq!(ctx.work_dir, PathBuf::from("/out/derivatives/sub-01/ses-02/work_dir"));
        assert_eq!(ctx.log_path, PathBuf::from("/out/derivatives/sub-01/ses-02/worker.stdout"));
        assert_eq!(ctx.work("hardi.nii.gz"), ctx.work_dir.join("hardi.nii.gz"));
        assert_eq!(ctx.input("bvals"), PathBuf::from("/data/sub-01/ses-02/bvals"));
    }

    #[test]
    fn test_naming_conventions() {
        assert!(is_subject_dir("sub-01"));
        assert!(!is_subject_dir("sub-"));
        assert!(!is_subject_dir("subject-01"));
        assert!(is_session_dir("ses-baseline"));
        assert!(!is_session_dir("session-01"));
    }

    #[test]
    fn test_ensure_directories_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new("sub-01", "/data/sub-01", tmp.path().join("derivatives/sub-01"));

        ctx.ensure_directories().unwrap();
        ctx.ensure_directories().unwrap();

        assert!(ctx.work_dir.is_dir());
        assert!(ctx.checkpoint_dir().is_dir());
    }
}
