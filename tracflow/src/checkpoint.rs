//! Durable stage-completion records.
//!
//! One small flat record per `(context, stage)` pair lives under the
//! context's work directory. A record whose checksum matches the freshly
//! computed stage checksum is sufficient to skip re-execution; a mismatch is
//! treated as "no valid checkpoint" and the stage runs again.

use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A durable record proving a stage completed for a given input checksum.
///
/// Never mutated in place; superseded by an atomic replace with a newer
/// checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// The owning context.
    pub context_id: String,
    /// The completed stage.
    pub stage: String,
    /// Opaque content checksum of the stage's declared inputs.
    pub checksum: String,
    /// Completion time.
    pub completed_at: DateTime<Utc>,
}

/// File-backed checkpoint store for one execution context.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    context_id: String,
    root: PathBuf,
}

impl CheckpointStore {
    /// Creates a store beneath the context's work directory.
    #[must_use]
    pub fn for_context(ctx: &ExecutionContext) -> Self {
        Self {
            context_id: ctx.id.clone(),
            root: ctx.checkpoint_dir(),
        }
    }

    /// Returns the record path for a stage.
    #[must_use]
    pub fn record_path(&self, stage: &str) -> PathBuf {
        self.root.join(format!("{stage}.checkpoint"))
    }

    /// Returns true iff a durable record for the stage exists with exactly
    /// this checksum. A record with a different checksum is logged and
    /// treated as absent, forcing re-execution.
    pub fn has_checkpoint(&self, stage: &str, checksum: &str) -> Result<bool> {
        match self.read(stage)? {
            None => Ok(false),
            Some(record) if record.checksum == checksum => Ok(true),
            Some(record) => {
                let mismatch = TracflowError::ChecksumMismatch {
                    context_id: self.context_id.clone(),
                    stage: stage.to_string(),
                    stored: record.checksum,
                    expected: checksum.to_string(),
                };
                tracing::warn!(
                    context = %self.context_id,
                    stage,
                    "{mismatch}; stage will re-execute"
                );
                Ok(false)
            }
        }
    }

    /// Reads the record for a stage, if one exists.
    pub fn read(&self, stage: &str) -> Result<Option<Checkpoint>> {
        let path = self.record_path(stage);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        parse_record(&path, &text).map(Some)
    }

    /// Writes (or supersedes) the record for a stage. Idempotent.
    ///
    /// The record is written to a temporary file in the same directory and
    /// renamed into place, so concurrent writers for the same key cannot
    /// corrupt the record.
    pub fn write_checkpoint(&self, stage: &str, checksum: &str) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let record = Checkpoint {
            context_id: self.context_id.clone(),
            stage: stage.to_string(),
            checksum: checksum.to_string(),
            completed_at: Utc::now(),
        };
        let body = format!(
            "context_id={}\nstage={}\nchecksum={}\ncompleted_at={}\n",
            record.context_id,
            record.stage,
            record.checksum,
            record.completed_at.to_rfc3339()
        );

        let tmp = self.root.join(format!(".{stage}.{}.tmp", Uuid::new_v4()));
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.record_path(stage))?;

        tracing::info!(context = %self.context_id, stage, checksum, "wrote checkpoint");
        Ok(())
    }
}

fn parse_record(path: &Path, text: &str) -> Result<Checkpoint> {
    let mut context_id = None;
    let mut stage = None;
    let mut checksum = None;
    let mut completed_at = None;

    for line in text.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        match key {
            "context_id" => context_id = Some(value.to_string()),
            "stage" => stage = Some(value.to_string()),
            "checksum" => checksum = Some(value.to_string()),
            "completed_at" => {
                completed_at = Some(DateTime::parse_from_rfc3339(value).map_err(|e| {
                    TracflowError::MalformedCheckpoint {
                        path: path.to_path_buf(),
                        reason: format!("bad timestamp: {e}"),
                    }
                })?);
            }
            _ => {}
        }
    }

    match (context_id, stage, checksum, completed_at) {
        (Some(context_id), Some(stage), Some(checksum), Some(completed_at)) => Ok(Checkpoint {
            context_id,
            stage,
            checksum,
            completed_at: completed_at.with_timezone(&Utc),
        }),
        _ => Err(TracflowError::MalformedCheckpoint {
            path: path.to_path_buf(),
            reason: "missing required field".to_string(),
        }),
    }
}

/// Computes a stage checksum over declared input files and upstream stage
/// checksums.
///
/// File paths are sorted before hashing so the result is independent of
/// declaration order; a missing file contributes its path and an absence
/// marker rather than failing, so a checksum can always be derived.
pub fn stage_checksum(stage: &str, files: &[PathBuf], upstream: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(stage.as_bytes());

    let mut sorted: Vec<&PathBuf> = files.iter().collect();
    sorted.sort();
    for path in sorted {
        hasher.update(path.to_string_lossy().as_bytes());
        match std::fs::File::open(path) {
            Ok(mut file) => {
                let mut buf = [0u8; 8192];
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                hasher.update(b"<absent>");
            }
            Err(err) => return Err(err.into()),
        }
    }

    for checksum in upstream {
        hasher.update(checksum.as_bytes());
    }

    Ok(hex::encode(&hasher.finalize()[..16]))
}
