//! The contract for invoking opaque external commands.
//!
//! Each task body issues one or more calls to an external command executed
//! inside a designated container image, with stdout/stderr appended to the
//! context's log file. A task succeeds iff the command exits zero and its
//! declared output files exist afterwards. The scientific content of the
//! commands is out of scope here.

use crate::config::RunConfig;
use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Outcome of a single external command invocation.
#[derive(Debug, Clone)]
pub struct InvocationOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Process exit code, if the process ran to completion.
    pub exit_code: Option<i32>,
}

impl InvocationOutput {
    /// Returns true if the command exited zero.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external commands inside the run's container image.
///
/// The seam every stage runner and the fan-out discovery probe go through;
/// tests substitute a scripted implementation.
#[async_trait]
pub trait ToolInvoker: Send + Sync + std::fmt::Debug {
    /// Executes a shell command for the given context, appending combined
    /// output to the context log, and returns the captured output.
    ///
    /// A nonzero exit is reported through [`InvocationOutput::exit_code`],
    /// not as an `Err`; `Err` is reserved for failures to launch or log.
    async fn invoke(&self, ctx: &ExecutionContext, command: &str) -> Result<InvocationOutput>;
}

/// Production invoker: wraps every command in `singularity exec <image>`.
#[derive(Debug, Clone)]
pub struct SingularityInvoker {
    container: std::path::PathBuf,
}

impl SingularityInvoker {
    /// Creates an invoker bound to a container image.
    #[must_use]
    pub fn new(container: impl Into<std::path::PathBuf>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl ToolInvoker for SingularityInvoker {
    async fn invoke(&self, ctx: &ExecutionContext, command: &str) -> Result<InvocationOutput> {
        tracing::debug!(context = %ctx.id, command, "invoking external command");

        let output = tokio::process::Command::new("singularity")
            .arg("exec")
            .arg(&self.container)
            .arg("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await?;

        append_to_log(&ctx.log_path, command, &output.stdout, &output.stderr).await?;

        Ok(InvocationOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code(),
        })
    }
}

/// Appends an invocation transcript to the context log file.
async fn append_to_log(
    log_path: &Path,
    command: &str,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .await?;
    file.write_all(format!("$ {command}\n").as_bytes()).await?;
    file.write_all(stdout).await?;
    file.write_all(stderr).await?;
    Ok(())
}

/// Verifies required external executables and the container image before any
/// task submission.
///
/// # Errors
///
/// Returns [`TracflowError::MissingExternalDependency`] with a remediation
/// hint if `singularity` is not on PATH or the configured image is absent.
pub fn preflight(config: &RunConfig) -> Result<()> {
    preflight_with_lookup(config, |name| which(name).is_some())
}

fn preflight_with_lookup(config: &RunConfig, on_path: impl Fn(&str) -> bool) -> Result<()> {
    if !on_path("singularity") {
        return Err(TracflowError::missing_dependency(
            "singularity executable in PATH",
            "Install Singularity: https://sylabs.io/guides/3.0/user-guide/installation.html",
        ));
    }

    if !config.container.exists() {
        return Err(TracflowError::missing_dependency(
            format!("container image at {}", config.container.display()),
            "Specify another image with --container, or build one from the container recipe.",
        ));
    }

    Ok(())
}

/// Minimal PATH lookup for an executable name.
fn which(name: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}
