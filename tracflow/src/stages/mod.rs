//! Stage definitions and runners.
//!
//! A [`StageSpec`] declares a stage's dependencies and checksum inputs; a
//! [`TaskRunner`] carries the external command construction for that stage.
//! Runners are looked up by stage name through the [`StageRegistry`], so the
//! executor invokes every stage uniformly.

mod registry;
mod runners;
mod spec;

pub use registry::StageRegistry;
pub use runners::{
    BedpostxRunner, FitRunner, MrtrixRunner, ProbtrackxRunner, RegisterRunner, SplitRunner,
};
pub use spec::{phase_stages, ChecksumSource, StageSpec};

use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::invoker::ToolInvoker;
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::PathBuf;

/// Executes the work of one stage for one context.
///
/// `unit` is the fan-out index for per-slice tasks and `None` for singleton
/// and fan-in tasks. Runners delegate external command execution to the
/// run's [`ToolInvoker`].
#[async_trait]
pub trait TaskRunner: Send + Sync + Debug {
    /// The stage this runner implements.
    fn stage(&self) -> &str;

    /// For fan-out stages: determines the fan-out cardinality from upstream
    /// data. Returns `None` for stages without a fan-out boundary.
    async fn discover(&self, _ctx: &ExecutionContext) -> Result<Option<usize>> {
        Ok(None)
    }

    /// Runs one task of the stage.
    async fn run(&self, ctx: &ExecutionContext, unit: Option<usize>) -> Result<()>;
}

/// Runs one external command and verifies its declared outputs.
///
/// The task contract: success iff the command exits zero and every declared
/// output file exists afterwards.
pub(crate) async fn run_tool(
    invoker: &dyn ToolInvoker,
    ctx: &ExecutionContext,
    stage: &str,
    command: &str,
    expected_outputs: &[PathBuf],
) -> Result<()> {
    let output = invoker.invoke(ctx, command).await?;

    if !output.success() {
        return Err(TracflowError::task_execution(
            format!("{}:{stage}", ctx.id),
            1,
            format!(
                "command exited with status {:?}: {command}",
                output.exit_code
            ),
        ));
    }

    for path in expected_outputs {
        if !path.exists() {
            return Err(TracflowError::task_execution(
                format!("{}:{stage}", ctx.id),
                1,
                format!("expected output missing: {}", path.display()),
            ));
        }
    }

    Ok(())
}
