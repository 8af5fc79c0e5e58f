//! Concrete stage runners.
//!
//! Each runner builds the external command lines for one stage and delegates
//! execution to the run's [`ToolInvoker`]. File staging (copies into the
//! work directory) happens here; the scientific commands run in the
//! container.

use super::{run_tool, TaskRunner};
use crate::config::{EdgeList, RunConfig};
use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::invoker::ToolInvoker;
use async_trait::async_trait;
use std::sync::Arc;

/// Formats a fan-out slice file name, `data_eddy_tmp0000.nii.gz` style.
fn slice_name(unit: usize) -> String {
    format!("data_eddy_tmp{unit:04}.nii.gz")
}

/// Step-1 root stage: stages input files into the work directory, extracts
/// the reference frame, and splits the 4D diffusion volume into timeslices.
#[derive(Debug)]
pub struct SplitRunner {
    invoker: Arc<dyn ToolInvoker>,
}

impl SplitRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskRunner for SplitRunner {
    fn stage(&self) -> &str {
        "split"
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        tokio::fs::copy(ctx.input("bvecs"), ctx.work("bvecs")).await?;
        tokio::fs::copy(ctx.input("bvals"), ctx.work("bvals")).await?;
        tokio::fs::copy(ctx.input("anat.nii.gz"), ctx.work("T1.nii.gz")).await?;

        let input = ctx.input("hardi.nii.gz");
        let prefix = ctx.work("data_eddy");

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!("fslroi {} {}_ref 0 1", input.display(), prefix.display()),
            &[ctx.work("data_eddy_ref.nii.gz")],
        )
        .await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!("fslsplit {} {}_tmp", input.display(), prefix.display()),
            &[],
        )
        .await
    }
}

/// Per-timeslice registration, fanned out over the volume's frame count.
///
/// Discovery reads the frame count (`dim4`) from the diffusion volume
/// header; the fan-in (`unit == None`) merges the registered slices back
/// into a single volume and removes the intermediates.
#[derive(Debug)]
pub struct RegisterRunner {
    invoker: Arc<dyn ToolInvoker>,
}

impl RegisterRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskRunner for RegisterRunner {
    fn stage(&self) -> &str {
        "register"
    }

    async fn discover(&self, ctx: &ExecutionContext) -> Result<Option<usize>> {
        let input = ctx.input("hardi.nii.gz");
        let command = format!("fslinfo {} | sed -n -e '/^dim4/p'", input.display());
        let output = self.invoker.invoke(ctx, &command).await?;

        if !output.success() {
            return Err(TracflowError::discovery(
                self.stage(),
                &ctx.id,
                format!("header probe exited with status {:?}", output.exit_code),
            ));
        }

        let frames: usize = output
            .stdout
            .split_whitespace()
            .last()
            .and_then(|token| token.parse().ok())
            .ok_or_else(|| {
                TracflowError::discovery(
                    self.stage(),
                    &ctx.id,
                    format!(
                        "could not read frame count from {}: {:?}",
                        input.display(),
                        output.stdout
                    ),
                )
            })?;

        if frames == 0 {
            return Err(TracflowError::discovery(
                self.stage(),
                &ctx.id,
                "volume reports zero frames",
            ));
        }

        Ok(Some(frames))
    }

    async fn run(&self, ctx: &ExecutionContext, unit: Option<usize>) -> Result<()> {
        let prefix = ctx.work("data_eddy");

        match unit {
            Some(index) => {
                let slice = ctx.work(&slice_name(index));
                // A short volume may not produce every slice index; nothing
                // to register then.
                if !slice.exists() {
                    return Ok(());
                }
                run_tool(
                    self.invoker.as_ref(),
                    ctx,
                    self.stage(),
                    &format!(
                        "flirt -in {0} -ref {1}_ref -nosearch -interp trilinear -o {0} -paddingsize 1 >> {1}.ecclog",
                        slice.display(),
                        prefix.display()
                    ),
                    &[],
                )
                .await
            }
            None => {
                run_tool(
                    self.invoker.as_ref(),
                    ctx,
                    self.stage(),
                    &format!(
                        "fslmerge -t {0}.nii.gz {0}_tmp*.nii.gz",
                        prefix.display()
                    ),
                    &[ctx.work("data_eddy.nii.gz")],
                )
                .await?;

                remove_with_prefix(&ctx.work_dir, "data_eddy_tmp")?;
                remove_with_prefix(&ctx.work_dir, "data_eddy_ref")?;
                Ok(())
            }
        }
    }
}

/// Removes work-directory files whose names start with the given prefix.
fn remove_with_prefix(dir: &std::path::Path, prefix: &str) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with(prefix))
        {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Brain extraction and diffusion tensor fitting over the merged volume.
#[derive(Debug)]
pub struct FitRunner {
    invoker: Arc<dyn ToolInvoker>,
}

impl FitRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskRunner for FitRunner {
    fn stage(&self) -> &str {
        "fit"
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        let data = ctx.work("data_eddy.nii.gz");
        let bet = ctx.work("data_bet.nii.gz");
        let mask = ctx.work("data_bet_mask.nii.gz");
        let params = ctx.work("DTIparams");

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!("bet {} {} -m -f 0.3", data.display(), bet.display()),
            &[mask.clone()],
        )
        .await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "dtifit --verbose -k {} -o {} -m {} -r {} -b {}",
                data.display(),
                params.display(),
                mask.display(),
                ctx.work("bvecs").display(),
                ctx.work("bvals").display()
            ),
            &[
                ctx.work("DTIparams_FA.nii.gz"),
                ctx.work("DTIparams_L1.nii.gz"),
            ],
        )
        .await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "fslmaths {0}_L1.nii.gz -add {0}_L2.nii.gz -add {0}_L3.nii.gz -div 3 {0}_MD.nii.gz",
                params.display()
            ),
            &[],
        )
        .await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "fslmaths {0}_L2.nii.gz -add {0}_L3.nii.gz -div 2 {0}_RD.nii.gz",
                params.display()
            ),
            &[],
        )
        .await?;

        tokio::fs::copy(ctx.work("DTIparams_L1.nii.gz"), ctx.work("DTIparams_AD.nii.gz")).await?;
        tokio::fs::copy(ctx.work("DTIparams_FA.nii.gz"), ctx.work("FA.nii.gz")).await?;
        Ok(())
    }
}

/// Fiber orientation modeling over the step-1 output.
#[derive(Debug)]
pub struct BedpostxRunner {
    invoker: Arc<dyn ToolInvoker>,
}

impl BedpostxRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskRunner for BedpostxRunner {
    fn stage(&self) -> &str {
        "bedpostx"
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        let input_dir = ctx.work("bedpostx_b1000");
        tokio::fs::create_dir_all(&input_dir).await?;
        tokio::fs::copy(ctx.work("data_eddy.nii.gz"), input_dir.join("data.nii.gz")).await?;
        tokio::fs::copy(
            ctx.work("data_bet_mask.nii.gz"),
            input_dir.join("nodif_brain_mask.nii.gz"),
        )
        .await?;
        tokio::fs::copy(ctx.work("bvecs"), input_dir.join("bvecs")).await?;
        tokio::fs::copy(ctx.work("bvals"), input_dir.join("bvals")).await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!("bedpostx {}", input_dir.display()),
            &[ctx.work("bedpostx_b1000.bedpostX/merged_th1samples.nii.gz")],
        )
        .await
    }
}

/// Probabilistic tractography over the bedpostx output.
#[derive(Debug)]
pub struct ProbtrackxRunner {
    invoker: Arc<dyn ToolInvoker>,
    sample_count: u32,
    edge_list: EdgeList,
}

impl ProbtrackxRunner {
    /// Creates the runner from the run configuration.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>, config: &RunConfig) -> Self {
        Self {
            invoker,
            sample_count: config.sample_count,
            edge_list: config.edge_list,
        }
    }
}

#[async_trait]
impl TaskRunner for ProbtrackxRunner {
    fn stage(&self) -> &str {
        "probtrackx"
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        let bpx = ctx.work("bedpostx_b1000.bedpostX");
        let out_dir = ctx.work("probtrackx");
        tokio::fs::create_dir_all(&out_dir).await?;

        let seeds = match self.edge_list {
            EdgeList::All => "/opt/tracflow/lists/edges_all.txt",
            EdgeList::Reduced => "/opt/tracflow/lists/edges_reduced.txt",
        };

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "probtrackx2 -s {}/merged -m {}/nodif_brain_mask.nii.gz -P {} --network --seed={} --dir={} --out=fdt",
                bpx.display(),
                bpx.display(),
                self.sample_count,
                seeds,
                out_dir.display()
            ),
            &[out_dir.join("fdt_network_matrix")],
        )
        .await
    }
}

/// Alternative tractography pipeline, run after step 1.
#[derive(Debug)]
pub struct MrtrixRunner {
    invoker: Arc<dyn ToolInvoker>,
}

impl MrtrixRunner {
    /// Creates the runner.
    #[must_use]
    pub fn new(invoker: Arc<dyn ToolInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl TaskRunner for MrtrixRunner {
    fn stage(&self) -> &str {
        "mrtrix"
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        let out_dir = ctx.work("mrtrix");
        tokio::fs::create_dir_all(&out_dir).await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "mrconvert {} {}/dwi.mif -fslgrad {} {}",
                ctx.work("data_eddy.nii.gz").display(),
                out_dir.display(),
                ctx.work("bvecs").display(),
                ctx.work("bvals").display()
            ),
            &[],
        )
        .await?;

        run_tool(
            self.invoker.as_ref(),
            ctx,
            self.stage(),
            &format!(
                "tckgen {0}/dwi.mif {0}/tracks.tck -seed_dynamic {0}/dwi.mif",
                out_dir.display()
            ),
            &[out_dir.join("tracks.tck")],
        )
        .await
    }
}
