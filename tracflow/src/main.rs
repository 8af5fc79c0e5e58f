//! Tracflow CLI
//!
//! Runs one tractography pipeline phase over a set of subject directories.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tracflow::prelude::*;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EdgeListArg {
    All,
    Reduced,
}

impl From<EdgeListArg> for EdgeList {
    fn from(arg: EdgeListArg) -> Self {
        match arg {
            EdgeListArg::All => Self::All,
            EdgeListArg::Reduced => Self::Reduced,
        }
    }
}

#[derive(Parser)]
#[command(name = "tracflow")]
#[command(about = "Orchestrate multi-stage tractography processing across subjects", long_about = None)]
#[command(version)]
#[command(group(ArgGroup::new("phase").required(true).args(["freesurfer", "bedpostx", "probtrackx", "mrtrix"])))]
#[command(group(ArgGroup::new("scheduler").args(["slurm", "cobalt", "grid_engine"])))]
struct Cli {
    /// Subject input directories (BIDS-style sub-* layout)
    #[arg(required_unless_present = "test")]
    inputs: Vec<PathBuf>,

    /// Run on the bundled example subjects instead of explicit inputs
    #[arg(long, conflicts_with = "inputs")]
    test: bool,

    /// Directory scanned for sub-* fixtures when --test is given
    #[arg(long, default_value = "data/example_inputs", requires = "test")]
    fixture_dir: PathBuf,

    /// Run step 1: preprocessing and registration
    #[arg(long, visible_alias = "s1")]
    freesurfer: bool,

    /// Run step 2: fiber orientation modeling
    #[arg(long, visible_alias = "s2")]
    bedpostx: bool,

    /// Run step 3: probabilistic tractography
    #[arg(long, visible_alias = "s3")]
    probtrackx: bool,

    /// Run step 2b: alternative tractography pipeline
    #[arg(long, visible_alias = "s2b")]
    mrtrix: bool,

    /// Output root for derivatives and work directories
    #[arg(short, long, default_value = "tracflow_outputs")]
    outputs: PathBuf,

    /// Container image external commands run inside
    #[arg(long, default_value = "image.sif")]
    container: PathBuf,

    /// Tractography samples per voxel
    #[arg(long, default_value_t = 200)]
    sample_count: u32,

    /// Edge list for tractography seeding
    #[arg(long, value_enum, default_value_t = EdgeListArg::Reduced)]
    edgelist: EdgeListArg,

    /// Automatic retries per failed task
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Submit through Slurm
    #[arg(long)]
    slurm: bool,

    /// Submit through Cobalt
    #[arg(long)]
    cobalt: bool,

    /// Submit through Grid Engine
    #[arg(long)]
    grid_engine: bool,

    /// Nodes per scheduler allocation
    #[arg(long, default_value_t = 1)]
    nnodes: usize,

    /// Accounting bank charged for scheduler jobs
    #[arg(long, default_value = "asccasc")]
    bank: String,

    /// Scheduler partition or queue
    #[arg(long, default_value = "pbatch")]
    partition: String,

    /// Wall-clock limit for the allocation, HH:MM:SS
    #[arg(long, default_value = "11:59:00")]
    walltime: String,
}

impl Cli {
    fn phase(&self) -> Phase {
        if self.freesurfer {
            Phase::Freesurfer
        } else if self.bedpostx {
            Phase::Bedpostx
        } else if self.probtrackx {
            Phase::Probtrackx
        } else {
            Phase::Mrtrix
        }
    }

    fn backend(&self) -> Backend {
        let kind = if self.slurm {
            SchedulerKind::Slurm
        } else if self.cobalt {
            SchedulerKind::Cobalt
        } else if self.grid_engine {
            SchedulerKind::GridEngine
        } else {
            return Backend::Local;
        };
        Backend::Batch {
            kind,
            options: SchedulerOptions {
                nodes: self.nnodes,
                bank: self.bank.clone(),
                partition: self.partition.clone(),
                walltime: self.walltime.clone(),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = RunConfig::new(cli.phase(), &cli.outputs)
        .with_container(&cli.container)
        .with_sample_count(cli.sample_count)
        .with_edge_list(cli.edgelist.into())
        .with_retry_limit(cli.retries)
        .with_backend(cli.backend());

    preflight(&config).context("preflight check failed")?;

    let inputs = if cli.test {
        discover_subjects(&cli.fixture_dir).context("could not resolve test fixture inputs")?
    } else {
        cli.inputs.clone()
    };
    let contexts = ContextBuilder::new(&config.output_root)
        .build_all(&inputs)
        .context("could not partition inputs into execution contexts")?;

    let invoker = Arc::new(SingularityInvoker::new(&config.container));
    let registry = Arc::new(StageRegistry::for_phase(&config, invoker));
    let executor: Arc<dyn Executor> = match &config.backend {
        Backend::Local => Arc::new(LocalExecutor::new(config.retry_limit)),
        Backend::Batch { kind, options } => Arc::new(BatchExecutor::new(
            *kind,
            options.clone(),
            config.retry_limit,
            config.output_root.join("batch"),
        )),
    };

    let driver = SchedulerDriver::new(config, registry, executor);
    let report = driver.run(contexts).await.context("run aborted")?;

    for ctx in &report.contexts {
        match ctx.status {
            ContextStatus::Succeeded => {
                println!(
                    "{}: ok ({} task(s), {} pre-satisfied or run)",
                    ctx.context_id, ctx.tasks_total, ctx.tasks_succeeded
                );
            }
            ContextStatus::Failed => {
                let stage = ctx.first_failed_stage.as_deref().unwrap_or("<graph build>");
                println!(
                    "{}: FAILED at stage '{}' ({} failed, {} skipped); see {}",
                    ctx.context_id,
                    stage,
                    ctx.tasks_failed,
                    ctx.tasks_skipped,
                    ctx.log_path.display()
                );
            }
        }
    }

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}
