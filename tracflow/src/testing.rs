//! Shared test doubles and fixtures.

use crate::context::ExecutionContext;
use crate::errors::{Result, TracflowError};
use crate::invoker::{InvocationOutput, ToolInvoker};
use crate::stages::TaskRunner;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
struct StdoutRule {
    pattern: String,
    stdout: String,
}

#[derive(Debug)]
struct FailRule {
    pattern: String,
    /// `None` fails every matching invocation.
    remaining: Option<u32>,
}

#[derive(Debug)]
struct TouchRule {
    pattern: String,
    /// Paths relative to the context work directory.
    outputs: Vec<String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    invocations: Vec<String>,
    stdout_rules: Vec<StdoutRule>,
    fail_rules: Vec<FailRule>,
    touch_rules: Vec<TouchRule>,
}

/// A scripted [`ToolInvoker`] that records commands instead of running them.
///
/// Rules match on a command substring. By default every command exits zero
/// with empty stdout.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    state: Mutex<ScriptState>,
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the given stdout for commands containing `pattern`.
    pub fn with_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.state.lock().stdout_rules.push(StdoutRule {
            pattern: pattern.to_string(),
            stdout: stdout.to_string(),
        });
        self
    }

    /// Makes every command containing `pattern` exit nonzero.
    pub fn fail_always(self, pattern: &str) -> Self {
        self.state.lock().fail_rules.push(FailRule {
            pattern: pattern.to_string(),
            remaining: None,
        });
        self
    }

    /// Makes the first `count` commands containing `pattern` exit nonzero.
    pub fn fail_times(self, pattern: &str, count: u32) -> Self {
        self.state.lock().fail_rules.push(FailRule {
            pattern: pattern.to_string(),
            remaining: Some(count),
        });
        self
    }

    /// Creates the given work-relative files when a command containing
    /// `pattern` succeeds.
    pub fn touch_on(self, pattern: &str, outputs: &[&str]) -> Self {
        self.state.lock().touch_rules.push(TouchRule {
            pattern: pattern.to_string(),
            outputs: outputs.iter().map(ToString::to_string).collect(),
        });
        self
    }

    /// All commands invoked so far, in order.
    pub fn invocations(&self) -> Vec<String> {
        self.state.lock().invocations.clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.state.lock().invocations.len()
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, ctx: &ExecutionContext, command: &str) -> Result<InvocationOutput> {
        let mut state = self.state.lock();
        state.invocations.push(command.to_string());

        let stdout = state
            .stdout_rules
            .iter()
            .find(|rule| command.contains(&rule.pattern))
            .map(|rule| rule.stdout.clone())
            .unwrap_or_default();

        let mut failed = false;
        for rule in &mut state.fail_rules {
            if !command.contains(&rule.pattern) {
                continue;
            }
            match &mut rule.remaining {
                None => failed = true,
                Some(0) => {}
                Some(remaining) => {
                    *remaining -= 1;
                    failed = true;
                }
            }
        }

        if !failed {
            for rule in &state.touch_rules {
                if !command.contains(&rule.pattern) {
                    continue;
                }
                for output in &rule.outputs {
                    let path = ctx.work(output);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&path, b"scripted")?;
                }
            }
        }

        Ok(InvocationOutput {
            stdout,
            exit_code: Some(i32::from(failed)),
        })
    }
}

/// Creates a subject input directory with the expected files and returns a
/// ready context for it.
pub fn fixture_subject(root: &Path, subject: &str) -> ExecutionContext {
    let input = root.join("input").join(subject);
    std::fs::create_dir_all(&input).unwrap();
    for name in ["bvecs", "bvals", "anat.nii.gz", "hardi.nii.gz"] {
        std::fs::write(input.join(name), format!("{subject}:{name}")).unwrap();
    }

    let ctx = ExecutionContext::new(
        subject,
        &input,
        root.join("out/derivatives").join(subject),
    );
    ctx.ensure_directories().unwrap();
    ctx
}

/// A scripted invoker wired for a two-frame preprocessing run: every stage
/// command produces the outputs its runner checks for.
pub fn freesurfer_invoker() -> ScriptedInvoker {
    ScriptedInvoker::new()
        .with_stdout("fslinfo", "dim4           2\n")
        .touch_on("fslroi", &["data_eddy_ref.nii.gz"])
        .touch_on(
            "fslsplit",
            &["data_eddy_tmp0000.nii.gz", "data_eddy_tmp0001.nii.gz"],
        )
        .touch_on("fslmerge", &["data_eddy.nii.gz"])
        .touch_on("bet ", &["data_bet.nii.gz", "data_bet_mask.nii.gz"])
        .touch_on(
            "dtifit",
            &[
                "DTIparams_FA.nii.gz",
                "DTIparams_L1.nii.gz",
                "DTIparams_L2.nii.gz",
                "DTIparams_L3.nii.gz",
            ],
        )
}

/// A runner that fails a fixed number of times before succeeding.
#[derive(Debug)]
pub struct FlakyRunner {
    stage: &'static str,
    failures_before_success: u32,
    attempts: AtomicU32,
}

impl FlakyRunner {
    pub fn new(stage: &'static str, failures_before_success: u32) -> Self {
        Self {
            stage,
            failures_before_success,
            attempts: AtomicU32::new(0),
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for FlakyRunner {
    fn stage(&self) -> &str {
        self.stage
    }

    async fn run(&self, ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures_before_success {
            return Err(TracflowError::task_execution(
                format!("{}:{}", ctx.id, self.stage),
                1,
                "scripted failure",
            ));
        }
        Ok(())
    }
}

/// A runner that succeeds and counts its runs.
#[derive(Debug)]
pub struct CountingRunner {
    stage: &'static str,
    runs: AtomicU32,
}

impl CountingRunner {
    pub fn new(stage: &'static str) -> Self {
        Self {
            stage,
            runs: AtomicU32::new(0),
        }
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for CountingRunner {
    fn stage(&self) -> &str {
        self.stage
    }

    async fn run(&self, _ctx: &ExecutionContext, _unit: Option<usize>) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
