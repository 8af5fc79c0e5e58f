//! Static stage pipeline definitions per phase.

use crate::config::Phase;
use crate::context::ExecutionContext;
use std::path::PathBuf;

/// A file contributing to a stage's input checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumSource {
    /// A file in the context's input directory.
    Input(&'static str),
    /// A file in the context's work directory.
    Work(&'static str),
}

impl ChecksumSource {
    /// Resolves the source against a context.
    #[must_use]
    pub fn resolve(&self, ctx: &ExecutionContext) -> PathBuf {
        match self {
            Self::Input(name) => ctx.input(name),
            Self::Work(name) => ctx.work(name),
        }
    }
}

/// Declares one named stage of a phase: its upstream dependencies, whether
/// it fans out into per-unit tasks, and the files its checksum derives from.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Unique stage name within the phase.
    pub name: &'static str,
    /// Upstream stage names this stage depends on, within the same phase.
    pub dependencies: Vec<&'static str>,
    /// Whether the stage fans out into one task per discovered unit.
    pub fan_out: bool,
    /// Files the stage checksum derives from; upstream stage checksums are
    /// chained in as well, so an upstream change invalidates downstream
    /// checkpoints.
    pub checksum_sources: Vec<ChecksumSource>,
}

impl StageSpec {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            dependencies: Vec::new(),
            fan_out: false,
            checksum_sources: Vec::new(),
        }
    }

    fn depends_on(mut self, deps: &[&'static str]) -> Self {
        self.dependencies = deps.to_vec();
        self
    }

    fn fanned_out(mut self) -> Self {
        self.fan_out = true;
        self
    }

    fn sources(mut self, sources: &[ChecksumSource]) -> Self {
        self.checksum_sources = sources.to_vec();
        self
    }

    /// Resolves the checksum sources against a context.
    #[must_use]
    pub fn resolve_sources(&self, ctx: &ExecutionContext) -> Vec<PathBuf> {
        self.checksum_sources
            .iter()
            .map(|s| s.resolve(ctx))
            .collect()
    }
}

/// The stage pipeline definition for a phase, in dependency order.
#[must_use]
pub fn phase_stages(phase: Phase) -> Vec<StageSpec> {
    use ChecksumSource::{Input, Work};

    match phase {
        Phase::Freesurfer => vec![
            StageSpec::new("split").sources(&[
                Input("bvecs"),
                Input("bvals"),
                Input("anat.nii.gz"),
                Input("hardi.nii.gz"),
            ]),
            StageSpec::new("register")
                .depends_on(&["split"])
                .fanned_out()
                .sources(&[Input("hardi.nii.gz")]),
            StageSpec::new("fit")
                .depends_on(&["register"])
                .sources(&[Input("bvecs"), Input("bvals"), Input("hardi.nii.gz")]),
        ],
        Phase::Bedpostx => vec![StageSpec::new("bedpostx").sources(&[
            Work("data_eddy.nii.gz"),
            Work("data_bet_mask.nii.gz"),
            Input("bvecs"),
            Input("bvals"),
        ])],
        Phase::Probtrackx => vec![StageSpec::new("probtrackx").sources(&[Work(
            "bedpostx_b1000.bedpostX/merged_th1samples.nii.gz",
        )])],
        Phase::Mrtrix => vec![StageSpec::new("mrtrix").sources(&[
            Work("data_eddy.nii.gz"),
            Input("bvecs"),
            Input("bvals"),
        ])],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_phases_reference_known_dependencies() {
        for phase in [
            Phase::Freesurfer,
            Phase::Bedpostx,
            Phase::Probtrackx,
            Phase::Mrtrix,
        ] {
            let stages = phase_stages(phase);
            let names: Vec<&str> = stages.iter().map(|s| s.name).collect();
            for stage in &stages {
                assert!(!stage.dependencies.contains(&stage.name), "self-dependency");
                for dep in &stage.dependencies {
                    assert!(names.contains(dep), "unknown dependency {dep}");
                }
            }
        }
    }

    #[test]
    fn test_dependencies_declared_upstream_only() {
        // Declaration order is dependency order; a stage may only depend on
        // stages declared before it.
        for phase in [Phase::Freesurfer, Phase::Bedpostx, Phase::Probtrackx, Phase::Mrtrix] {
            let stages = phase_stages(phase);
            for (i, stage) in stages.iter().enumerate() {
                for dep in &stage.dependencies {
                    let dep_pos = stages.iter().position(|s| s.name == *dep).unwrap();
                    assert!(dep_pos < i);
                }
            }
        }
    }

    #[test]
    fn test_freesurfer_fan_out_boundary() {
        let stages = phase_stages(Phase::Freesurfer);
        let register = stages.iter().find(|s| s.name == "register").unwrap();
        assert!(register.fan_out);
        assert_eq!(register.dependencies, vec!["split"]);

        let fit = stages.iter().find(|s| s.name == "fit").unwrap();
        assert!(!fit.fan_out);
        assert_eq!(fit.dependencies, vec!["register"]);
    }

    #[test]
    fn test_source_resolution() {
        let ctx = ExecutionContext::new("sub-01", "/data/sub-01", "/out/derivatives/sub-01");
        assert_eq!(
            ChecksumSource::Input("bvals").resolve(&ctx),
            PathBuf::from("/data/sub-01/bvals")
        );
        assert_eq!(
            ChecksumSource::Work("data_eddy.nii.gz").resolve(&ctx),
            PathBuf::from("/out/derivatives/sub-01/work_dir/data_eddy.nii.gz")
        );
    }
}
