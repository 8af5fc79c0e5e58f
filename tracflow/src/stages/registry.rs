//! Stage name to runner lookup.

use super::runners::{
    BedpostxRunner, FitRunner, MrtrixRunner, ProbtrackxRunner, RegisterRunner, SplitRunner,
};
use super::TaskRunner;
use crate::config::{Phase, RunConfig};
use crate::invoker::ToolInvoker;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps stage names to their runners for one run.
///
/// Built once at run start from the selected phase; the executor resolves
/// every task's runner through it.
#[derive(Debug, Default)]
pub struct StageRegistry {
    runners: HashMap<String, Arc<dyn TaskRunner>>,
}

impl StageRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a runner under its stage name, replacing any previous one.
    pub fn register(&mut self, runner: Arc<dyn TaskRunner>) {
        self.runners.insert(runner.stage().to_string(), runner);
    }

    /// Looks up the runner for a stage.
    #[must_use]
    pub fn get(&self, stage: &str) -> Option<Arc<dyn TaskRunner>> {
        self.runners.get(stage).cloned()
    }

    /// Builds the registry for the configured phase.
    #[must_use]
    pub fn for_phase(config: &RunConfig, invoker: Arc<dyn ToolInvoker>) -> Self {
        let mut registry = Self::new();
        match config.phase {
            Phase::Freesurfer => {
                registry.register(Arc::new(SplitRunner::new(invoker.clone())));
                registry.register(Arc::new(RegisterRunner::new(invoker.clone())));
                registry.register(Arc::new(FitRunner::new(invoker)));
            }
            Phase::Bedpostx => {
                registry.register(Arc::new(BedpostxRunner::new(invoker)));
            }
            Phase::Probtrackx => {
                registry.register(Arc::new(ProbtrackxRunner::new(invoker, config)));
            }
            Phase::Mrtrix => {
                registry.register(Arc::new(MrtrixRunner::new(invoker)));
            }
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::phase_stages;
    use crate::testing::ScriptedInvoker;

    #[test]
    fn test_registry_covers_every_stage_of_each_phase() {
        for phase in [
            Phase::Freesurfer,
            Phase::Bedpostx,
            Phase::Probtrackx,
            Phase::Mrtrix,
        ] {
            let config = RunConfig::new(phase, "/out");
            let registry =
                StageRegistry::for_phase(&config, Arc::new(ScriptedInvoker::new()));
            for stage in phase_stages(phase) {
                let runner = registry.get(stage.name);
                assert!(runner.is_some(), "no runner for stage {}", stage.name);
                assert_eq!(runner.unwrap().stage(), stage.name);
            }
        }
    }

    #[test]
    fn test_unknown_stage_is_none() {
        let config = RunConfig::new(Phase::Bedpostx, "/out");
        let registry = StageRegistry::for_phase(&config, Arc::new(ScriptedInvoker::new()));
        assert!(registry.get("split").is_none());
    }
}
