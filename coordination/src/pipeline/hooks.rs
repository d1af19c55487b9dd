//! Store side-effect hooks
//!
//! The persistence store (cases, symptoms, RCAs) lives outside the engine.
//! The stepper hands each completed artifact to the hooks registered for
//! its stage family; hooks never see or mutate case state.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::artifact::StageArtifact;
use super::stage::Stage;

/// A side effect applied after a stage completes
pub trait StoreEffect: Send + Sync {
    fn apply(&self, case_id: &str, stage: Stage, artifact: &StageArtifact) -> anyhow::Result<()>;
}

impl<F> StoreEffect for F
where
    F: Fn(&str, Stage, &StageArtifact) -> anyhow::Result<()> + Send + Sync,
{
    fn apply(&self, case_id: &str, stage: Stage, artifact: &StageArtifact) -> anyhow::Result<()> {
        self(case_id, stage, artifact)
    }
}

/// Hook registry keyed by `store.<family>`
#[derive(Default, Clone)]
pub struct StoreHooks {
    hooks: HashMap<String, Vec<Arc<dyn StoreEffect>>>,
}

impl StoreHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hook name for a stage, e.g. `store.investigate`
    pub fn hook_name(stage: Stage) -> String {
        format!("store.{}", stage.family())
    }

    pub fn register(&mut self, stage: Stage, hook: impl StoreEffect + 'static) {
        self.hooks
            .entry(Self::hook_name(stage))
            .or_default()
            .push(Arc::new(hook));
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook for `stage`. Failures are logged, never propagated.
    ///
    /// Returns the number of hooks that failed.
    pub fn apply(&self, case_id: &str, stage: Stage, artifact: &StageArtifact) -> usize {
        let name = Self::hook_name(stage);
        let Some(hooks) = self.hooks.get(&name) else {
            return 0;
        };
        let mut failures = 0;
        for hook in hooks {
            match hook.apply(case_id, stage, artifact) {
                Ok(()) => debug!(case_id, hook = %name, "Store hook applied"),
                Err(e) => {
                    failures += 1;
                    warn!(case_id, hook = %name, error = %e, "Store hook failed");
                }
            }
        }
        failures
    }
}
