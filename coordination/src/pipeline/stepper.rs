//! Pipeline Stepper
//!
//! Drives one case through the heuristic graph.
//!
//! `run_step` is re-entrant: state is reloaded before every mutation, so a
//! failed or interrupted step can simply be retried.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::artifact::StageArtifact;
use super::error::{PipelineError, PipelineResult};
use super::heuristics::HeuristicGraph;
use super::hooks::StoreHooks;
use super::stage::Stage;
use super::state::{CaseState, CaseStatus};
use super::store::SharedCaseStore;
use crate::dispatch::DispatchRequest;

/// Rule id recorded for the Init → Recall transition
pub const START_RULE_ID: &str = "START";

/// Stepper behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// Stages whose artifact is fabricated in-process instead of dispatched
    pub deterministic_stages: HashSet<Stage>,
    /// Upper bound on transitions within a single `run_step`
    pub max_transitions_per_step: usize,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            deterministic_stages: HashSet::new(),
            max_transitions_per_step: 64,
        }
    }
}

/// Result of one `run_step`
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The case reached Done
    Done(CaseState),
    /// The case is paused waiting on this request
    Pending(DispatchRequest),
}

pub struct PipelineStepper {
    graph: Arc<HeuristicGraph>,
    store: SharedCaseStore,
    hooks: StoreHooks,
    config: StepperConfig,
}

impl PipelineStepper {
    pub fn new(graph: Arc<HeuristicGraph>, store: SharedCaseStore) -> Self {
        Self {
            graph,
            store,
            hooks: StoreHooks::new(),
            config: StepperConfig::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: StoreHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_config(mut self, config: StepperConfig) -> Self {
        self.config = config;
        self
    }

    pub fn graph(&self) -> &HeuristicGraph {
        &self.graph
    }

    pub fn store(&self) -> &SharedCaseStore {
        &self.store
    }

    pub fn is_deterministic(&self, stage: Stage) -> bool {
        self.config.deterministic_stages.contains(&stage)
    }

    /// Current persisted state of a case, if it has been started
    pub fn state(&self, case_id: &str) -> PipelineResult<Option<CaseState>> {
        self.store.load_state(case_id)
    }

    /// Advance a case as far as the artifacts on hand allow.
    pub fn run_step(&self, case_id: &str) -> PipelineResult<StepOutcome> {
        let mut state = match self.store.load_state(case_id)? {
            Some(state) => state,
            None => {
                debug!(case_id, "Initializing case state");
                CaseState::new(case_id)
            }
        };

        if state.is_done() {
            return Ok(StepOutcome::Done(state));
        }

        self.remove_stale_artifacts(&mut state)?;

        state.status = CaseStatus::Running;
        if state.current_stage == Stage::Init {
            state.advance(Stage::Recall, START_RULE_ID, "start pipeline");
            self.store.save_state(&state)?;
        }

        let mut transitions = 0usize;
        while let Some(artifact) = self.current_artifact(&state)? {
            transitions += 1;
            if transitions > self.config.max_transitions_per_step {
                return Err(PipelineError::RunawayCase {
                    case_id: case_id.to_string(),
                    limit: self.config.max_transitions_per_step,
                });
            }

            let stage = state.current_stage;
            let decision = self.graph.evaluate(stage, &artifact, &state);
            let next = decision.action.next_stage;

            if stage.is_backward(next) {
                let key = decision
                    .loop_key
                    .clone()
                    .unwrap_or_else(|| stage.family().to_string());
                let count = state.increment_loop(&key);
                info!(case_id, stage = %stage, next = %next, loop_key = %key, count, "Looping back");
                // Artifacts from the abandoned attempt must be produced again.
                // They are removed only once the move itself is persisted.
                state.stale_artifacts = Stage::WORK
                    .into_iter()
                    .filter(|s| *s >= next && *s <= stage)
                    .collect();
            }

            self.hooks.apply(case_id, stage, &artifact);

            state.merge_context(&decision.action.context_additions);
            state.advance(next, &decision.rule_id, &decision.action.explanation);
            self.store.save_state(&state)?;
            self.remove_stale_artifacts(&mut state)?;

            if state.is_done() {
                info!(case_id, summary = %state.summary(), "Case complete");
                return Ok(StepOutcome::Done(state));
            }
        }

        state.status = CaseStatus::Paused;
        self.store.save_state(&state)?;
        debug!(case_id, stage = %state.current_stage, "Case paused awaiting artifact");
        Ok(StepOutcome::Pending(self.build_request(&state)))
    }

    /// Finish an invalidation recorded by a backward move.
    ///
    /// Safe to repeat: removing an absent artifact succeeds.
    fn remove_stale_artifacts(&self, state: &mut CaseState) -> PipelineResult<()> {
        if state.stale_artifacts.is_empty() {
            return Ok(());
        }
        for stage in &state.stale_artifacts {
            self.store.remove_artifact(&state.case_id, *stage)?;
        }
        debug!(case_id = %state.case_id, stages = ?state.stale_artifacts, "Stale artifacts removed");
        state.stale_artifacts.clear();
        self.store.save_state(state)
    }

    /// Record a worker's artifact for the stage the case is waiting on.
    ///
    /// Malformed bytes are rejected rather than treated as missing, so the
    /// worker learns its result was not accepted.
    pub fn submit_artifact(&self, case_id: &str, stage: Stage, bytes: &[u8]) -> PipelineResult<()> {
        let state = self.store.load_state(case_id)?;
        let current = state.as_ref().map(|s| s.current_stage).unwrap_or(Stage::Init);
        if current != stage {
            return Err(PipelineError::StageMismatch {
                case_id: case_id.to_string(),
                current,
                submitted: stage,
            });
        }

        StageArtifact::parse(stage, bytes)
            .map_err(|message| PipelineError::malformed(case_id, stage, message))?;
        // A pending invalidation must not later delete the fresh artifact.
        if let Some(mut state) = state {
            self.remove_stale_artifacts(&mut state)?;
        }
        self.store.save_artifact(case_id, stage, bytes)?;
        debug!(case_id, stage = %stage, bytes = bytes.len(), "Artifact recorded");
        Ok(())
    }

    /// Artifact for the current stage, if one is available.
    fn current_artifact(&self, state: &CaseState) -> PipelineResult<Option<StageArtifact>> {
        let stage = state.current_stage;
        let stored = self.store.load_artifact(&state.case_id, stage)?;

        if self.is_deterministic(stage) {
            // Unreadable output from a deterministic stage counts as not produced yet.
            if let Some(bytes) = &stored {
                match StageArtifact::parse(stage, bytes) {
                    Ok(artifact) => return Ok(Some(artifact)),
                    Err(e) => {
                        warn!(case_id = %state.case_id, stage = %stage, error = %e, "Discarding unparseable deterministic artifact")
                    }
                }
            }
            return Ok(Some(StageArtifact::empty(stage)));
        }

        match stored {
            None => Ok(None),
            Some(bytes) => StageArtifact::parse(stage, &bytes)
                .map(Some)
                .map_err(|message| PipelineError::malformed(&state.case_id, stage, message)),
        }
    }

    fn build_request(&self, state: &CaseState) -> DispatchRequest {
        let payload = serde_json::json!({
            "case_id": state.case_id,
            "stage": state.current_stage,
            "loop_counts": state.loop_counts,
            "context": state.context,
            "history_len": state.history.len(),
        });
        DispatchRequest::new(&state.case_id, state.current_stage, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::heuristics::{Thresholds, INVESTIGATE_LOOP};
    use crate::pipeline::store::{CaseStore, MemoryCaseStore};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn stepper() -> PipelineStepper {
        PipelineStepper::new(
            Arc::new(HeuristicGraph::default_graph(Thresholds::default())),
            MemoryCaseStore::new().shared(),
        )
    }

    fn pending_stage(outcome: StepOutcome) -> Stage {
        match outcome {
            StepOutcome::Pending(req) => req.stage,
            StepOutcome::Done(s) => panic!("unexpected completion: {}", s.summary()),
        }
    }

    #[test]
    fn test_first_step_requests_recall() {
        let s = stepper();
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Recall);
        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.status, CaseStatus::Paused);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.history[0].rule_id, START_RULE_ID);
    }

    #[test]
    fn test_run_step_is_reentrant_without_artifact() {
        let s = stepper();
        s.run_step("c1").unwrap();
        s.run_step("c1").unwrap();
        assert_eq!(s.state("c1").unwrap().unwrap().history.len(), 1);
    }

    #[test]
    fn test_recall_hit_routes_to_review_with_one_history_entry() {
        let s = stepper();
        s.run_step("c1").unwrap();
        let before = s.state("c1").unwrap().unwrap().history.len();

        s.submit_artifact("c1", Stage::Recall, br#"{"match": true, "confidence": 0.9}"#)
            .unwrap();
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Review);

        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.history.len(), before + 1);
        assert_eq!(state.history.last().unwrap().rule_id, "H1");
    }

    #[test]
    fn test_submit_rejects_malformed_and_mismatched_stage() {
        let s = stepper();
        s.run_step("c1").unwrap();
        let err = s.submit_artifact("c1", Stage::Recall, b"{not json").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedArtifact { .. }));
        let err = s.submit_artifact("c1", Stage::Triage, b"{}").unwrap_err();
        assert!(matches!(err, PipelineError::StageMismatch { .. }));
        assert!(s.store().load_artifact("c1", Stage::Recall).unwrap().is_none());
    }

    #[test]
    fn test_deterministic_stages_run_in_process() {
        let config = StepperConfig {
            deterministic_stages: [Stage::Recall, Stage::Triage].into_iter().collect(),
            ..Default::default()
        };
        let s = stepper().with_config(config);
        // Empty recall is a miss (H2), empty triage has no repos (H6 → Resolve).
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Resolve);
    }

    #[test]
    fn test_investigate_loop_increments_and_clears_artifacts() {
        let s = stepper();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Recall, br#"{"match": false}"#).unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Triage, br#"{"candidate_repos": ["a", "b"]}"#)
            .unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Resolve, br#"{"selected_repos": [{"name": "a"}]}"#)
            .unwrap();
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Investigate);

        s.submit_artifact("c1", Stage::Investigate, br#"{"convergence": 0.4}"#)
            .unwrap();
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Resolve);

        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1);
        assert!(s.store().load_artifact("c1", Stage::Resolve).unwrap().is_none());
        assert!(s.store().load_artifact("c1", Stage::Investigate).unwrap().is_none());
    }

    /// Memory store whose writes can be made to fail on demand
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryCaseStore,
        fail_save: AtomicBool,
        fail_remove: AtomicBool,
    }

    impl CaseStore for FlakyStore {
        fn load_state(&self, case_id: &str) -> PipelineResult<Option<CaseState>> {
            self.inner.load_state(case_id)
        }

        fn save_state(&self, state: &CaseState) -> PipelineResult<()> {
            if self.fail_save.load(Ordering::SeqCst) {
                return Err(PipelineError::persistence(
                    &state.case_id,
                    "state.json",
                    std::io::Error::other("disk full"),
                ));
            }
            self.inner.save_state(state)
        }

        fn load_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<Option<Vec<u8>>> {
            self.inner.load_artifact(case_id, stage)
        }

        fn save_artifact(&self, case_id: &str, stage: Stage, bytes: &[u8]) -> PipelineResult<()> {
            self.inner.save_artifact(case_id, stage, bytes)
        }

        fn remove_artifact(&self, case_id: &str, stage: Stage) -> PipelineResult<()> {
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(PipelineError::persistence(
                    case_id,
                    stage.family(),
                    std::io::Error::other("read-only"),
                ));
            }
            self.inner.remove_artifact(case_id, stage)
        }
    }

    /// Case waiting on a low-convergence Investigate artifact
    fn flaky_case_at_investigate() -> (PipelineStepper, Arc<FlakyStore>) {
        let store = Arc::new(FlakyStore::default());
        let s = PipelineStepper::new(
            Arc::new(HeuristicGraph::default_graph(Thresholds::default())),
            store.clone(),
        );
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Recall, br#"{"match": false}"#).unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Triage, br#"{"candidate_repos": ["a", "b"]}"#)
            .unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Resolve, br#"{"selected_repos": [{"name": "a"}]}"#)
            .unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Investigate, br#"{"convergence": 0.4}"#)
            .unwrap();
        (s, store)
    }

    #[test]
    fn test_failed_save_on_loop_keeps_artifacts() {
        let (s, store) = flaky_case_at_investigate();
        store.fail_save.store(true, Ordering::SeqCst);
        assert!(s.run_step("c1").is_err());

        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::Investigate);
        assert_eq!(state.loop_count(INVESTIGATE_LOOP), 0);
        assert!(s.store().load_artifact("c1", Stage::Investigate).unwrap().is_some());
        assert!(s.store().load_artifact("c1", Stage::Resolve).unwrap().is_some());

        store.fail_save.store(false, Ordering::SeqCst);
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Resolve);
        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1);
        assert!(state.stale_artifacts.is_empty());
        assert!(s.store().load_artifact("c1", Stage::Investigate).unwrap().is_none());
    }

    #[test]
    fn test_interrupted_invalidation_completes_on_retry() {
        let (s, store) = flaky_case_at_investigate();
        store.fail_remove.store(true, Ordering::SeqCst);
        assert!(s.run_step("c1").is_err());

        // The move is persisted, the old Resolve artifact is marked stale.
        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::Resolve);
        assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1);
        assert_eq!(state.stale_artifacts, vec![Stage::Resolve, Stage::Investigate]);

        store.fail_remove.store(false, Ordering::SeqCst);
        assert_eq!(pending_stage(s.run_step("c1").unwrap()), Stage::Resolve);
        let state = s.state("c1").unwrap().unwrap();
        assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1);
        assert!(state.stale_artifacts.is_empty());
        assert!(s.store().load_artifact("c1", Stage::Resolve).unwrap().is_none());
    }

    #[test]
    fn test_done_case_returns_immediately() {
        let s = stepper();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Recall, br#"{"match": true, "confidence": 0.95}"#)
            .unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Review, br#"{"decision": "approve"}"#).unwrap();
        s.run_step("c1").unwrap();
        s.submit_artifact("c1", Stage::Report, br#"{"summary": "ok"}"#).unwrap();
        let done = s.run_step("c1").unwrap();
        assert!(matches!(done, StepOutcome::Done(_)));

        let again = s.run_step("c1").unwrap();
        match again {
            StepOutcome::Done(state) => {
                assert_eq!(state.current_stage, Stage::Done);
                assert_eq!(state.history.last().unwrap().rule_id, "FALLBACK");
            }
            StepOutcome::Pending(_) => panic!("done case should not pause"),
        }
    }
}
