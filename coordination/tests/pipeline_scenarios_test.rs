//! Integration tests for the heuristic graph and pipeline stepper
//!
//! Drives cases through a file-backed store the way a worker would:
//! run a step, write the artifact, run again.

use rca_coordination::pipeline::heuristics::{INVESTIGATE_LOOP, REASSESS_LOOP};
use rca_coordination::pipeline::{
    CaseState, CaseStore, FileCaseStore, HeuristicGraph, PipelineError, PipelineStepper,
    StepOutcome, StoreHooks, Thresholds,
};
use rca_coordination::{Stage, StageArtifact};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn stepper(dir: &TempDir) -> PipelineStepper {
    PipelineStepper::new(
        Arc::new(HeuristicGraph::default_graph(Thresholds::default())),
        Arc::new(FileCaseStore::new(dir.path())),
    )
}

fn expect_pending(outcome: StepOutcome, stage: Stage) {
    match outcome {
        StepOutcome::Pending(request) => assert_eq!(request.stage, stage),
        StepOutcome::Done(state) => panic!("expected pending {stage}, case done: {}", state.summary()),
    }
}

/// Submit `artifact` for the stage the case waits on and step again
fn answer(s: &PipelineStepper, case_id: &str, stage: Stage, artifact: &str) -> StepOutcome {
    s.submit_artifact(case_id, stage, artifact.as_bytes()).unwrap();
    s.run_step(case_id).unwrap()
}

/// History moves forward except where a loop counter went up
fn assert_history_monotone(state: &CaseState) {
    let mut seen_loops = 0u32;
    for record in &state.history {
        if record.stage.is_backward(record.to_stage) {
            seen_loops += 1;
        }
    }
    let counted: u32 = state.loop_counts.values().sum();
    assert_eq!(seen_loops, counted, "backward moves must match loop counters");
}

/// Test: Recall hit skips Triage through Correlate and adds one history entry
#[test]
fn test_recall_hit_shortcut_scenario() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    expect_pending(s.run_step("case-hit").unwrap(), Stage::Recall);
    let before = s.state("case-hit").unwrap().unwrap().history.len();

    let outcome = answer(&s, "case-hit", Stage::Recall, r#"{"match": true, "confidence": 0.9}"#);
    expect_pending(outcome, Stage::Review);

    let state = s.state("case-hit").unwrap().unwrap();
    assert_eq!(state.history.len(), before + 1);
    let last = state.history.last().unwrap();
    assert_eq!((last.stage, last.to_stage), (Stage::Recall, Stage::Review));
    assert!(!state.path().contains(&Stage::Triage));
}

/// Test: Low convergence loops back once, then routes to Review at the max
#[test]
fn test_investigate_loop_and_exhaustion_scenario() {
    let dir = TempDir::new().unwrap();
    let s = PipelineStepper::new(
        Arc::new(HeuristicGraph::default_graph(Thresholds {
            max_investigate_loops: 1,
            ..Thresholds::default()
        })),
        Arc::new(FileCaseStore::new(dir.path())),
    );
    let case = "case-loop";
    s.run_step(case).unwrap();
    answer(&s, case, Stage::Recall, r#"{"match": false}"#);
    answer(&s, case, Stage::Triage, r#"{"candidate_repos": ["api", "web"]}"#);
    expect_pending(
        answer(&s, case, Stage::Resolve, r#"{"selected_repos": [{"name": "api"}]}"#),
        Stage::Investigate,
    );

    expect_pending(
        answer(&s, case, Stage::Investigate, r#"{"convergence": 0.4}"#),
        Stage::Resolve,
    );
    let state = s.state(case).unwrap().unwrap();
    assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1);
    assert_eq!(state.history.last().unwrap().rule_id, "H10");

    answer(&s, case, Stage::Resolve, r#"{"selected_repos": [{"name": "web"}]}"#);
    expect_pending(
        answer(&s, case, Stage::Investigate, r#"{"convergence": 0.4}"#),
        Stage::Review,
    );
    let state = s.state(case).unwrap().unwrap();
    assert_eq!(state.loop_count(INVESTIGATE_LOOP), 1, "exhausted loop must not increment");
    assert_eq!(state.history.last().unwrap().rule_id, "H11");
    assert_eq!(state.context.get("insufficient_data"), Some(&serde_json::json!(true)));
    assert_history_monotone(&state);
}

/// Test: Reassess loops back once, then escalates straight to Report
#[test]
fn test_reassess_loop_is_bounded() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    let case = "case-reassess";
    s.run_step(case).unwrap();
    answer(&s, case, Stage::Recall, r#"{"match": true, "confidence": 0.99}"#);

    expect_pending(
        answer(&s, case, Stage::Review, r#"{"decision": "reassess", "loop_target": "F1_TRIAGE"}"#),
        Stage::Triage,
    );
    assert_eq!(s.state(case).unwrap().unwrap().loop_count(REASSESS_LOOP), 1);

    // Infra triage shortcuts back to Review.
    answer(&s, case, Stage::Triage, r#"{"symptom_category": "infra"}"#);
    expect_pending(
        answer(&s, case, Stage::Review, r#"{"decision": "reassess"}"#),
        Stage::Report,
    );
    let state = s.state(case).unwrap().unwrap();
    assert_eq!(state.history.last().unwrap().rule_id, "H13x");
    assert_eq!(state.loop_count(REASSESS_LOOP), 1);

    let done = answer(&s, case, Stage::Report, r#"{"summary": "escalated"}"#);
    assert!(matches!(done, StepOutcome::Done(_)));
    assert_history_monotone(&s.state(case).unwrap().unwrap());
}

/// Test: Reassess pointing at Review or later is rejected and cannot wedge the case
#[test]
fn test_reassess_with_forward_loop_target_is_rejected() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    let case = "case-target";
    s.run_step(case).unwrap();
    answer(&s, case, Stage::Recall, r#"{"match": true, "confidence": 0.99}"#);

    for target in ["F5_REVIEW", "F6_REPORT", "DONE", "INIT"] {
        let bytes = format!(r#"{{"decision": "reassess", "loop_target": "{target}"}}"#);
        let err = s.submit_artifact(case, Stage::Review, bytes.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedArtifact { stage: Stage::Review, .. }));
    }
    expect_pending(s.run_step(case).unwrap(), Stage::Review);

    // Written behind the stepper's back, it still fails fast instead of spinning.
    let store = FileCaseStore::new(dir.path());
    std::fs::write(
        store.artifact_path(case, Stage::Review),
        br#"{"decision": "reassess", "loop_target": "F5_REVIEW"}"#,
    )
    .unwrap();
    assert!(matches!(
        s.run_step(case),
        Err(PipelineError::MalformedArtifact { .. })
    ));

    expect_pending(
        answer(&s, case, Stage::Review, r#"{"decision": "reassess", "loop_target": "F2_RESOLVE"}"#),
        Stage::Resolve,
    );
    assert_eq!(s.state(case).unwrap().unwrap().loop_count(REASSESS_LOOP), 1);
}

/// Test: Confident duplicate closes the case at Correlate
#[test]
fn test_duplicate_closes_case() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    let case = "case-dup";
    s.run_step(case).unwrap();
    answer(&s, case, Stage::Recall, r#"{"match": false}"#);
    answer(&s, case, Stage::Triage, r#"{"candidate_repos": ["api"]}"#);
    answer(&s, case, Stage::Investigate, r#"{"convergence_score": 0.8}"#);
    let done = answer(
        &s,
        case,
        Stage::Correlate,
        r#"{"is_duplicate": true, "confidence": 0.9, "linked_rca_id": 12}"#,
    );
    match done {
        StepOutcome::Done(state) => {
            assert_eq!(state.history.last().unwrap().rule_id, "H15");
            assert_eq!(state.context.get("linked_rca_id"), Some(&serde_json::json!(12)));
            assert!(state.context.contains_key("selected_repos"));
        }
        StepOutcome::Pending(r) => panic!("expected done, pending at {}", r.stage),
    }
}

/// Test: Store hooks see each completed stage; failing hooks do not stop the step
#[test]
fn test_store_hooks_called_per_stage() {
    let dir = TempDir::new().unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut hooks = StoreHooks::new();
    for stage in Stage::WORK {
        let seen = seen.clone();
        hooks.register(stage, move |case_id: &str, stage: Stage, _: &StageArtifact| -> anyhow::Result<()> {
            seen.lock().unwrap().push(format!("{case_id}:{}", stage.family()));
            Ok(())
        });
    }
    hooks.register(Stage::Recall, |_: &str, _: Stage, _: &StageArtifact| -> anyhow::Result<()> {
        anyhow::bail!("store unavailable")
    });

    let s = stepper(&dir).with_hooks(hooks);
    s.run_step("c1").unwrap();
    expect_pending(
        answer(&s, "c1", Stage::Recall, r#"{"match": true, "confidence": 0.85}"#),
        Stage::Review,
    );
    assert_eq!(*seen.lock().unwrap(), vec!["c1:recall".to_string()]);
}

/// Test: Malformed artifacts surface as errors and leave state untouched
#[test]
fn test_malformed_artifact_is_hard_error() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    s.run_step("c1").unwrap();
    let err = s
        .submit_artifact("c1", Stage::Recall, br#"{"confidence": "very"}"#)
        .unwrap_err();
    assert!(matches!(err, PipelineError::MalformedArtifact { stage: Stage::Recall, .. }));
    expect_pending(s.run_step("c1").unwrap(), Stage::Recall);

    // An artifact corrupted on disk is not silently treated as missing.
    let store = FileCaseStore::new(dir.path());
    std::fs::write(store.artifact_path("c1", Stage::Recall), b"garbage").unwrap();
    assert!(matches!(
        s.run_step("c1"),
        Err(PipelineError::MalformedArtifact { .. })
    ));
    assert_eq!(store.load_state("c1").unwrap().unwrap().current_stage, Stage::Recall);
}

/// Test: Fallback keeps a case moving when the artifact triggers no rule
#[test]
fn test_fallback_progression_recorded() {
    let dir = TempDir::new().unwrap();
    let s = stepper(&dir);
    s.run_step("c1").unwrap();
    answer(&s, "c1", Stage::Recall, r#"{"match": true, "confidence": 0.1}"#);
    let state = s.state("c1").unwrap().unwrap();
    let last = state.history.last().unwrap();
    assert_eq!(last.rule_id, "FALLBACK");
    assert_eq!(last.to_stage, Stage::Triage);
    assert_eq!(
        last.explanation,
        "fallback: default pipeline progression from F0_RECALL to F1_TRIAGE"
    );
}
