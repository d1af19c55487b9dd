//! Integration tests for session supervision
//!
//! Workers interact with a running session only through `pull_next` and
//! `submit`, the same surface an external agent uses.

use rca_coordination::pipeline::{HeuristicGraph, MemoryCaseStore, PipelineStepper, Thresholds};
use rca_coordination::session::{NextStep, Session, SessionConfig, SessionError, SessionStatus};
use rca_coordination::{IssuedRequest, SessionRegistry, Stage};
use std::sync::Arc;
use std::time::Duration;

fn stepper() -> Arc<PipelineStepper> {
    Arc::new(PipelineStepper::new(
        Arc::new(HeuristicGraph::default_graph(Thresholds::default())),
        MemoryCaseStore::new().shared(),
    ))
}

fn cases(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("case-{i}")).collect()
}

/// Canned artifact for the requested stage, fenced the way LLM output often is
fn answer(issued: &IssuedRequest) -> String {
    let body = match issued.request.stage {
        Stage::Recall => r#"{"match": true, "confidence": 0.9}"#,
        Stage::Review => r#"{"decision": "approve"}"#,
        _ => r#"{"summary": "done"}"#,
    };
    format!("```json\n{body}\n```")
}

/// Pull and answer steps until the session reports Done
async fn work(session: Arc<Session>) -> usize {
    let mut answered = 0;
    loop {
        match session.pull_next(Duration::from_millis(200)).await.unwrap() {
            NextStep::Step(issued) => {
                session.submit(issued.dispatch_id, &answer(&issued)).unwrap();
                answered += 1;
            }
            NextStep::Unavailable => continue,
            NextStep::Done => return answered,
        }
    }
}

/// Test: Two workers drive three cases to completion through the session
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_runs_cases_to_done() {
    let session = Session::start(
        cases(3),
        stepper(),
        SessionConfig {
            parallel_cases: 3,
            ..Default::default()
        },
    );
    let workers: Vec<_> = (0..2).map(|_| tokio::spawn(work(session.clone()))).collect();

    let mut answered = 0;
    for w in workers {
        answered += w.await.unwrap();
    }
    // Recall, Review, Report for each case.
    assert_eq!(answered, 9);

    let report = session.wait(Duration::from_secs(5)).await;
    assert_eq!(report.status, SessionStatus::Done);
    let run = report.report.unwrap();
    assert_eq!(run.completed(), 3);
    assert_eq!(session.bus().count("artifact_submitted"), 9);
    assert_eq!(session.bus().count("pipeline_done"), 1);
}

/// Test: Capacity gate holds submissions until the pool shows enough concurrency
#[tokio::test]
async fn test_capacity_gate_blocks_until_exempt() {
    let session = Session::start(
        cases(1),
        stepper(),
        SessionConfig {
            desired_capacity: 2,
            ..Default::default()
        },
    );

    let issued = match session.pull_next(Duration::from_secs(2)).await.unwrap() {
        NextStep::Step(issued) => issued,
        other => panic!("expected a step, got {other:?}"),
    };
    let err = session.submit(issued.dispatch_id, &answer(&issued)).unwrap_err();
    assert!(matches!(err, SessionError::CapacityGate { desired: 2, .. }));
    assert!(err.is_recoverable());

    // Nothing else to pull: the pool cannot grow, so the gate opens.
    assert_eq!(
        session.pull_next(Duration::from_millis(50)).await.unwrap(),
        NextStep::Unavailable
    );
    session.submit(issued.dispatch_id, &answer(&issued)).unwrap();
    session.cancel();
}

/// Test: A step whose dispatch timed out stops counting toward the capacity gate
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timed_out_step_is_released_from_gate() {
    let session = Session::start(
        cases(2),
        stepper(),
        SessionConfig {
            desired_capacity: 2,
            parallel_cases: 1,
            dispatch_timeout_ms: Some(100),
            ..Default::default()
        },
    );

    let abandoned = match session.pull_next(Duration::from_secs(2)).await.unwrap() {
        NextStep::Step(issued) => issued,
        other => panic!("expected a step, got {other:?}"),
    };
    assert_eq!(session.in_flight(), 1);

    // Never answered: the broker gives up and the driver moves to the next case.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!session.mux().is_pending(abandoned.dispatch_id));
    assert_eq!(session.in_flight(), 0);

    let next = match session.pull_next(Duration::from_secs(2)).await.unwrap() {
        NextStep::Step(issued) => issued,
        other => panic!("expected a step, got {other:?}"),
    };
    assert_ne!(next.request.case_id, abandoned.request.case_id);
    assert_eq!(session.in_flight(), 1);

    // Only one step has ever been outstanding at a time, so the gate stays shut.
    assert!(matches!(
        session.submit(next.dispatch_id, &answer(&next)),
        Err(SessionError::CapacityGate { .. })
    ));
    session.cancel();
}

/// Test: Invalid artifacts are rejected without consuming the dispatch
#[tokio::test]
async fn test_invalid_artifact_keeps_slot_open() {
    let session = Session::start(cases(1), stepper(), SessionConfig::default());
    let issued = match session.pull_next(Duration::from_secs(2)).await.unwrap() {
        NextStep::Step(issued) => issued,
        other => panic!("expected a step, got {other:?}"),
    };
    assert_eq!(issued.request.stage, Stage::Recall);

    assert!(matches!(
        session.submit(issued.dispatch_id, "definitely not json"),
        Err(SessionError::InvalidArtifact { .. })
    ));
    assert!(matches!(
        session.submit(issued.dispatch_id, r#"{"confidence": "high"}"#),
        Err(SessionError::InvalidArtifact { .. })
    ));
    assert!(session.mux().is_pending(issued.dispatch_id));

    session.submit(issued.dispatch_id, r#"{"match": false}"#).unwrap();
    assert!(matches!(
        session.submit(issued.dispatch_id, r#"{"match": false}"#),
        Err(SessionError::Dispatch(_))
    ));
    session.cancel();
}

/// Test: An idle session is aborted by the TTL watchdog
#[tokio::test]
async fn test_ttl_watchdog_aborts_idle_session() {
    let session = Session::start(
        cases(1),
        stepper(),
        SessionConfig {
            ttl_ms: Some(100),
            ..Default::default()
        },
    );

    let report = session.wait(Duration::from_secs(5)).await;
    assert_eq!(report.status, SessionStatus::Error);
    assert!(report.error.unwrap().contains("session TTL expired"));
    assert_eq!(session.bus().count("session_error"), 1);
    assert!(session.mux().is_aborted());

    let run = report.report.unwrap();
    assert_eq!(run.failed(), 1);
    assert!(matches!(
        session.pull_next(Duration::from_millis(10)).await,
        Err(SessionError::Aborted(_))
    ));
}

/// Test: Worker registrations are tallied by mode
#[tokio::test]
async fn test_worker_registration() {
    let session = Session::start(cases(1), stepper(), SessionConfig::default());
    session.register_worker("w1", "stream");
    session.register_worker("w2", "stream");
    session.register_worker("w3", "batch");
    let modes = session.worker_modes();
    assert_eq!(modes.get("stream"), Some(&2));
    assert_eq!(modes.get("batch"), Some(&1));
    assert_eq!(session.bus().count("worker_started"), 3);
    session.cancel();
}

/// Test: Only one running session at a time; lookups check the id
#[tokio::test]
async fn test_registry_single_running_session() {
    let registry = SessionRegistry::new();
    let session = registry
        .start(cases(1), stepper(), SessionConfig::default())
        .unwrap();
    assert!(matches!(
        registry.start(cases(1), stepper(), SessionConfig::default()),
        Err(SessionError::AlreadyRunning(_))
    ));
    assert!(registry.get(session.id()).is_ok());
    assert!(matches!(
        registry.get("not-a-session"),
        Err(SessionError::NotFound(_))
    ));
    session.cancel();
}
