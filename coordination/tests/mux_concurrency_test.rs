//! Integration tests for the MuxDispatcher
//!
//! Exercises routing under concurrency: many dispatches outstanding at
//! once, results submitted out of order, duplicate and unknown submits,
//! and abort while callers are blocked.

use rca_coordination::dispatch::{DispatchError, DispatchRequest, Dispatcher, MuxDispatcher};
use rca_coordination::Stage;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn request(i: usize) -> DispatchRequest {
    DispatchRequest::new(&format!("case-{i}"), Stage::Investigate, json!({ "n": i }))
}

/// Spawn `n` dispatches and pull all of them
async fn dispatch_and_pull(
    mux: &Arc<MuxDispatcher>,
    n: usize,
) -> (
    Vec<tokio::task::JoinHandle<(usize, Result<Vec<u8>, DispatchError>)>>,
    Vec<rca_coordination::IssuedRequest>,
) {
    let handles = (0..n)
        .map(|i| {
            let m = mux.clone();
            tokio::spawn(async move { (i, m.dispatch(request(i)).await) })
        })
        .collect();
    let mut pulled = Vec::new();
    for _ in 0..n {
        pulled.push(mux.pull().await.unwrap());
    }
    (handles, pulled)
}

/// Test: Results submitted in reverse pull order still reach their own callers
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reverse_order_submit_routes_by_id() {
    let mux = MuxDispatcher::default().shared();
    let (handles, pulled) = dispatch_and_pull(&mux, 16).await;
    assert_eq!(mux.pending_count(), 16);

    for issued in pulled.iter().rev() {
        let body = serde_json::to_vec(&json!({ "case": issued.request.case_id })).unwrap();
        mux.submit(issued.dispatch_id, body).unwrap();
    }

    for handle in handles {
        let (i, result) = handle.await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&result.unwrap()).unwrap();
        assert_eq!(value["case"], format!("case-{i}"), "result routed to wrong caller");
    }
    assert_eq!(mux.pending_count(), 0);
}

/// Test: Each published request goes to exactly one puller
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_each_request_pulled_once() {
    let mux = MuxDispatcher::default().shared();
    let (_handles, pulled) = dispatch_and_pull(&mux, 8).await;

    let mut ids: Vec<u64> = pulled.iter().map(|p| p.dispatch_id).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert!(mux
        .pull_timeout(Duration::from_millis(30))
        .await
        .unwrap()
        .is_none());
    mux.abort("test cleanup");
}

/// Test: Double submit is rejected and never overwrites the first result
#[tokio::test]
async fn test_double_submit_rejected() {
    let mux = MuxDispatcher::default().shared();
    let (mut handles, pulled) = dispatch_and_pull(&mux, 1).await;
    let id = pulled[0].dispatch_id;

    mux.submit(id, b"\"first\"".to_vec()).unwrap();
    for _ in 0..3 {
        assert!(matches!(
            mux.submit(id, b"\"again\"".to_vec()),
            Err(DispatchError::AlreadySubmitted(got)) if got == id
        ));
    }
    let (_, result) = handles.remove(0).await.unwrap();
    assert_eq!(result.unwrap(), b"\"first\"".to_vec());
}

/// Test: Unknown ids are rejected without disturbing in-flight work
#[tokio::test]
async fn test_unknown_id_has_no_side_effects() {
    let mux = MuxDispatcher::default().shared();
    let (mut handles, pulled) = dispatch_and_pull(&mux, 1).await;

    assert!(matches!(
        mux.submit(9_999, b"{}".to_vec()),
        Err(DispatchError::UnknownId(9_999))
    ));
    assert_eq!(mux.pending_count(), 1);

    mux.submit(pulled[0].dispatch_id, b"{}".to_vec()).unwrap();
    assert!(handles.remove(0).await.unwrap().1.is_ok());
}

/// Test: Abort releases every blocked dispatch and puller with the same reason
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abort_broadcasts_reason() {
    let mux = MuxDispatcher::default().shared();
    let (handles, _pulled) = dispatch_and_pull(&mux, 5).await;

    let m = mux.clone();
    let waiting_puller = tokio::spawn(async move { m.pull().await });
    tokio::time::sleep(Duration::from_millis(20)).await;

    mux.abort("operator stop");

    for handle in handles {
        match handle.await.unwrap().1 {
            Err(DispatchError::Aborted { reason }) => assert_eq!(reason, "operator stop"),
            other => panic!("expected abort, got {other:?}"),
        }
    }
    assert!(matches!(
        waiting_puller.await.unwrap(),
        Err(DispatchError::Aborted { .. })
    ));
    assert!(matches!(
        mux.dispatch(request(99)).await,
        Err(DispatchError::Aborted { reason }) if reason == "operator stop"
    ));
}

/// Test: Cancelling the governing token releases a blocked puller
#[tokio::test]
async fn test_governing_cancellation_releases_pullers() {
    let root = CancellationToken::new();
    let mux = MuxDispatcher::new(root.child_token()).shared();
    let m = mux.clone();
    let puller = tokio::spawn(async move { m.pull().await });
    tokio::time::sleep(Duration::from_millis(10)).await;

    root.cancel();
    assert!(matches!(
        puller.await.unwrap(),
        Err(DispatchError::Cancelled { .. })
    ));
    assert!(mux.dispatch(request(1)).await.is_err());
}
