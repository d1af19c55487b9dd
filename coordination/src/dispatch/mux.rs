//! Mux Dispatcher
//!
//! Correlation-id rendezvous between dispatchers and pullers.
//!
//! `dispatch` allocates a fresh id and a one-shot slot, publishes the request
//! on a point-to-point queue and waits on the slot. `pull` hands each
//! published request to exactly one caller. `submit` routes bytes into the
//! slot for its id. Routing depends only on the id, so results may arrive
//! in any order.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::error::{DispatchError, DispatchResult};
use super::{DispatchRequest, Dispatcher, IssuedRequest};

/// Retired ids remembered by default, counting back from the newest issued id
pub const DEFAULT_RETIRED_WINDOW: u64 = 4096;

/// Why an id is no longer pending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retired {
    Submitted,
    /// Caller stopped waiting (cancellation or timeout)
    Abandoned,
}

#[derive(Default)]
struct PendingTable {
    next_id: u64,
    pending: HashMap<u64, oneshot::Sender<Vec<u8>>>,
    retired: HashMap<u64, Retired>,
    abort_reason: Option<String>,
}

impl PendingTable {
    /// Record why `id` left the pending set, forgetting ids older than `window`
    fn retire(&mut self, id: u64, why: Retired, window: u64) {
        self.retired.insert(id, why);
        // Sweep only once the map has doubled, so retiring stays amortized O(1).
        if self.retired.len() as u64 > window.saturating_mul(2) {
            let floor = self.next_id.saturating_sub(window);
            self.retired.retain(|retired, _| *retired > floor);
        }
    }
}

/// Shared reference to a MuxDispatcher
pub type SharedMux = Arc<MuxDispatcher>;

pub struct MuxDispatcher {
    table: Mutex<PendingTable>,
    tx: mpsc::UnboundedSender<IssuedRequest>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<IssuedRequest>>,
    /// Governing cancellation, usually a child of the owning session's token
    cancel: CancellationToken,
    /// Fired once by `abort`
    aborted: CancellationToken,
    dispatch_timeout: Option<Duration>,
    retired_window: u64,
}

impl MuxDispatcher {
    pub fn new(cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            table: Mutex::new(PendingTable::default()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            cancel,
            aborted: CancellationToken::new(),
            dispatch_timeout: None,
            retired_window: DEFAULT_RETIRED_WINDOW,
        }
    }

    /// How many recent ids keep a precise retired-id error on late submits
    pub fn with_retired_window(mut self, window: u64) -> Self {
        self.retired_window = window.max(1);
        self
    }

    /// Bound how long a single `dispatch` waits for its result
    pub fn with_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.dispatch_timeout = Some(timeout);
        self
    }

    pub fn shared(self) -> SharedMux {
        Arc::new(self)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        // Nothing panics while holding the table lock, but stay usable if it happens.
        self.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn abort_error(&self) -> DispatchError {
        let reason = self
            .lock()
            .abort_reason
            .clone()
            .unwrap_or_else(|| "dispatcher aborted".to_string());
        DispatchError::aborted(reason)
    }

    fn closed_error(&self) -> Option<DispatchError> {
        if self.aborted.is_cancelled() {
            return Some(self.abort_error());
        }
        if self.cancel.is_cancelled() {
            return Some(DispatchError::Cancelled { dispatch_id: None });
        }
        None
    }

    /// Number of dispatches waiting for a result
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_pending(&self, dispatch_id: u64) -> bool {
        self.lock().pending.contains_key(&dispatch_id)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_cancelled()
    }

    fn abandon(&self, dispatch_id: u64) {
        let mut table = self.lock();
        if table.pending.remove(&dispatch_id).is_some() {
            table.retire(dispatch_id, Retired::Abandoned, self.retired_window);
        }
    }

    /// Register a slot and publish the request, returning the id and the slot receiver.
    fn register(&self, request: DispatchRequest) -> DispatchResult<(u64, oneshot::Receiver<Vec<u8>>)> {
        let (slot_tx, slot_rx) = oneshot::channel();
        let (dispatch_id, pending_count) = {
            let mut table = self.lock();
            if let Some(reason) = &table.abort_reason {
                return Err(DispatchError::aborted(reason.clone()));
            }
            if self.cancel.is_cancelled() {
                return Err(DispatchError::Cancelled { dispatch_id: None });
            }
            table.next_id += 1;
            let id = table.next_id;
            table.pending.insert(id, slot_tx);
            (id, table.pending.len())
        };

        debug!(
            dispatch_id,
            case_id = %request.case_id,
            stage = %request.stage,
            pending_count,
            "Dispatch registered"
        );

        let issued = IssuedRequest {
            dispatch_id,
            request,
        };
        if self.tx.send(issued).is_err() {
            self.abandon(dispatch_id);
            return Err(self.abort_error());
        }
        Ok((dispatch_id, slot_rx))
    }

    /// Wait for the next published request.
    ///
    /// Requests whose dispatcher already gave up are skipped.
    pub async fn pull(&self) -> DispatchResult<IssuedRequest> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }
        let mut rx = tokio::select! {
            _ = self.aborted.cancelled() => return Err(self.abort_error()),
            _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled { dispatch_id: None }),
            guard = self.rx.lock() => guard,
        };

        loop {
            let next = tokio::select! {
                _ = self.aborted.cancelled() => return Err(self.abort_error()),
                _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled { dispatch_id: None }),
                item = rx.recv() => item,
            };
            match next {
                Some(issued) if self.is_pending(issued.dispatch_id) => {
                    debug!(
                        dispatch_id = issued.dispatch_id,
                        case_id = %issued.request.case_id,
                        stage = %issued.request.stage,
                        "Request pulled"
                    );
                    return Ok(issued);
                }
                Some(issued) => {
                    debug!(dispatch_id = issued.dispatch_id, "Skipping abandoned request");
                }
                None => return Err(self.abort_error()),
            }
        }
    }

    /// `pull` bounded by `timeout`; `Ok(None)` when nothing arrived in time
    pub async fn pull_timeout(&self, timeout: Duration) -> DispatchResult<Option<IssuedRequest>> {
        match tokio::time::timeout(timeout, self.pull()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Deliver `bytes` to the caller waiting on `dispatch_id`.
    pub fn submit(&self, dispatch_id: u64, bytes: Vec<u8>) -> DispatchResult<()> {
        let slot = {
            let mut table = self.lock();
            if let Some(reason) = &table.abort_reason {
                return Err(DispatchError::aborted(reason.clone()));
            }
            match table.pending.remove(&dispatch_id) {
                Some(slot) => {
                    table.retire(dispatch_id, Retired::Submitted, self.retired_window);
                    slot
                }
                None => {
                    let err = match table.retired.get(&dispatch_id) {
                        Some(Retired::Submitted) => DispatchError::AlreadySubmitted(dispatch_id),
                        Some(Retired::Abandoned) => DispatchError::cancelled(dispatch_id),
                        None if dispatch_id >= 1 && dispatch_id <= table.next_id => {
                            DispatchError::Expired(dispatch_id)
                        }
                        None => DispatchError::UnknownId(dispatch_id),
                    };
                    warn!(dispatch_id, error = %err, "Submit rejected");
                    return Err(err);
                }
            }
        };

        slot.send(bytes).map_err(|_| {
            warn!(dispatch_id, "Submit arrived after caller stopped waiting");
            DispatchError::cancelled(dispatch_id)
        })?;
        debug!(dispatch_id, pending_count = self.pending_count(), "Result routed");
        Ok(())
    }

    /// Fail every blocked caller with `reason` and refuse all further work.
    ///
    /// Idempotent: only the first reason is kept.
    pub fn abort(&self, reason: &str) {
        let drained = {
            let mut table = self.lock();
            if table.abort_reason.is_some() {
                return;
            }
            table.abort_reason = Some(reason.to_string());
            let ids: Vec<u64> = table.pending.keys().copied().collect();
            for id in ids {
                table.retire(id, Retired::Abandoned, self.retired_window);
            }
            // Dropping the senders wakes every waiting dispatch.
            table.pending.drain().count()
        };
        self.aborted.cancel();
        error!(reason, pending_count = drained, "Dispatcher aborted");
    }
}

impl Default for MuxDispatcher {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[async_trait]
impl Dispatcher for MuxDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        let case_id = request.case_id.clone();
        let stage = request.stage;
        let (dispatch_id, slot) = self.register(request)?;
        let started = Instant::now();

        let deadline = async {
            match self.dispatch_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            result = slot => match result {
                Ok(bytes) => Ok(bytes),
                Err(_) => Err(self.abort_error()),
            },
            _ = self.cancel.cancelled() => {
                self.abandon(dispatch_id);
                warn!(dispatch_id, case_id = %case_id, stage = %stage, "Dispatch cancelled");
                Err(DispatchError::cancelled(dispatch_id))
            }
            _ = deadline => {
                self.abandon(dispatch_id);
                warn!(dispatch_id, case_id = %case_id, stage = %stage, "Dispatch timed out");
                Err(DispatchError::Timeout {
                    dispatch_id,
                    case_id,
                    stage,
                    elapsed: started.elapsed(),
                })
            }
        }
    }

    fn name(&self) -> &'static str {
        "mux"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Stage;
    use serde_json::json;

    fn request(case_id: &str) -> DispatchRequest {
        DispatchRequest::new(case_id, Stage::Triage, json!({}))
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_routing_by_id() {
        let mux = MuxDispatcher::default().shared();
        let m = mux.clone();
        let handle = tokio::spawn(async move { m.dispatch(request("c1")).await });

        let issued = mux.pull().await.unwrap();
        assert_eq!(issued.dispatch_id, 1);
        assert_eq!(issued.request.case_id, "c1");
        mux.submit(issued.dispatch_id, b"{\"ok\":1}".to_vec()).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), b"{\"ok\":1}".to_vec());
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_and_double_submit_are_distinct() {
        let mux = MuxDispatcher::default().shared();
        assert!(matches!(mux.submit(99, vec![]), Err(DispatchError::UnknownId(99))));

        let m = mux.clone();
        let handle = tokio::spawn(async move { m.dispatch(request("c1")).await });
        let issued = mux.pull().await.unwrap();
        mux.submit(issued.dispatch_id, b"first".to_vec()).unwrap();
        let second = mux.submit(issued.dispatch_id, b"second".to_vec());
        assert!(matches!(second, Err(DispatchError::AlreadySubmitted(_))));
        assert_eq!(handle.await.unwrap().unwrap(), b"first".to_vec());
    }

    #[tokio::test]
    async fn test_retired_ids_are_bounded() {
        let mux = MuxDispatcher::default().with_retired_window(4).shared();
        for _ in 0..20 {
            let m = mux.clone();
            let handle = tokio::spawn(async move { m.dispatch(request("c1")).await });
            let issued = mux.pull().await.unwrap();
            mux.submit(issued.dispatch_id, vec![]).unwrap();
            handle.await.unwrap().unwrap();
        }
        assert!(mux.lock().retired.len() <= 8);
        assert!(matches!(mux.submit(20, vec![]), Err(DispatchError::AlreadySubmitted(20))));
        assert!(matches!(mux.submit(1, vec![]), Err(DispatchError::Expired(1))));
        assert!(matches!(mux.submit(21, vec![]), Err(DispatchError::UnknownId(21))));
    }

    #[tokio::test]
    async fn test_abort_fails_blocked_and_future_calls() {
        let mux = MuxDispatcher::default().shared();
        let m = mux.clone();
        let handle = tokio::spawn(async move { m.dispatch(request("c1")).await });
        let issued = mux.pull().await.unwrap();

        mux.abort("session TTL expired");
        mux.abort("second reason ignored");

        match handle.await.unwrap() {
            Err(DispatchError::Aborted { reason }) => assert_eq!(reason, "session TTL expired"),
            other => panic!("expected abort, got {other:?}"),
        }
        assert!(matches!(mux.pull().await, Err(DispatchError::Aborted { .. })));
        assert!(matches!(
            mux.dispatch(request("c2")).await,
            Err(DispatchError::Aborted { .. })
        ));
        assert!(matches!(
            mux.submit(issued.dispatch_id, vec![]),
            Err(DispatchError::Aborted { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_handed_out_dispatch() {
        let token = CancellationToken::new();
        let mux = MuxDispatcher::new(token.child_token()).shared();
        let m = mux.clone();
        let handle = tokio::spawn(async move { m.dispatch(request("c1")).await });
        let issued = mux.pull().await.unwrap();

        token.cancel();
        assert!(matches!(
            handle.await.unwrap(),
            Err(DispatchError::Cancelled { dispatch_id: Some(1) })
        ));
        assert_eq!(mux.pending_count(), 0);
        assert!(mux.submit(issued.dispatch_id, vec![]).is_err());
        assert!(matches!(mux.pull().await, Err(DispatchError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn test_dispatch_timeout_abandons_slot() {
        let mux = MuxDispatcher::default()
            .with_dispatch_timeout(Duration::from_millis(30))
            .shared();
        let err = mux.dispatch(request("c1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { dispatch_id: 1, .. }));
        // The abandoned request is never handed to a puller.
        assert!(mux.pull_timeout(Duration::from_millis(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_timeout_returns_none_when_idle() {
        let mux = MuxDispatcher::default();
        assert!(mux.pull_timeout(Duration::from_millis(20)).await.unwrap().is_none());
    }
}
