//! In-process workers
//!
//! A [`Worker`] turns a request into an artifact synchronously. It can be
//! called directly through [`InlineDispatcher`], or attached to a
//! [`MuxDispatcher`] with [`serve`] to act as a pulling worker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::{DispatchError, DispatchResult};
use super::mux::MuxDispatcher;
use super::{DispatchRequest, Dispatcher};

/// A strategy that produces a stage artifact for a request
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    fn produce(&self, request: &DispatchRequest) -> anyhow::Result<serde_json::Value>;
}

/// Calls a worker in-process; never blocks on anything external
pub struct InlineDispatcher {
    worker: Arc<dyn Worker>,
    next_id: AtomicU64,
}

impl InlineDispatcher {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            next_id: AtomicU64::new(0),
        }
    }

    /// Number of requests served so far
    pub fn served(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }
}

fn worker_error(worker: &dyn Worker, request: &DispatchRequest, e: anyhow::Error) -> DispatchError {
    DispatchError::Worker {
        worker: worker.name().to_string(),
        case_id: request.case_id.clone(),
        stage: request.stage,
        message: format!("{e:#}"),
    }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        let dispatch_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let value = self
            .worker
            .produce(&request)
            .map_err(|e| worker_error(self.worker.as_ref(), &request, e))?;
        debug!(
            dispatch_id,
            worker = self.worker.name(),
            case_id = %request.case_id,
            stage = %request.stage,
            "Inline artifact produced"
        );
        Ok(serde_json::to_vec(&value)?)
    }

    fn name(&self) -> &'static str {
        "inline"
    }
}

/// Pull requests from `mux` and answer them with `worker` until the mux
/// is cancelled or aborted. Returns how many results were submitted.
///
/// A worker failure is logged and the request is left unanswered, as an
/// external worker that crashed would leave it.
pub async fn serve(mux: &MuxDispatcher, worker: &dyn Worker) -> u64 {
    let mut submitted = 0;
    loop {
        let issued = match mux.pull().await {
            Ok(issued) => issued,
            Err(e) => {
                debug!(worker = worker.name(), reason = %e, "Worker stopping");
                return submitted;
            }
        };
        let result = worker
            .produce(&issued.request)
            .map_err(|e| worker_error(worker, &issued.request, e))
            .and_then(|value| Ok(serde_json::to_vec(&value)?));
        match result {
            Ok(bytes) => match mux.submit(issued.dispatch_id, bytes) {
                Ok(()) => submitted += 1,
                Err(e) => warn!(dispatch_id = issued.dispatch_id, error = %e, "Submit failed"),
            },
            Err(e) => warn!(dispatch_id = issued.dispatch_id, error = %e, "Worker failed"),
        }
    }
}
