//! Tracking Dispatcher
//!
//! Records size and wall-clock time of every dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::error::DispatchResult;
use super::{DispatchRequest, Dispatcher, Finalizer, SharedDispatcher};
use crate::pipeline::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub case_id: String,
    pub stage: Stage,
    pub request_bytes: usize,
    pub result_bytes: usize,
    pub wall_clock_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingSummary {
    pub dispatches: usize,
    pub failures: usize,
    pub request_bytes: usize,
    pub result_bytes: usize,
    pub wall_clock_ms: u64,
    pub per_stage: BTreeMap<String, usize>,
}

/// Collected dispatch records, shareable across decorators
#[derive(Debug, Default)]
pub struct DispatchTracker {
    records: Mutex<Vec<DispatchRecord>>,
}

impl DispatchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn record(&self, record: DispatchRecord) {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record);
    }

    pub fn records(&self) -> Vec<DispatchRecord> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn summary(&self) -> TrackingSummary {
        let records = self.records();
        let mut summary = TrackingSummary {
            dispatches: records.len(),
            ..Default::default()
        };
        for r in &records {
            if !r.ok {
                summary.failures += 1;
            }
            summary.request_bytes += r.request_bytes;
            summary.result_bytes += r.result_bytes;
            summary.wall_clock_ms += r.wall_clock_ms;
            *summary
                .per_stage
                .entry(r.stage.family().to_string())
                .or_insert(0) += 1;
        }
        summary
    }
}

pub struct TrackingDispatcher {
    inner: SharedDispatcher,
    tracker: Arc<DispatchTracker>,
}

impl TrackingDispatcher {
    pub fn new(inner: SharedDispatcher, tracker: Arc<DispatchTracker>) -> Self {
        Self { inner, tracker }
    }

    pub fn tracker(&self) -> &Arc<DispatchTracker> {
        &self.tracker
    }

    /// The wrapped dispatcher
    pub fn inner(&self) -> &SharedDispatcher {
        &self.inner
    }
}

#[async_trait]
impl Dispatcher for TrackingDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        let case_id = request.case_id.clone();
        let stage = request.stage;
        let request_bytes = serde_json::to_vec(&request.payload)
            .map(|b| b.len())
            .unwrap_or(0);
        let started = Instant::now();

        let result = self.inner.dispatch(request).await;

        self.tracker.record(DispatchRecord {
            case_id,
            stage,
            request_bytes,
            result_bytes: result.as_ref().map(Vec::len).unwrap_or(0),
            wall_clock_ms: started.elapsed().as_millis() as u64,
            ok: result.is_ok(),
        });
        result
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn finalizer(&self) -> Option<&dyn Finalizer> {
        self.inner.finalizer()
    }
}
