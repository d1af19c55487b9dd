//! Batch File Dispatcher
//!
//! N file dispatches in parallel under one manifest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::error::{DispatchError, DispatchResult};
use super::file::FileDispatcher;
use super::{DispatchRequest, Dispatcher, Finalizer};
use crate::atomic_file::{write_atomic, write_json_atomic};

pub const MANIFEST_FILE: &str = "batch-manifest.json";
pub const BRIEFING_FILE: &str = "briefing.md";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    InProgress,
    Done,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSignalEntry {
    pub case_id: String,
    pub signal_path: String,
    pub status: BatchStatus,
}

/// `batch-manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchManifest {
    pub batch_id: u64,
    pub phase: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub briefing_path: Option<String>,
    pub signals: Vec<BatchSignalEntry>,
}

impl BatchManifest {
    /// Overall status once every member has resolved: error only if all failed
    fn settle(&mut self) {
        let all_failed = !self.signals.is_empty()
            && self.signals.iter().all(|s| s.status == BatchStatus::Error);
        self.status = if all_failed {
            BatchStatus::Error
        } else {
            BatchStatus::Done
        };
        self.updated_at = Utc::now();
    }
}

pub fn read_manifest(path: &Path) -> DispatchResult<BatchManifest> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub struct BatchFileDispatcher {
    inner: Arc<FileDispatcher>,
    suite_dir: PathBuf,
    next_batch: AtomicU64,
}

impl BatchFileDispatcher {
    pub fn new(inner: Arc<FileDispatcher>, suite_dir: impl Into<PathBuf>) -> Self {
        Self {
            inner,
            suite_dir: suite_dir.into(),
            next_batch: AtomicU64::new(0),
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.suite_dir.join(MANIFEST_FILE)
    }

    pub fn briefing_path(&self) -> PathBuf {
        self.suite_dir.join(BRIEFING_FILE)
    }

    /// Write shared context for the whole batch to `briefing.md`
    pub fn write_briefing(&self, content: &str) -> DispatchResult<PathBuf> {
        let path = self.briefing_path();
        write_atomic(&path, content.as_bytes())?;
        Ok(path)
    }

    fn save(&self, manifest: &BatchManifest) {
        if let Err(e) = write_json_atomic(&self.manifest_path(), manifest) {
            warn!(batch_id = manifest.batch_id, error = %e, "Failed to write batch manifest");
        }
    }

    /// Dispatch every request concurrently; results come back by index.
    ///
    /// Members succeed or fail independently.
    pub async fn dispatch_batch(
        &self,
        phase: &str,
        requests: Vec<DispatchRequest>,
    ) -> DispatchResult<Vec<DispatchResult<Vec<u8>>>> {
        if requests.is_empty() {
            return Err(DispatchError::InvalidRequest("empty batch".to_string()));
        }
        let batch_id = self.next_batch.fetch_add(1, Ordering::SeqCst) + 1;
        let briefing = self.briefing_path();
        let now = Utc::now();

        let manifest = BatchManifest {
            batch_id,
            phase: phase.to_string(),
            status: BatchStatus::Pending,
            created_at: now,
            updated_at: now,
            total: requests.len(),
            briefing_path: briefing.exists().then(|| briefing.display().to_string()),
            signals: requests
                .iter()
                .map(|r| BatchSignalEntry {
                    case_id: r.case_id.clone(),
                    signal_path: self.inner.signal_path(r).display().to_string(),
                    status: BatchStatus::Pending,
                })
                .collect(),
        };
        self.save(&manifest);

        let manifest = Mutex::new(manifest);
        if let Ok(mut m) = manifest.lock() {
            m.status = BatchStatus::InProgress;
            m.updated_at = Utc::now();
            self.save(&m);
        }
        info!(batch_id, phase, total = requests.len(), "Batch dispatched");

        let members = requests.iter().enumerate().map(|(index, request)| {
            let manifest = &manifest;
            async move {
                let dispatch_id = self.inner.allocate_id();
                let result = self.inner.dispatch_with_id(dispatch_id, request).await;
                if let Ok(mut m) = manifest.lock() {
                    m.signals[index].status = if result.is_ok() {
                        BatchStatus::Done
                    } else {
                        BatchStatus::Error
                    };
                    m.updated_at = Utc::now();
                    self.save(&m);
                }
                result
            }
        });
        let results = join_all(members).await;

        if let Ok(mut m) = manifest.lock() {
            m.settle();
            self.save(&m);
            info!(batch_id, status = ?m.status, "Batch resolved");
        }
        Ok(results)
    }
}

#[async_trait]
impl Dispatcher for BatchFileDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        self.inner.dispatch(request).await
    }

    fn name(&self) -> &'static str {
        "batch-file"
    }

    fn finalizer(&self) -> Option<&dyn Finalizer> {
        Some(self.inner.as_ref())
    }
}
