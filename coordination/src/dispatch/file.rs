//! File Dispatcher
//!
//! Signal/poll protocol over the filesystem.
//!
//! For every dispatch the dispatcher writes the request body, removes any old
//! result, and publishes a `signal.json` with status `waiting` and a fresh
//! `dispatch_id`. The worker side writes a [`ResultEnvelope`] echoing that id
//! to the result location. The dispatcher polls until a matching envelope
//! appears, tolerating a bounded streak of envelopes carrying another id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::error::{DispatchError, DispatchResult};
use super::{DispatchRequest, Dispatcher, Finalizer, RequestLocations};
use crate::atomic_file::write_json_atomic;
use crate::pipeline::Stage;

/// File name of the signal record
pub const SIGNAL_FILE: &str = "signal.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    /// Request published, no result yet
    Waiting,
    /// Result accepted by the dispatcher
    Processing,
    /// Result consumed by the pipeline
    Done,
    Error,
    /// Whole run finalized
    Complete,
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Waiting => "waiting",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

/// The `signal.json` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub status: SignalStatus,
    pub dispatch_id: u64,
    pub case_id: String,
    pub stage: Stage,
    pub request_location: String,
    pub result_location: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the worker writes to the result location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub dispatch_id: u64,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileDispatcherConfig {
    /// Root for request/result files when a request carries no locations
    pub work_dir: PathBuf,
    /// Shared signal root; each case gets `<signal_dir>/<case_id>/signal.json`.
    /// Defaults to the result's directory.
    pub signal_dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive mismatched-id results tolerated before failing
    pub max_stale_rejects: u32,
}

impl Default for FileDispatcherConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".rca/work"),
            signal_dir: None,
            poll_interval_ms: 500,
            timeout_ms: 10 * 60 * 1000,
            max_stale_rejects: 10,
        }
    }
}

impl FileDispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Locations from the request, or `<work_dir>/<case_id>/<family>.{request,result}.json`
    pub fn locations_for(&self, request: &DispatchRequest) -> RequestLocations {
        request.locations.clone().unwrap_or_else(|| {
            let case_dir = self.work_dir.join(&request.case_id);
            let family = request.stage.family();
            RequestLocations {
                request_path: case_dir.join(format!("{family}.request.json")),
                result_path: case_dir.join(format!("{family}.result.json")),
            }
        })
    }
}

/// Counts consecutive stale results. The first `max` are tolerated.
#[derive(Debug, Clone, Copy)]
pub struct StaleGuard {
    max: u32,
    streak: u32,
}

impl StaleGuard {
    pub fn new(max: u32) -> Self {
        Self { max, streak: 0 }
    }

    /// Record a mismatched read; `Err(streak)` once tolerance is exceeded
    pub fn observe_mismatch(&mut self) -> Result<u32, u32> {
        self.streak += 1;
        if self.streak > self.max {
            Err(self.streak)
        } else {
            Ok(self.streak)
        }
    }

    pub fn reset(&mut self) {
        self.streak = 0;
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

pub fn write_signal(path: &Path, signal: &SignalRecord) -> DispatchResult<()> {
    write_json_atomic(path, signal)?;
    Ok(())
}

/// Read a signal record; `Ok(None)` if the file does not exist
pub fn read_signal(path: &Path) -> DispatchResult<Option<SignalRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Rewrite the status of every `signal.json` under `dir` to `complete`.
///
/// Returns how many signals were updated.
pub fn finalize_signals(dir: &Path) -> DispatchResult<usize> {
    let mut updated = 0;
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|n| n == SIGNAL_FILE) {
                if let Some(mut signal) = read_signal(&path)? {
                    signal.status = SignalStatus::Complete;
                    signal.timestamp = Utc::now();
                    write_signal(&path, &signal)?;
                    updated += 1;
                }
            }
        }
    }
    Ok(updated)
}

pub struct FileDispatcher {
    config: FileDispatcherConfig,
    next_id: AtomicU64,
    /// Id of the last accepted result per signal file, consumed by `mark_done`
    accepted: Mutex<HashMap<PathBuf, u64>>,
}

impl FileDispatcher {
    pub fn new(config: FileDispatcherConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(0),
            accepted: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &FileDispatcherConfig {
        &self.config
    }

    pub fn locations(&self, request: &DispatchRequest) -> RequestLocations {
        self.config.locations_for(request)
    }

    /// Where the signal for `request` lives. Concurrent cases never share one.
    pub fn signal_path(&self, request: &DispatchRequest) -> PathBuf {
        match &self.config.signal_dir {
            Some(dir) => dir.join(&request.case_id).join(SIGNAL_FILE),
            None => self
                .locations(request)
                .result_path
                .parent()
                .map(|p| p.join(SIGNAL_FILE))
                .unwrap_or_else(|| PathBuf::from(SIGNAL_FILE)),
        }
    }

    /// Next dispatch id. Every dispatch through this transport, batched or
    /// not, draws from this one counter.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn accepted(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, u64>> {
        self.accepted.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Best-effort status update so the worker side observes the outcome
    fn set_status(&self, signal_path: &Path, dispatch_id: u64, status: SignalStatus, error: Option<String>) {
        let updated = read_signal(signal_path).and_then(|signal| match signal {
            Some(mut signal) if signal.dispatch_id == dispatch_id => {
                signal.status = status;
                signal.error = error;
                signal.timestamp = Utc::now();
                write_signal(signal_path, &signal)
            }
            _ => Ok(()),
        });
        if let Err(e) = updated {
            warn!(dispatch_id, path = %signal_path.display(), error = %e, "Failed to update signal status");
        }
    }

    /// Publish the request with `dispatch_id` and poll for its result
    pub async fn dispatch_with_id(
        &self,
        dispatch_id: u64,
        request: &DispatchRequest,
    ) -> DispatchResult<Vec<u8>> {
        let locations = self.locations(request);
        let signal_path = self.signal_path(request);

        write_json_atomic(&locations.request_path, &request.payload)?;
        match tokio::fs::remove_file(&locations.result_path).await {
            Ok(()) => debug!(dispatch_id, "Removed previous result"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let signal = SignalRecord {
            status: SignalStatus::Waiting,
            dispatch_id,
            case_id: request.case_id.clone(),
            stage: request.stage,
            request_location: locations.request_path.display().to_string(),
            result_location: locations.result_path.display().to_string(),
            timestamp: Utc::now(),
            error: None,
        };
        write_signal(&signal_path, &signal)?;
        info!(
            dispatch_id,
            case_id = %request.case_id,
            stage = %request.stage,
            signal = %signal_path.display(),
            "Signal written, waiting for result"
        );

        self.poll(dispatch_id, request, &locations.result_path, &signal_path)
            .await
    }

    async fn poll(
        &self,
        dispatch_id: u64,
        request: &DispatchRequest,
        result_path: &Path,
        signal_path: &Path,
    ) -> DispatchResult<Vec<u8>> {
        let started = Instant::now();
        let deadline = started + self.config.timeout();
        let mut stale = StaleGuard::new(self.config.max_stale_rejects);
        let mut retried_invalid = false;

        loop {
            if Instant::now() >= deadline {
                let err = DispatchError::Timeout {
                    dispatch_id,
                    case_id: request.case_id.clone(),
                    stage: request.stage,
                    elapsed: started.elapsed(),
                };
                self.set_status(signal_path, dispatch_id, SignalStatus::Error, Some(err.to_string()));
                return Err(err);
            }

            if let Ok(Some(live)) = read_signal(signal_path) {
                if live.dispatch_id == dispatch_id && live.status == SignalStatus::Error {
                    return Err(DispatchError::Responder {
                        dispatch_id,
                        message: live.error.unwrap_or_else(|| "unspecified".to_string()),
                    });
                }
            }

            match tokio::fs::read(result_path).await {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => stale.reset(),
                Err(e) => return Err(e.into()),
                Ok(bytes) => match serde_json::from_slice::<ResultEnvelope>(&bytes) {
                    Err(e) if !retried_invalid => {
                        // Possibly caught mid-write; give it one more interval.
                        debug!(dispatch_id, error = %e, "Result not yet valid JSON, retrying once");
                        retried_invalid = true;
                    }
                    Err(e) => {
                        let err = DispatchError::MalformedResult {
                            dispatch_id,
                            message: e.to_string(),
                        };
                        self.set_status(signal_path, dispatch_id, SignalStatus::Error, Some(err.to_string()));
                        return Err(err);
                    }
                    Ok(envelope) if envelope.dispatch_id != dispatch_id => {
                        retried_invalid = false;
                        match stale.observe_mismatch() {
                            Ok(streak) => debug!(
                                dispatch_id,
                                found = envelope.dispatch_id,
                                streak,
                                "Ignoring stale result"
                            ),
                            Err(streak) => {
                                let err = DispatchError::StaleTolerance {
                                    dispatch_id,
                                    streak,
                                    path: result_path.to_path_buf(),
                                };
                                self.set_status(signal_path, dispatch_id, SignalStatus::Error, Some(err.to_string()));
                                return Err(err);
                            }
                        }
                    }
                    Ok(envelope) => match envelope.data {
                        None | Some(serde_json::Value::Null) => {
                            let err = DispatchError::EmptyResult { dispatch_id };
                            self.set_status(signal_path, dispatch_id, SignalStatus::Error, Some(err.to_string()));
                            return Err(err);
                        }
                        Some(data) => {
                            self.set_status(signal_path, dispatch_id, SignalStatus::Processing, None);
                            self.accepted().insert(signal_path.to_path_buf(), dispatch_id);
                            debug!(dispatch_id, elapsed_ms = started.elapsed().as_millis() as u64, "Result accepted");
                            return Ok(serde_json::to_vec(&data)?);
                        }
                    },
                },
            }

            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

#[async_trait]
impl Dispatcher for FileDispatcher {
    async fn dispatch(&self, request: DispatchRequest) -> DispatchResult<Vec<u8>> {
        let dispatch_id = self.allocate_id();
        self.dispatch_with_id(dispatch_id, &request).await
    }

    fn name(&self) -> &'static str {
        "file"
    }

    fn finalizer(&self) -> Option<&dyn Finalizer> {
        Some(self)
    }
}

impl Finalizer for FileDispatcher {
    /// Mark the signal done, but only if it still belongs to the result this
    /// dispatcher last accepted for it.
    fn mark_done(&self, request: &DispatchRequest) -> DispatchResult<()> {
        let signal_path = self.signal_path(request);
        let Some(dispatch_id) = self.accepted().remove(&signal_path) else {
            debug!(case_id = %request.case_id, "No accepted result to mark done");
            return Ok(());
        };
        match read_signal(&signal_path)? {
            Some(mut signal) if signal.dispatch_id == dispatch_id => {
                signal.status = SignalStatus::Done;
                signal.timestamp = Utc::now();
                write_signal(&signal_path, &signal)?;
            }
            Some(signal) => debug!(
                dispatch_id,
                found = signal.dispatch_id,
                "Signal reissued since result was accepted, leaving it"
            ),
            None => {}
        }
        Ok(())
    }
}
