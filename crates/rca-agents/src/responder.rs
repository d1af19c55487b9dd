//! File-signal responder
//!
//! The worker half of the file transport. It scans a directory tree for
//! `signal.json` files in `waiting` state, asks a [`Worker`] for the
//! artifact, and writes a result envelope that echoes the `dispatch_id`.
//! When the worker fails, the signal is flipped to `error` so the waiting
//! dispatcher fails fast instead of running into its timeout.

use anyhow::{Context, Result};
use chrono::Utc;
use rca_coordination::atomic_file::write_json_atomic;
use rca_coordination::dispatch::file::{read_signal, write_signal, SIGNAL_FILE};
use rca_coordination::dispatch::{DispatchRequest, ResultEnvelope, SignalRecord, SignalStatus, Worker};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to one signal during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Answered { dispatch_id: u64, case_id: String },
    Failed { dispatch_id: u64, case_id: String, error: String },
}

pub struct Responder {
    watch_dir: PathBuf,
    worker: Arc<dyn Worker>,
    poll_interval: Duration,
    /// (signal path, dispatch id) pairs already handled
    seen: HashSet<(PathBuf, u64)>,
}

impl Responder {
    pub fn new(watch_dir: impl Into<PathBuf>, worker: Arc<dyn Worker>, poll_interval: Duration) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            worker,
            poll_interval,
            seen: HashSet::new(),
        }
    }

    pub fn watch_dir(&self) -> &Path {
        &self.watch_dir
    }

    /// One pass over the watch directory
    pub fn scan_once(&mut self) -> Result<Vec<Response>> {
        let mut responses = Vec::new();
        for signal_path in find_signals(&self.watch_dir)? {
            let signal = match read_signal(&signal_path) {
                Ok(Some(signal)) => signal,
                Ok(None) => continue,
                Err(e) => {
                    // Likely caught mid-write; the next scan sees the full file.
                    debug!(path = %signal_path.display(), error = %e, "Unreadable signal, skipping");
                    continue;
                }
            };
            if signal.status != SignalStatus::Waiting {
                continue;
            }
            if !self.seen.insert((signal_path.clone(), signal.dispatch_id)) {
                continue;
            }
            responses.push(self.respond(&signal_path, signal));
        }
        Ok(responses)
    }

    fn respond(&self, signal_path: &Path, signal: SignalRecord) -> Response {
        let dispatch_id = signal.dispatch_id;
        let case_id = signal.case_id.clone();
        info!(dispatch_id, case_id = %case_id, stage = %signal.stage, "Signal received");

        match self.answer(&signal) {
            Ok(result_path) => {
                info!(dispatch_id, case_id = %case_id, result = %result_path.display(), "Result written");
                Response::Answered { dispatch_id, case_id }
            }
            Err(e) => {
                let error = format!("{e:#}");
                warn!(dispatch_id, case_id = %case_id, error = %error, "Worker failed, writing error signal");
                let mut failed = signal;
                failed.status = SignalStatus::Error;
                failed.error = Some(error.clone());
                failed.timestamp = Utc::now();
                if let Err(e) = write_signal(signal_path, &failed) {
                    warn!(dispatch_id, path = %signal_path.display(), error = %e, "Failed to write error signal");
                }
                Response::Failed {
                    dispatch_id,
                    case_id,
                    error,
                }
            }
        }
    }

    fn answer(&self, signal: &SignalRecord) -> Result<PathBuf> {
        let request_path = PathBuf::from(&signal.request_location);
        let raw = std::fs::read(&request_path)
            .with_context(|| format!("cannot read request {}", request_path.display()))?;
        let payload: serde_json::Value = serde_json::from_slice(&raw)
            .with_context(|| format!("request {} is not JSON", request_path.display()))?;

        let request = DispatchRequest::new(&signal.case_id, signal.stage, payload);
        let data = self.worker.produce(&request)?;

        let result_path = PathBuf::from(&signal.result_location);
        let envelope = ResultEnvelope {
            dispatch_id: signal.dispatch_id,
            data: Some(data),
        };
        write_json_atomic(&result_path, &envelope)
            .with_context(|| format!("cannot write result {}", result_path.display()))?;
        Ok(result_path)
    }

    /// Scan until `cancel` fires. Returns how many signals were answered.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<u64> {
        info!(
            watch_dir = %self.watch_dir.display(),
            worker = self.worker.name(),
            "Responder watching for signals"
        );
        let mut answered = 0u64;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for response in self.scan_once()? {
                        if matches!(response, Response::Answered { .. }) {
                            answered += 1;
                        }
                    }
                }
            }
        }
        info!(answered, "Responder stopped");
        Ok(answered)
    }
}

/// Every `signal.json` below `dir`; a missing directory has none
pub fn find_signals(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("cannot list {}", current.display())),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().is_some_and(|n| n == SIGNAL_FILE) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::ScriptedWorker;
    use crate::scenario::Scenario;
    use rca_coordination::Stage;

    struct Broken;

    impl Worker for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn produce(&self, _request: &DispatchRequest) -> anyhow::Result<serde_json::Value> {
            anyhow::bail!("model unavailable")
        }
    }

    fn waiting_signal(dir: &Path, dispatch_id: u64) -> PathBuf {
        let case_dir = dir.join("C1");
        let request = case_dir.join("recall.request.json");
        write_json_atomic(&request, &serde_json::json!({"case_id": "C1"})).unwrap();
        let signal = SignalRecord {
            status: SignalStatus::Waiting,
            dispatch_id,
            case_id: "C1".to_string(),
            stage: Stage::Recall,
            request_location: request.display().to_string(),
            result_location: case_dir.join("recall.result.json").display().to_string(),
            timestamp: Utc::now(),
            error: None,
        };
        let path = case_dir.join(SIGNAL_FILE);
        write_signal(&path, &signal).unwrap();
        path
    }

    fn scripted() -> Arc<dyn Worker> {
        let scenario = Scenario::from_json_str(r#"{"name":"t","cases":[{"id":"C1"}]}"#).unwrap();
        Arc::new(ScriptedWorker::from_scenario(&scenario).unwrap())
    }

    #[test]
    fn test_answers_once_per_dispatch_id() {
        let dir = tempfile::tempdir().unwrap();
        waiting_signal(dir.path(), 7);
        let mut responder = Responder::new(dir.path(), scripted(), Duration::from_millis(10));

        let first = responder.scan_once().unwrap();
        assert_eq!(
            first,
            vec![Response::Answered {
                dispatch_id: 7,
                case_id: "C1".to_string()
            }]
        );
        let raw = std::fs::read(dir.path().join("C1/recall.result.json")).unwrap();
        let envelope: ResultEnvelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(envelope.dispatch_id, 7);
        assert_eq!(envelope.data.unwrap()["match"], false);

        assert!(responder.scan_once().unwrap().is_empty());

        // Same path, new dispatch id: answered again
        waiting_signal(dir.path(), 8);
        assert_eq!(responder.scan_once().unwrap().len(), 1);
    }

    #[test]
    fn test_worker_failure_writes_error_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = waiting_signal(dir.path(), 3);
        let mut responder = Responder::new(dir.path(), Arc::new(Broken), Duration::from_millis(10));

        let responses = responder.scan_once().unwrap();
        assert!(matches!(&responses[0], Response::Failed { dispatch_id: 3, error, .. } if error.contains("model unavailable")));

        let signal = read_signal(&path).unwrap().unwrap();
        assert_eq!(signal.status, SignalStatus::Error);
        assert_eq!(signal.dispatch_id, 3);
        assert!(!dir.path().join("C1/recall.result.json").exists());
    }

    #[test]
    fn test_ignores_non_waiting_and_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = waiting_signal(dir.path(), 1);
        let mut signal = read_signal(&path).unwrap().unwrap();
        signal.status = SignalStatus::Processing;
        write_signal(&path, &signal).unwrap();

        let mut responder = Responder::new(dir.path(), scripted(), Duration::from_millis(10));
        assert!(responder.scan_once().unwrap().is_empty());

        let mut absent = Responder::new(dir.path().join("nope"), scripted(), Duration::from_millis(10));
        assert!(absent.scan_once().unwrap().is_empty());
    }
}
