//! Session
//!
//! Background case driver plus the worker-facing pull/submit surface.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{SessionError, SessionResult};
use super::signal_bus::{SharedSignalBus, Signal, SignalBus};
use crate::dispatch::mux::SharedMux;
use crate::dispatch::{DispatchError, IssuedRequest, MuxDispatcher};
use crate::pipeline::{CaseDriver, PipelineStepper, RunReport, Stage, StageArtifact};

const AGENT_SERVER: &str = "server";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum concurrency the worker pool must demonstrate before submitting
    pub desired_capacity: usize,
    /// Abort after this long without pull or submit activity
    pub ttl_ms: Option<u64>,
    /// Cases driven concurrently
    pub parallel_cases: usize,
    /// Per-dispatch deadline inside the broker
    pub dispatch_timeout_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            desired_capacity: 1,
            ttl_ms: None,
            parallel_cases: 1,
            dispatch_timeout_ms: None,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Option<Duration> {
        self.ttl_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Done,
    Error,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Done => write!(f, "done"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Answer to `pull_next`
#[derive(Debug, Clone, PartialEq)]
pub enum NextStep {
    Step(IssuedRequest),
    /// Every case has finished
    Done,
    /// Nothing to hand out within the timeout
    Unavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<RunReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub signals: usize,
}

/// Concurrency bookkeeping for the capacity gate and TTL watchdog
struct Activity {
    /// Peak in-flight since in-flight last dropped to zero
    batch_peak: usize,
    session_peak: usize,
    pullers: usize,
    peak_pullers: usize,
    /// Set when a pull found nothing to hand out; the pool cannot grow further
    gate_exempt: bool,
    last_activity: Instant,
    /// Steps handed out and still awaited by the broker; its size is the in-flight count
    issued: HashMap<u64, (String, Stage)>,
    workers: BTreeMap<String, String>,
}

struct Outcome {
    status: SessionStatus,
    report: Option<RunReport>,
    error: Option<String>,
}

pub struct Session {
    id: String,
    config: SessionConfig,
    mux: SharedMux,
    bus: SharedSignalBus,
    cancel: CancellationToken,
    finished: CancellationToken,
    activity: Mutex<Activity>,
    outcome: Mutex<Outcome>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Remove a surrounding markdown code fence (with optional language tag)
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

impl Session {
    /// Start driving `case_ids` in the background. Must be called inside a Tokio runtime.
    pub fn start(
        case_ids: Vec<String>,
        stepper: Arc<PipelineStepper>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let mut mux = MuxDispatcher::new(cancel.child_token());
        if let Some(ms) = config.dispatch_timeout_ms {
            mux = mux.with_dispatch_timeout(Duration::from_millis(ms));
        }
        let mux = mux.shared();

        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            config,
            mux: mux.clone(),
            bus: SignalBus::new().shared(),
            cancel,
            finished: CancellationToken::new(),
            activity: Mutex::new(Activity {
                batch_peak: 0,
                session_peak: 0,
                pullers: 0,
                peak_pullers: 0,
                gate_exempt: false,
                last_activity: Instant::now(),
                issued: HashMap::new(),
                workers: BTreeMap::new(),
            }),
            outcome: Mutex::new(Outcome {
                status: SessionStatus::Running,
                report: None,
                error: None,
            }),
        });

        session.bus.emit(
            Signal::new("session_started", AGENT_SERVER)
                .meta("session_id", &session.id)
                .meta("cases", case_ids.len()),
        );
        info!(
            session_id = %session.id,
            cases = case_ids.len(),
            desired_capacity = session.config.desired_capacity,
            "Session started"
        );

        let driver = Arc::new(CaseDriver::new(stepper, mux));
        let parallel = session.config.parallel_cases;
        let runner = Arc::clone(&session);
        tokio::spawn(async move {
            let report = driver.run_cases(&case_ids, parallel).await;
            runner.finish(report);
        });

        if let Some(ttl) = session.config.ttl() {
            let watchdog = Arc::clone(&session);
            tokio::spawn(async move { watchdog.watch_ttl(ttl).await });
        }

        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bus(&self) -> &SharedSignalBus {
        &self.bus
    }

    pub fn mux(&self) -> &SharedMux {
        &self.mux
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.outcome).status
    }

    pub fn is_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Error message of an errored session
    pub fn err(&self) -> Option<String> {
        lock(&self.outcome).error.clone()
    }

    fn finish(&self, report: RunReport) {
        {
            let mut outcome = lock(&self.outcome);
            if outcome.status == SessionStatus::Running {
                outcome.status = SessionStatus::Done;
            }
            info!(session_id = %self.id, status = %outcome.status, summary = %report.summary(), "Session finished");
            outcome.report = Some(report);
        }
        self.bus.emit(Signal::new("pipeline_done", AGENT_SERVER).meta("session_id", &self.id));
        self.finished.cancel();
        self.cancel.cancel();
        lock(&self.activity).issued.clear();
    }

    async fn watch_ttl(&self, ttl: Duration) {
        let tick = (ttl / 5).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = self.finished.cancelled() => return,
                _ = interval.tick() => {}
            }
            let idle = lock(&self.activity).last_activity.elapsed();
            if idle <= ttl {
                continue;
            }
            let reason = format!("session TTL expired: no activity for {idle:?}");
            warn!(session_id = %self.id, ?idle, ?ttl, "Session TTL expired, aborting");
            self.bus.emit(
                Signal::new("session_error", AGENT_SERVER)
                    .meta("session_id", &self.id)
                    .meta("error", &reason),
            );
            {
                let mut outcome = lock(&self.outcome);
                outcome.status = SessionStatus::Error;
                outcome.error = Some(reason.clone());
            }
            self.mux.abort(&reason);
            self.cancel.cancel();
            lock(&self.activity).issued.clear();
            return;
        }
    }

    fn touch(&self) {
        lock(&self.activity).last_activity = Instant::now();
    }

    /// Record an external worker joining the session
    pub fn register_worker(&self, worker_id: &str, mode: &str) {
        {
            let mut activity = lock(&self.activity);
            activity.workers.insert(worker_id.to_string(), mode.to_string());
            activity.last_activity = Instant::now();
        }
        self.bus.emit(
            Signal::new("worker_started", worker_id)
                .meta("worker_id", worker_id)
                .meta("mode", mode),
        );
    }

    /// Registered workers per mode
    pub fn worker_modes(&self) -> BTreeMap<String, usize> {
        let activity = lock(&self.activity);
        let mut modes = BTreeMap::new();
        for mode in activity.workers.values() {
            *modes.entry(mode.clone()).or_insert(0) += 1;
        }
        modes
    }

    fn terminal_result(&self) -> SessionResult<NextStep> {
        lock(&self.activity).gate_exempt = true;
        let outcome = lock(&self.outcome);
        match outcome.status {
            SessionStatus::Error => Err(SessionError::Aborted(
                outcome.error.clone().unwrap_or_else(|| "session errored".to_string()),
            )),
            _ => Ok(NextStep::Done),
        }
    }

    /// Hand the next pending step to the caller, waiting up to `timeout`
    pub async fn pull_next(&self, timeout: Duration) -> SessionResult<NextStep> {
        if self.status() != SessionStatus::Running {
            return self.terminal_result();
        }

        {
            let mut activity = lock(&self.activity);
            activity.pullers += 1;
            activity.peak_pullers = activity.peak_pullers.max(activity.pullers);
            activity.last_activity = Instant::now();
        }

        let pulled = tokio::select! {
            result = self.mux.pull_timeout(timeout) => result,
            _ = self.finished.cancelled() => Err(DispatchError::Cancelled { dispatch_id: None }),
        };

        let mut activity = lock(&self.activity);
        activity.pullers = activity.pullers.saturating_sub(1);
        activity.last_activity = Instant::now();

        match pulled {
            Ok(Some(issued)) => {
                self.prune_issued(&mut activity);
                activity.issued.insert(
                    issued.dispatch_id,
                    (issued.request.case_id.clone(), issued.request.stage),
                );
                let in_flight = activity.issued.len();
                activity.batch_peak = activity.batch_peak.max(in_flight);
                activity.session_peak = activity.session_peak.max(in_flight);
                drop(activity);
                self.bus.emit(
                    Signal::new("step_ready", AGENT_SERVER)
                        .case(&issued.request.case_id, issued.request.stage)
                        .meta("dispatch_id", issued.dispatch_id),
                );
                Ok(NextStep::Step(issued))
            }
            Ok(None) => {
                activity.gate_exempt = true;
                Ok(NextStep::Unavailable)
            }
            Err(DispatchError::Aborted { reason }) => Err(SessionError::Aborted(reason)),
            Err(DispatchError::Cancelled { .. }) => {
                drop(activity);
                self.terminal_result()
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Forget handed-out steps the broker stopped waiting on (timed out,
    /// cancelled or aborted), so they no longer count as in flight.
    fn prune_issued(&self, activity: &mut Activity) {
        let before = activity.issued.len();
        activity.issued.retain(|id, _| self.mux.is_pending(*id));
        let dropped = before - activity.issued.len();
        if dropped == 0 {
            return;
        }
        debug!(session_id = %self.id, dropped, "Released abandoned steps");
        if activity.issued.is_empty() {
            activity.batch_peak = 0;
            activity.gate_exempt = false;
        }
    }

    /// Steps handed out and not yet answered
    pub fn in_flight(&self) -> usize {
        let mut activity = lock(&self.activity);
        self.prune_issued(&mut activity);
        activity.issued.len()
    }

    /// Open when the pool has shown the desired concurrency, or cannot grow further
    pub fn check_capacity_gate(&self) -> SessionResult<()> {
        let desired = self.config.desired_capacity;
        let mut a = lock(&self.activity);
        self.prune_issued(&mut a);
        let open = desired <= 1
            || a.gate_exempt
            || a.batch_peak >= desired
            || a.session_peak >= desired
            || a.peak_pullers >= desired;
        if open {
            return Ok(());
        }
        Err(SessionError::CapacityGate {
            desired,
            batch_peak: a.batch_peak,
            session_peak: a.session_peak,
            peak_pullers: a.peak_pullers,
        })
    }

    /// Validate and route a worker's result for `dispatch_id`
    pub fn submit(&self, dispatch_id: u64, raw: &str) -> SessionResult<()> {
        let body = strip_code_fences(raw);
        serde_json::from_str::<serde_json::Value>(body).map_err(|e| {
            SessionError::InvalidArtifact {
                dispatch_id,
                message: e.to_string(),
            }
        })?;

        let issued = lock(&self.activity).issued.get(&dispatch_id).cloned();
        if let Some((_, stage)) = &issued {
            StageArtifact::parse(*stage, body.as_bytes())
                .map_err(|message| SessionError::InvalidArtifact { dispatch_id, message })?;
        }

        self.check_capacity_gate()?;
        self.touch();
        self.mux.submit(dispatch_id, body.as_bytes().to_vec())?;

        {
            let mut activity = lock(&self.activity);
            if activity.issued.remove(&dispatch_id).is_some() && activity.issued.is_empty() {
                activity.batch_peak = 0;
                activity.gate_exempt = false;
            }
        }

        let mut signal = Signal::new("artifact_submitted", AGENT_SERVER).meta("dispatch_id", dispatch_id);
        if let Some((case_id, stage)) = issued {
            signal = signal.case(&case_id, stage);
        }
        self.bus.emit(signal);
        debug!(session_id = %self.id, dispatch_id, "Artifact submitted");
        Ok(())
    }

    /// Snapshot of the session's status and, once finished, its report
    pub fn report(&self) -> SessionReport {
        let outcome = lock(&self.outcome);
        SessionReport {
            session_id: self.id.clone(),
            status: outcome.status,
            report: outcome.report.clone(),
            error: outcome.error.clone(),
            signals: self.bus.len(),
        }
    }

    /// Wait for the session to finish (bounded by `timeout`) and report
    pub async fn wait(&self, timeout: Duration) -> SessionReport {
        let _ = tokio::time::timeout(timeout, self.finished.cancelled()).await;
        self.report()
    }

    /// Cancel the session; outstanding pulls and dispatches are released
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}
