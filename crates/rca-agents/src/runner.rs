//! Drive a scenario end to end through one of the transports

use anyhow::{Context, Result};
use clap::ValueEnum;
use rca_coordination::dispatch::file::{finalize_signals, FileDispatcher};
use rca_coordination::dispatch::tracking::TrackingSummary;
use rca_coordination::dispatch::{
    DispatchTracker, InlineDispatcher, InteractiveDispatcher, SharedDispatcher, TrackingDispatcher,
};
use rca_coordination::pipeline::{FileCaseStore, StoreHooks};
use rca_coordination::dispatch::Worker;
use rca_coordination::session::{NextStep, Session, SessionError};
use rca_coordination::{CaseDriver, HeuristicGraph, PipelineStepper, RunReport, Stage, StageArtifact};
use std::time::Duration;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentsConfig;
use crate::responder::Responder;
use crate::scenario::Scenario;
use crate::workers::build_worker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Call the worker in-process
    #[default]
    Inline,
    /// File signal/poll with an embedded responder
    File,
    /// Prompt on stdin/stdout for each result file
    Interactive,
}

/// The default graph with the configured thresholds
pub fn pipeline_graph(config: &AgentsConfig) -> Result<HeuristicGraph> {
    let graph = HeuristicGraph::default_graph(config.coordination.thresholds);
    graph.validate().context("default heuristic graph")?;
    Ok(graph)
}

/// Heuristic graph and file-backed store from `config`
pub fn build_stepper(config: &AgentsConfig) -> Result<PipelineStepper> {
    let coordination = &config.coordination;
    let graph = pipeline_graph(config)?;
    let store = Arc::new(FileCaseStore::new(&coordination.case_dir));
    Ok(PipelineStepper::new(Arc::new(graph), store)
        .with_hooks(logging_hooks())
        .with_config(coordination.stepper.clone()))
}

/// Hooks that surface the outcomes a persistence store would record
fn logging_hooks() -> StoreHooks {
    let mut hooks = StoreHooks::new();
    hooks.register(Stage::Investigate, |case_id: &str, _stage: Stage, artifact: &StageArtifact| -> anyhow::Result<()> {
        if let StageArtifact::Investigate(result) = artifact {
            info!(case_id, defect_type = %result.defect_type, convergence = result.convergence_score, "RCA candidate");
        }
        Ok(())
    });
    hooks.register(Stage::Review, |case_id: &str, _stage: Stage, artifact: &StageArtifact| -> anyhow::Result<()> {
        if let StageArtifact::Review(decision) = artifact {
            let verdict = decision
                .decision
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string());
            info!(case_id, verdict = %verdict, "Review recorded");
        }
        Ok(())
    });
    hooks
}

/// Outcome of a scenario run
#[derive(Debug, Clone)]
pub struct ScenarioRun {
    pub report: RunReport,
    pub tracking: TrackingSummary,
}

/// Run every case in `scenario` to completion
pub async fn run_scenario(
    config: &AgentsConfig,
    scenario: &Scenario,
    transport: Transport,
    parallelism: usize,
) -> Result<ScenarioRun> {
    let stepper = Arc::new(build_stepper(config)?);
    let worker = build_worker(config.worker, scenario)?;
    let tracker = DispatchTracker::new().shared();
    let case_ids = scenario.case_ids();

    info!(
        scenario = %scenario.name,
        cases = case_ids.len(),
        transport = ?transport,
        worker = worker.name(),
        "Running scenario"
    );

    let report = match transport {
        Transport::Inline => {
            let inner: SharedDispatcher = Arc::new(InlineDispatcher::new(worker));
            drive(stepper, inner, &tracker, &case_ids, parallelism).await
        }
        Transport::Interactive => {
            let inner: SharedDispatcher = Arc::new(InteractiveDispatcher::new(
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
                config.coordination.file.clone(),
            ));
            drive(stepper, inner, &tracker, &case_ids, parallelism).await
        }
        Transport::File => {
            let file = Arc::new(FileDispatcher::new(config.coordination.file.clone()));
            let watch_dir = match &config.coordination.file.signal_dir {
                Some(dir) => dir.clone(),
                None => config.watch_dir(),
            };
            let mut responder = Responder::new(watch_dir.clone(), worker, config.responder_poll());
            let cancel = CancellationToken::new();
            let responder_task = tokio::spawn({
                let cancel = cancel.clone();
                async move { responder.run(cancel).await }
            });

            let report = drive(stepper, file, &tracker, &case_ids, parallelism).await;

            cancel.cancel();
            let answered = responder_task
                .await
                .context("responder task panicked")??;
            let finalized = finalize_signals(&watch_dir).context("finalizing signals")?;
            info!(answered, finalized, "File transport finished");
            report
        }
    };

    Ok(ScenarioRun {
        report,
        tracking: tracker.summary(),
    })
}

async fn drive(
    stepper: Arc<PipelineStepper>,
    inner: SharedDispatcher,
    tracker: &Arc<DispatchTracker>,
    case_ids: &[String],
    parallelism: usize,
) -> RunReport {
    let dispatcher = Arc::new(TrackingDispatcher::new(inner, Arc::clone(tracker)));
    let driver = Arc::new(CaseDriver::new(stepper, dispatcher));
    driver.run_cases(case_ids, parallelism).await
}

/// Pull steps from a session and answer them with `worker` until every case
/// is done. Returns how many artifacts this worker submitted.
///
/// Results the capacity gate refuses are held and resubmitted after the next
/// pull; pulling either raises the observed concurrency or comes back empty,
/// and both open the gate.
pub async fn serve_session(
    session: &Session,
    worker: &dyn Worker,
    worker_id: &str,
    pull_timeout: Duration,
) -> Result<u64> {
    session.register_worker(worker_id, "stream");
    let mut submitted = 0u64;
    let mut held: Vec<(u64, String)> = Vec::new();
    loop {
        let mut still_held = Vec::new();
        for (dispatch_id, body) in held.drain(..) {
            match session.submit(dispatch_id, &body) {
                Ok(()) => submitted += 1,
                Err(e @ SessionError::CapacityGate { .. }) => {
                    debug!(worker_id, dispatch_id, reason = %e, "Submit held by capacity gate");
                    still_held.push((dispatch_id, body));
                }
                Err(e) => {
                    warn!(worker_id, dispatch_id, error = %e, "Submit rejected");
                    return Err(e.into());
                }
            }
        }
        held = still_held;

        let issued = match session.pull_next(pull_timeout).await? {
            NextStep::Step(issued) => issued,
            NextStep::Unavailable => continue,
            NextStep::Done => break,
        };
        let value = worker.produce(&issued.request).with_context(|| {
            format!(
                "worker {} failed on {} {}",
                worker.name(),
                issued.request.case_id,
                issued.request.stage
            )
        })?;
        held.push((issued.dispatch_id, serde_json::to_string(&value)?));
    }
    info!(worker_id, submitted, "Session worker finished");
    Ok(submitted)
}
