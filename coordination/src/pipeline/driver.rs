//! Case Driver
//!
//! Runs cases to completion against a dispatcher.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::error::{PipelineError, PipelineResult};
use super::stage::Stage;
use super::state::{CaseState, CaseStatus};
use super::stepper::{PipelineStepper, StepOutcome};
use crate::dispatch::SharedDispatcher;

/// Final outcome of one case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case_id: String,
    pub final_stage: Stage,
    pub status: CaseStatus,
    pub path: Vec<Stage>,
    pub rules: Vec<String>,
    pub loop_counts: BTreeMap<String, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CaseReport {
    fn from_state(state: &CaseState) -> Self {
        Self {
            case_id: state.case_id.clone(),
            final_stage: state.current_stage,
            status: state.status,
            path: state.path(),
            rules: state.matched_rules(),
            loop_counts: state.loop_counts.clone(),
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a multi-case run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub cases: Vec<CaseReport>,
}

impl RunReport {
    pub fn completed(&self) -> usize {
        self.cases.iter().filter(|c| c.status == CaseStatus::Done).count()
    }

    pub fn failed(&self) -> usize {
        self.cases.iter().filter(|c| !c.is_ok()).count()
    }

    pub fn case(&self, case_id: &str) -> Option<&CaseReport> {
        self.cases.iter().find(|c| c.case_id == case_id)
    }

    pub fn summary(&self) -> String {
        format!(
            "{} cases: {} done, {} failed",
            self.cases.len(),
            self.completed(),
            self.failed()
        )
    }
}

pub struct CaseDriver {
    stepper: Arc<PipelineStepper>,
    dispatcher: SharedDispatcher,
}

impl CaseDriver {
    pub fn new(stepper: Arc<PipelineStepper>, dispatcher: SharedDispatcher) -> Self {
        Self {
            stepper,
            dispatcher,
        }
    }

    pub fn stepper(&self) -> &Arc<PipelineStepper> {
        &self.stepper
    }

    /// Step, dispatch, record, repeat until the case is Done
    pub async fn drive(&self, case_id: &str) -> PipelineResult<CaseState> {
        loop {
            let request = match self.stepper.run_step(case_id)? {
                StepOutcome::Done(state) => return Ok(state),
                StepOutcome::Pending(request) => request,
            };
            let stage = request.stage;
            let bytes = self
                .dispatcher
                .dispatch(request.clone())
                .await
                .map_err(|e| PipelineError::dispatch(case_id, stage, e))?;
            self.stepper.submit_artifact(case_id, stage, &bytes)?;

            if let Some(finalizer) = self.dispatcher.finalizer() {
                if let Err(e) = finalizer.mark_done(&request) {
                    warn!(case_id, stage = %stage, error = %e, "Failed to mark dispatch done");
                }
            }
        }
    }

    /// Drive every case, at most `parallelism` at a time
    pub async fn run_cases(self: Arc<Self>, case_ids: &[String], parallelism: usize) -> RunReport {
        let permits = Arc::new(Semaphore::new(parallelism.max(1)));
        let mut tasks = JoinSet::new();

        for (index, case_id) in case_ids.iter().cloned().enumerate() {
            let driver = Arc::clone(&self);
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = driver.drive(&case_id).await;
                (index, case_id, result)
            });
        }

        let mut slots: Vec<Option<CaseReport>> = vec![None; case_ids.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, _, Ok(state))) => slots[index] = Some(CaseReport::from_state(&state)),
                Ok((index, case_id, Err(e))) => {
                    error!(case_id = %case_id, error = %e, "Case failed");
                    slots[index] = Some(self.failed_report(&case_id, &e));
                }
                Err(e) => error!(error = %e, "Case task panicked"),
            }
        }

        let cases = slots
            .into_iter()
            .zip(case_ids)
            .map(|(slot, case_id)| {
                slot.unwrap_or_else(|| CaseReport {
                    case_id: case_id.clone(),
                    final_stage: Stage::Init,
                    status: CaseStatus::Running,
                    path: Vec::new(),
                    rules: Vec::new(),
                    loop_counts: BTreeMap::new(),
                    error: Some("case task did not complete".to_string()),
                })
            })
            .collect();
        let report = RunReport { cases };
        info!(summary = %report.summary(), "Run finished");
        report
    }

    fn failed_report(&self, case_id: &str, e: &PipelineError) -> CaseReport {
        let mut report = match self.stepper.state(case_id) {
            Ok(Some(state)) => CaseReport::from_state(&state),
            _ => CaseReport::from_state(&CaseState::new(case_id)),
        };
        report.error = Some(e.to_string());
        report
    }
}
