//! RCA pipeline: stages, artifacts, case state and the heuristic stepper

pub mod artifact;
pub mod driver;
pub mod error;
pub mod heuristics;
pub mod hooks;
pub mod stage;
pub mod state;
pub mod stepper;
pub mod store;

pub use artifact::{ReviewVerdict, StageArtifact};
pub use driver::{CaseDriver, CaseReport, RunReport};
pub use error::{PipelineError, PipelineResult};
pub use heuristics::{Action, Decision, HeuristicGraph, HeuristicRule, Thresholds, FALLBACK_RULE_ID};
pub use hooks::{StoreEffect, StoreHooks};
pub use stage::Stage;
pub use state::{CaseState, CaseStatus, StepRecord};
pub use stepper::{PipelineStepper, StepOutcome, StepperConfig};
pub use store::{CaseStore, FileCaseStore, MemoryCaseStore, SharedCaseStore};
