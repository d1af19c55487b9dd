//! RCA Coordination Library
//!
//! This library provides the execution engine for multi-stage root-cause
//! analysis of CI failures:
//! - A heuristic stage graph that decides where a case goes next
//! - A pipeline stepper that persists case state and pauses for artifacts
//! - A correlation-id dispatch broker shared by many dispatchers and workers
//! - Transports: in-process, interactive, file signal/poll and batch
//! - Session supervision with a capacity gate and an inactivity watchdog
//!
//! # Flow
//!
//! ```text
//! stepper.run_step ──► Pending(request) ──► dispatcher.dispatch ──► worker
//!        ▲                                                            │
//!        └──────────── stepper.submit_artifact ◄── result bytes ◄─────┘
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod atomic_file;
pub mod config;
pub mod dispatch;
pub mod pipeline;
pub mod session;

pub use config::{ConfigError, CoordinationConfig};
pub use dispatch::{
    DispatchError, DispatchRequest, DispatchResult, Dispatcher, IssuedRequest, MuxDispatcher,
    SharedDispatcher,
};
pub use pipeline::{
    CaseDriver, CaseState, HeuristicGraph, PipelineError, PipelineResult, PipelineStepper,
    RunReport, Stage, StageArtifact, StepOutcome, Thresholds,
};
pub use session::{NextStep, Session, SessionConfig, SessionError, SessionRegistry};
