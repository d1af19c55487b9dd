//! RCA worker side
//!
//! Everything that answers the coordination engine's requests:
//! - [`workers`]: scripted and keyword worker strategies
//! - [`responder`]: the file-signal responder loop
//! - [`scenario`]: scenario files naming cases and canned artifacts
//! - [`runner`]: drive a scenario through a chosen transport
//! - [`config`]: agent configuration resolved from file, env and flags

pub mod config;
pub mod responder;
pub mod runner;
pub mod scenario;
pub mod workers;

pub use config::{AgentsConfig, WorkerKind};
pub use responder::Responder;
pub use runner::{build_stepper, pipeline_graph, run_scenario, serve_session, ScenarioRun, Transport};
pub use scenario::Scenario;
