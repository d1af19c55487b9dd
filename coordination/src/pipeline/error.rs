//! Pipeline error types

use std::path::PathBuf;
use thiserror::Error;

use super::stage::Stage;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Errors raised by the stepper, the case store and artifact parsing
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A submitted artifact is not valid for its stage
    #[error("malformed {stage} artifact for case {case_id}: {message}")]
    MalformedArtifact {
        case_id: String,
        stage: Stage,
        message: String,
    },

    /// Submission targeted a stage the case is not waiting on
    #[error("case {case_id} is at {current}, cannot accept artifact for {submitted}")]
    StageMismatch {
        case_id: String,
        current: Stage,
        submitted: Stage,
    },

    /// Case state could not be read or written
    #[error("persistence error for case {case_id} at {path}: {source}")]
    Persistence {
        case_id: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Persisted state is not valid JSON
    #[error("corrupt state for case {case_id}: {message}")]
    CorruptState { case_id: String, message: String },

    /// Case id cannot be used as a storage key
    #[error("invalid case id: {0:?}")]
    InvalidCaseId(String),

    /// The heuristic graph definition is invalid
    #[error("invalid heuristic graph: {0}")]
    InvalidGraph(String),

    /// Dispatching a stage request failed
    #[error("dispatch failed for case {case_id} at {stage}: {source}")]
    Dispatch {
        case_id: String,
        stage: Stage,
        #[source]
        source: crate::dispatch::DispatchError,
    },

    /// A case kept stepping without reaching a pause or Done
    #[error("case {case_id} exceeded {limit} transitions in one step")]
    RunawayCase { case_id: String, limit: usize },
}

impl PipelineError {
    pub fn malformed(case_id: &str, stage: Stage, message: impl Into<String>) -> Self {
        Self::MalformedArtifact {
            case_id: case_id.to_string(),
            stage,
            message: message.into(),
        }
    }

    pub fn persistence(case_id: &str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            case_id: case_id.to_string(),
            path: path.into(),
            source,
        }
    }

    pub fn dispatch(case_id: &str, stage: Stage, source: crate::dispatch::DispatchError) -> Self {
        Self::Dispatch {
            case_id: case_id.to_string(),
            stage,
            source,
        }
    }

    /// Whether retrying the step may succeed.
    ///
    /// Persistence errors leave state untouched, and dispatch timeouts or
    /// cancellations happen before any mutation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Persistence { .. } => true,
            Self::Dispatch { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}
