//! Dispatch error types

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::Stage;

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors raised by the broker and the transports built on it
#[derive(Error, Debug)]
pub enum DispatchError {
    /// Submit for an id the broker never issued
    #[error("unknown dispatch id {0}")]
    UnknownId(u64),

    /// Submit for an id retired so long ago its outcome is no longer tracked
    #[error("dispatch id {0} expired")]
    Expired(u64),

    /// Second submit for an id whose result was already delivered
    #[error("dispatch id {0} already submitted")]
    AlreadySubmitted(u64),

    /// Governing cancellation fired, or the waiting caller went away
    #[error("dispatch cancelled{}", .dispatch_id.map(|id| format!(" (dispatch id {id})")).unwrap_or_default())]
    Cancelled { dispatch_id: Option<u64> },

    /// The broker was aborted; permanent
    #[error("dispatcher aborted: {reason}")]
    Aborted { reason: String },

    #[error("timed out after {elapsed:?} waiting for dispatch {dispatch_id} (case {case_id}, stage {stage})")]
    Timeout {
        dispatch_id: u64,
        case_id: String,
        stage: Stage,
        elapsed: Duration,
    },

    /// Too many consecutive results carrying another dispatch's id
    #[error("dispatch {dispatch_id}: {streak} consecutive stale results at {path}")]
    StaleTolerance {
        dispatch_id: u64,
        streak: u32,
        path: PathBuf,
    },

    /// The worker side reported failure through the signal record
    #[error("responder reported error for dispatch {dispatch_id}: {message}")]
    Responder { dispatch_id: u64, message: String },

    #[error("malformed result for dispatch {dispatch_id}: {message}")]
    MalformedResult { dispatch_id: u64, message: String },

    #[error("empty result for dispatch {dispatch_id}")]
    EmptyResult { dispatch_id: u64 },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An in-process worker failed to produce an artifact
    #[error("worker {worker} failed on case {case_id} at {stage}: {message}")]
    Worker {
        worker: String,
        case_id: String,
        stage: Stage,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    pub fn cancelled(dispatch_id: u64) -> Self {
        Self::Cancelled {
            dispatch_id: Some(dispatch_id),
        }
    }

    /// Whether a fresh dispatch of the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled { .. } | Self::StaleTolerance { .. } | Self::Io(_)
        )
    }

    /// Errors caused by the submitting party rather than the broker
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownId(_)
                | Self::Expired(_)
                | Self::AlreadySubmitted(_)
                | Self::MalformedResult { .. }
                | Self::EmptyResult { .. }
                | Self::InvalidRequest(_)
        )
    }
}
