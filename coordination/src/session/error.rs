//! Session error types

use thiserror::Error;

use crate::dispatch::DispatchError;

/// Result type alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} is still running")]
    AlreadyRunning(String),

    #[error("invalid artifact for dispatch {dispatch_id}: {message}")]
    InvalidArtifact { dispatch_id: u64, message: String },

    /// The worker pool has not demonstrated the configured concurrency yet
    #[error(
        "capacity gate: desired capacity {desired}, observed batch peak {batch_peak}, \
         session peak {session_peak}, concurrent pullers {peak_pullers}; \
         pull more steps before submitting"
    )]
    CapacityGate {
        desired: usize,
        batch_peak: usize,
        session_peak: usize,
        peak_pullers: usize,
    },

    #[error("session aborted: {0}")]
    Aborted(String),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl SessionError {
    /// Whether the caller can fix the problem and try again
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidArtifact { .. } | Self::CapacityGate { .. })
    }
}
