//! Session registry
//!
//! At most one running session per process.

use std::sync::{Arc, Mutex};
use tracing::info;

use super::error::{SessionError, SessionResult};
use super::supervisor::{Session, SessionConfig, SessionStatus};
use crate::pipeline::PipelineStepper;

#[derive(Default)]
pub struct SessionRegistry {
    current: Mutex<Option<Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a session unless one is still running
    pub fn start(
        &self,
        case_ids: Vec<String>,
        stepper: Arc<PipelineStepper>,
        config: SessionConfig,
    ) -> SessionResult<Arc<Session>> {
        let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = current.as_ref() {
            if existing.status() == SessionStatus::Running {
                return Err(SessionError::AlreadyRunning(existing.id().to_string()));
            }
            info!(session_id = existing.id(), "Replacing finished session");
        }
        let session = Session::start(case_ids, stepper, config);
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Look up the session by id
    pub fn get(&self, session_id: &str) -> SessionResult<Arc<Session>> {
        let current = self.current.lock().unwrap_or_else(|p| p.into_inner());
        match current.as_ref() {
            Some(session) if session.id() == session_id => Ok(Arc::clone(session)),
            _ => Err(SessionError::NotFound(session_id.to_string())),
        }
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}
