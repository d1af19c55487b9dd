//! Signal Bus
//!
//! Append-only log of session events.
//!
//! Observers poll with [`SignalBus::since`] using the last index they saw.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub ts: DateTime<Utc>,
    pub event: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
}

impl Signal {
    pub fn new(event: &str, agent: &str) -> Self {
        Self {
            ts: Utc::now(),
            event: event.to_string(),
            agent: agent.to_string(),
            case_id: None,
            stage: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn case(mut self, case_id: &str, stage: impl std::fmt::Display) -> Self {
        self.case_id = Some(case_id.to_string());
        self.stage = Some(stage.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.meta.insert(key.to_string(), value.to_string());
        self
    }
}

/// Shared reference to a SignalBus
pub type SharedSignalBus = Arc<SignalBus>;

#[derive(Debug, Default)]
pub struct SignalBus {
    signals: Mutex<Vec<Signal>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedSignalBus {
        Arc::new(self)
    }

    pub fn emit(&self, signal: Signal) {
        debug!(event = %signal.event, agent = %signal.agent, case_id = ?signal.case_id, "Signal emitted");
        self.signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(signal);
    }

    /// Signals at index `idx` and later
    pub fn since(&self, idx: usize) -> Vec<Signal> {
        let signals = self.signals.lock().unwrap_or_else(|p| p.into_inner());
        signals.get(idx..).map(<[Signal]>::to_vec).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.signals.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many signals carry `event`
    pub fn count(&self, event: &str) -> usize {
        self.signals
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|s| s.event == event)
            .count()
    }
}
