//! Case State
//!
//! Per-case progress, loop counters and audit history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::stage::Stage;

/// Lifecycle of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    /// Stepper is actively evaluating
    Running,
    /// Waiting on an artifact for `current_stage`
    Paused,
    /// Reached Done
    Done,
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// One transition in a case's history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Stage that was completed
    pub stage: Stage,
    /// Stage the case moved to
    pub to_stage: Stage,
    /// Rule that chose the transition (`FALLBACK` when none matched)
    pub rule_id: String,
    pub explanation: String,
    pub timestamp: DateTime<Utc>,
}

/// Mutable record of one investigation's progress.
///
/// Owned by the stepper handling the case; nothing else writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseState {
    pub case_id: String,
    pub current_stage: Stage,
    pub status: CaseStatus,
    #[serde(default)]
    pub loop_counts: BTreeMap<String, u32>,
    /// Append-only
    #[serde(default)]
    pub history: Vec<StepRecord>,
    /// Context accumulated from rule actions
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Artifacts invalidated by a backward move but not yet removed
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stale_artifacts: Vec<Stage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaseState {
    pub fn new(case_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            case_id: case_id.into(),
            current_stage: Stage::Init,
            status: CaseStatus::Running,
            loop_counts: BTreeMap::new(),
            history: Vec::new(),
            context: serde_json::Map::new(),
            stale_artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, appending a history record
    pub fn advance(&mut self, to: Stage, rule_id: &str, explanation: &str) {
        let now = Utc::now();
        self.history.push(StepRecord {
            stage: self.current_stage,
            to_stage: to,
            rule_id: rule_id.to_string(),
            explanation: explanation.to_string(),
            timestamp: now,
        });
        self.current_stage = to;
        self.updated_at = now;
        if to.is_terminal() {
            self.status = CaseStatus::Done;
        }
    }

    /// Increment a named loop counter, returning the new count
    pub fn increment_loop(&mut self, key: &str) -> u32 {
        let count = self.loop_counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn loop_count(&self, key: &str) -> u32 {
        self.loop_counts.get(key).copied().unwrap_or(0)
    }

    /// True once `key` has reached `max`
    pub fn is_loop_exhausted(&self, key: &str, max: u32) -> bool {
        self.loop_count(key) >= max
    }

    pub fn merge_context(&mut self, additions: &serde_json::Map<String, serde_json::Value>) {
        for (k, v) in additions {
            self.context.insert(k.clone(), v.clone());
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == CaseStatus::Done
    }

    /// Stages visited, starting with Init
    pub fn path(&self) -> Vec<Stage> {
        let mut path = Vec::with_capacity(self.history.len() + 1);
        path.push(self.history.first().map(|r| r.stage).unwrap_or(self.current_stage));
        path.extend(self.history.iter().map(|r| r.to_stage));
        path
    }

    /// Rule ids in the order they fired
    pub fn matched_rules(&self) -> Vec<String> {
        self.history.iter().map(|r| r.rule_id.clone()).collect()
    }

    /// One-line summary for logging
    pub fn summary(&self) -> String {
        let loops: Vec<String> = self
            .loop_counts
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        format!(
            "case {} at {} ({}), {} transitions, loops [{}]",
            self.case_id,
            self.current_stage,
            self.status,
            self.history.len(),
            loops.join(", ")
        )
    }
}
