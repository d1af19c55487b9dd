//! Scenario files
//!
//! A scenario names a set of cases and, optionally, the artifacts a worker
//! should hand back for each stage. It is the input for `rca-agents run` and
//! the script for [`crate::workers::ScriptedWorker`].
//!
//! ```toml
//! name = "ptp-nightly"
//!
//! [[cases]]
//! id = "C1"
//! failure = "ptp4l holdover timeout after 60s"
//!
//! [cases.artifacts.F0_RECALL]
//! match = false
//! confidence = 0.1
//! ```
//!
//! An artifact given as an array is replayed in order across repeated
//! dispatches of the same stage (investigate loops); the last entry sticks.

use rca_coordination::Stage;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to read scenario {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse scenario {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("scenario has no cases")]
    Empty,

    #[error("duplicate case id {0}")]
    DuplicateCase(String),

    #[error("invalid case id {0:?}")]
    InvalidCaseId(String),

    #[error("case {case_id}: unknown stage key {key:?}")]
    UnknownStage { case_id: String, key: String },

    #[error("case {case_id}: stage {stage} never takes an artifact")]
    NotAWorkStage { case_id: String, stage: Stage },
}

pub type ScenarioResult<T> = Result<T, ScenarioError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioCase {
    pub id: String,
    /// Free text describing the failure; what the keyword worker classifies
    #[serde(default)]
    pub failure: String,
    /// Canned artifacts keyed by stage wire name or family name
    #[serde(default)]
    pub artifacts: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub cases: Vec<ScenarioCase>,
}

impl Scenario {
    /// Load from `path`; `.toml` files are TOML, everything else JSON
    pub fn load(path: &Path) -> ScenarioResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ScenarioError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        let parsed = if is_toml {
            Self::from_toml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        };
        parsed.map_err(|e| match e {
            ScenarioError::Parse { message, .. } => ScenarioError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    pub fn from_json_str(raw: &str) -> ScenarioResult<Self> {
        let scenario: Self = serde_json::from_str(raw).map_err(|e| ScenarioError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn from_toml_str(raw: &str) -> ScenarioResult<Self> {
        let scenario: Self = toml::from_str(raw).map_err(|e| ScenarioError::Parse {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn validate(&self) -> ScenarioResult<()> {
        if self.cases.is_empty() {
            return Err(ScenarioError::Empty);
        }
        let mut seen = HashSet::new();
        for case in &self.cases {
            let bad_id = case.id.is_empty()
                || case.id == "."
                || case.id == ".."
                || case.id.contains(['/', '\\']);
            if bad_id {
                return Err(ScenarioError::InvalidCaseId(case.id.clone()));
            }
            if !seen.insert(case.id.as_str()) {
                return Err(ScenarioError::DuplicateCase(case.id.clone()));
            }
            for key in case.artifacts.keys() {
                stage_key(&case.id, key)?;
            }
        }
        Ok(())
    }

    pub fn case_ids(&self) -> Vec<String> {
        self.cases.iter().map(|c| c.id.clone()).collect()
    }

    pub fn case(&self, case_id: &str) -> Option<&ScenarioCase> {
        self.cases.iter().find(|c| c.id == case_id)
    }
}

impl ScenarioCase {
    /// Canned artifacts with their keys resolved to stages
    pub fn stage_artifacts(&self) -> ScenarioResult<BTreeMap<Stage, Vec<serde_json::Value>>> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.artifacts {
            let stage = stage_key(&self.id, key)?;
            let script = match value {
                serde_json::Value::Array(items) => items.clone(),
                single => vec![single.clone()],
            };
            out.insert(stage, script);
        }
        Ok(out)
    }
}

fn stage_key(case_id: &str, key: &str) -> ScenarioResult<Stage> {
    let stage: Stage = key.parse().map_err(|_| ScenarioError::UnknownStage {
        case_id: case_id.to_string(),
        key: key.to_string(),
    })?;
    if !Stage::WORK.contains(&stage) {
        return Err(ScenarioError::NotAWorkStage {
            case_id: case_id.to_string(),
            stage,
        });
    }
    Ok(stage)
}
