//! Coordination configuration
//!
//! Defaults come from [`Default`], a TOML file can override any subset, and
//! `RCA_*` environment variables override both.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::dispatch::file::FileDispatcherConfig;
use crate::pipeline::{Stage, StepperConfig, Thresholds};
use crate::session::SessionConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {key}: {value:?} ({message})")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for configuration loading
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Root of the file-backed case store
    pub case_dir: PathBuf,
    pub thresholds: Thresholds,
    pub stepper: StepperConfig,
    pub file: FileDispatcherConfig,
    pub session: SessionConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            case_dir: PathBuf::from(".rca/cases"),
            thresholds: Thresholds::default(),
            stepper: StepperConfig::default(),
            file: FileDispatcherConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> ConfigResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        message: e.to_string(),
    })
}

impl CoordinationConfig {
    pub fn from_toml_str(s: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> ConfigResult<Self> {
        let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Defaults overridden by `RCA_*` environment variables
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `RCA_*` overrides using `lookup` to read variables
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let th = &mut self.thresholds;
        if let Some(v) = lookup("RCA_RECALL_HIT") {
            th.recall_hit = parse_var("RCA_RECALL_HIT", &v)?;
        }
        if let Some(v) = lookup("RCA_RECALL_UNCERTAIN") {
            th.recall_uncertain = parse_var("RCA_RECALL_UNCERTAIN", &v)?;
        }
        if let Some(v) = lookup("RCA_CONVERGENCE_SUFFICIENT") {
            th.convergence_sufficient = parse_var("RCA_CONVERGENCE_SUFFICIENT", &v)?;
        }
        if let Some(v) = lookup("RCA_MAX_INVESTIGATE_LOOPS") {
            th.max_investigate_loops = parse_var("RCA_MAX_INVESTIGATE_LOOPS", &v)?;
        }
        if let Some(v) = lookup("RCA_CORRELATE_DUP") {
            th.correlate_dup = parse_var("RCA_CORRELATE_DUP", &v)?;
        }
        if let Some(v) = lookup("RCA_MAX_REASSESS_LOOPS") {
            th.max_reassess_loops = parse_var("RCA_MAX_REASSESS_LOOPS", &v)?;
        }

        if let Some(v) = lookup("RCA_CASE_DIR") {
            self.case_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RCA_WORK_DIR") {
            self.file.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("RCA_SIGNAL_DIR") {
            self.file.signal_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("RCA_POLL_INTERVAL_MS") {
            self.file.poll_interval_ms = parse_var("RCA_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("RCA_FILE_TIMEOUT_MS") {
            self.file.timeout_ms = parse_var("RCA_FILE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("RCA_MAX_STALE_REJECTS") {
            self.file.max_stale_rejects = parse_var("RCA_MAX_STALE_REJECTS", &v)?;
        }

        if let Some(v) = lookup("RCA_DESIRED_CAPACITY") {
            self.session.desired_capacity = parse_var("RCA_DESIRED_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("RCA_SESSION_TTL_MS") {
            self.session.ttl_ms = Some(parse_var("RCA_SESSION_TTL_MS", &v)?);
        }
        if let Some(v) = lookup("RCA_PARALLEL_CASES") {
            self.session.parallel_cases = parse_var("RCA_PARALLEL_CASES", &v)?;
        }
        if let Some(v) = lookup("RCA_DETERMINISTIC_STAGES") {
            self.stepper.deterministic_stages = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| parse_var::<Stage>("RCA_DETERMINISTIC_STAGES", s))
                .collect::<ConfigResult<_>>()?;
        }

        self.validate()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let th = &self.thresholds;
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(ConfigError::Invalid(format!("{name} must be within [0, 1], got {v}")))
            }
        };
        unit("recall_hit", th.recall_hit)?;
        unit("recall_uncertain", th.recall_uncertain)?;
        unit("convergence_sufficient", th.convergence_sufficient)?;
        unit("correlate_dup", th.correlate_dup)?;
        if th.recall_uncertain > th.recall_hit {
            return Err(ConfigError::Invalid(format!(
                "recall_uncertain ({}) must not exceed recall_hit ({})",
                th.recall_uncertain, th.recall_hit
            )));
        }
        if self.file.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".to_string()));
        }
        if self.session.parallel_cases == 0 {
            return Err(ConfigError::Invalid("parallel_cases must be positive".to_string()));
        }
        if self
            .stepper
            .deterministic_stages
            .iter()
            .any(|s| matches!(s, Stage::Init | Stage::Done))
        {
            return Err(ConfigError::Invalid(
                "INIT and DONE cannot be deterministic stages".to_string(),
            ));
        }
        Ok(())
    }
}
