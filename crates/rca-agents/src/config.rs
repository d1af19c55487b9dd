//! Agent configuration
//!
//! Resolution order: built-in defaults, then an optional TOML file for the
//! coordination settings, then `RCA_*` environment variables. CLI flags are
//! applied last by the binary.

use anyhow::{Context, Result};
use clap::ValueEnum;
use rca_coordination::CoordinationConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which worker strategy answers requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    /// Canned artifacts from the scenario, defaults elsewhere
    #[default]
    Scripted,
    /// Keyword classifier over each case's failure text
    Keyword,
}

#[derive(Debug, Clone)]
pub struct AgentsConfig {
    pub coordination: CoordinationConfig,
    pub worker: WorkerKind,
    /// How often the responder rescans for signals
    pub responder_poll_ms: u64,
    /// Directory the responder watches (None = the file transport work dir)
    pub watch_dir: Option<PathBuf>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            coordination: CoordinationConfig::default(),
            worker: WorkerKind::default(),
            responder_poll_ms: 200,
            watch_dir: None,
        }
    }
}

impl AgentsConfig {
    /// Resolve from an optional config file and the process environment
    pub fn resolve(config_path: Option<&Path>) -> Result<Self> {
        Self::resolve_with(config_path, |key| std::env::var(key).ok())
    }

    pub fn resolve_with<F>(config_path: Option<&Path>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut coordination = match config_path {
            Some(path) => CoordinationConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => CoordinationConfig::default(),
        };
        coordination
            .apply_overrides(&lookup)
            .context("applying RCA_* environment overrides")?;

        let mut config = Self {
            coordination,
            ..Self::default()
        };
        if let Some(v) = lookup("RCA_WORKER") {
            config.worker = WorkerKind::from_str(v.trim(), true)
                .map_err(|e| anyhow::anyhow!("invalid RCA_WORKER {v:?}: {e}"))?;
        }
        if let Some(v) = lookup("RCA_RESPONDER_POLL_MS") {
            config.responder_poll_ms = v
                .trim()
                .parse()
                .with_context(|| format!("invalid RCA_RESPONDER_POLL_MS {v:?}"))?;
        }
        if let Some(v) = lookup("RCA_WATCH_DIR") {
            config.watch_dir = Some(PathBuf::from(v));
        }
        if config.responder_poll_ms == 0 {
            anyhow::bail!("responder poll interval must be positive");
        }
        Ok(config)
    }

    pub fn responder_poll(&self) -> Duration {
        Duration::from_millis(self.responder_poll_ms)
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.watch_dir
            .clone()
            .unwrap_or_else(|| self.coordination.file.work_dir.clone())
    }
}
