//! reqpacer configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::SchedulerConfig;

/// Main reqpacer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level", skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,

    /// Dispatch rate settings
    pub scheduler: SchedulerConfig,

    /// Demo workload settings
    pub demo: DemoConfig,
}

impl Config {
    /// Load the configuration at `config_path`, or the first discovered one
    ///
    /// A discovered file that exists but fails to load is an error, the same
    /// as an explicit one. Defaults apply only when no file is found.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        match Self::locate(config_path) {
            Some(path) => {
                Self::load_from_file(&path).with_context(|| format!("Failed to load config from {}", path.display()))
            }
            None => Ok(Self::default()),
        }
    }

    /// The file [`Config::load`] reads, if any
    ///
    /// An explicit path is returned as is. Otherwise `./.reqpacer.yml` is
    /// tried, then `<config dir>/reqpacer/reqpacer.yml`.
    pub fn locate(config_path: Option<&PathBuf>) -> Option<PathBuf> {
        if let Some(path) = config_path {
            return Some(path.clone());
        }
        Self::search_paths().into_iter().find(|path| path.exists())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".reqpacer.yml")];
        paths.extend(dirs::config_dir().map(|dir| dir.join("reqpacer").join("reqpacer.yml")));
        paths
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        config.scheduler.validate().context("Invalid scheduler section")?;
        Ok(config)
    }
}

/// Demo workload: worker threads querying a simulated service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Total queries to submit
    pub requests: usize,

    /// Worker threads submitting concurrently
    pub workers: usize,

    /// Time one query takes on the simulated service
    #[serde(rename = "query-ms")]
    pub query_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            requests: 100,
            workers: 5,
            query_ms: 100,
        }
    }
}

impl DemoConfig {
    pub fn query_time(&self) -> Duration {
        Duration::from_millis(self.query_ms)
    }
}
