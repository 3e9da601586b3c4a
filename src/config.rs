use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::monitor::FleetConfig;
use crate::paths::{config_path, default_log_dir};
use crate::types::{MonitorConfig, TargetConfig};

static CONFIG_CACHE: OnceLock<Arc<AgentConfig>> = OnceLock::new();

/// Agent settings. Read once at startup, never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_sample_interval")]
    pub sample_interval_secs: u64,
    #[serde(default = "default_metrics_buffer_len")]
    pub metrics_buffer_len: usize,
    #[serde(default = "default_events_buffer_len")]
    pub events_buffer_len: usize,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch: Option<MonitorConfig>,
}

fn default_sample_interval() -> u64 {
    1
}

fn default_metrics_buffer_len() -> usize {
    300
}

fn default_events_buffer_len() -> usize {
    100
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: default_sample_interval(),
            metrics_buffer_len: default_metrics_buffer_len(),
            events_buffer_len: default_events_buffer_len(),
            log_dir: default_log_dir(),
            log_level: default_log_level(),
            targets: Vec::new(),
            watch: None,
        }
    }
}

impl AgentConfig {
    pub fn fleet(&self) -> FleetConfig {
        FleetConfig {
            sample_interval_secs: self.sample_interval_secs,
            metrics_buffer_len: self.metrics_buffer_len,
            events_buffer_len: self.events_buffer_len,
        }
    }

    /// `log_level` as a filter; unknown names fall back to `Info`.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }
}

/// Parse the file at `path`. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        return Ok(AgentConfig::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| AppError::config(e.to_string()))
}

/// Load the agent config from its default location, once per process.
pub fn load_config() -> Result<Arc<AgentConfig>> {
    if let Some(config) = CONFIG_CACHE.get() {
        return Ok(Arc::clone(config));
    }
    let config = Arc::new(load_config_from(&config_path())?);
    Ok(Arc::clone(CONFIG_CACHE.get_or_init(|| config)))
}
