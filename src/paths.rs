//! Centralized path utilities for the agent.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Root data directory (~/.monitor_agent). Falls back to the working directory
/// when no home directory is known.
pub fn get_data_dir() -> PathBuf {
    match dirs::home_dir() {
        Some(home) => home.join(".monitor_agent"),
        None => PathBuf::from(".monitor_agent"),
    }
}

/// Get the path to the config file.
pub fn config_path() -> PathBuf {
    get_data_dir().join("config.toml")
}

/// Default directory for JSONL output and the agent log.
pub fn default_log_dir() -> PathBuf {
    get_data_dir().join("logs")
}

/// Ensure the data directory and `log_dir` exist.
pub fn ensure_data_dirs(log_dir: &Path) -> Result<()> {
    for dir in [get_data_dir().as_path(), log_dir] {
        fs::create_dir_all(dir)
            .map_err(|e| AppError::io(format!("Failed to create {}: {}", dir.display(), e)))?;
    }
    Ok(())
}
