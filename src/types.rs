//! Data model shared by the provider, the monitors and the request layer.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// One per-tick measurement of a monitored process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Local>,
    pub pid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "cpu_pct")]
    pub cpu_percent: f64,
    #[serde(rename = "rss_bytes")]
    pub resident_memory_bytes: u64,
    pub alive: bool,
}

impl MetricSample {
    /// Sample recorded for a process that is no longer running.
    pub fn dead(pid: u32, name: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            pid,
            name: name.into(),
            cpu_percent: 0.0,
            resident_memory_bytes: 0,
            alive: false,
        }
    }

    pub fn resident_memory_mb(&self) -> f64 {
        self.resident_memory_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Exit,
    CpuThreshold,
    MemThreshold,
    Restart,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Exit => "exit",
            Self::CpuThreshold => "cpu_threshold",
            Self::MemThreshold => "mem_threshold",
            Self::Restart => "restart",
        };
        f.write_str(label)
    }
}

/// Something the monitor decided or observed. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Local>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub pid: u32,
    #[serde(default)]
    pub name: String,
    pub message: String,
}

impl Event {
    pub fn new(kind: EventKind, pid: u32, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            kind,
            pid,
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Fleet target settings supplied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    #[serde(rename = "pid", default)]
    pub process_id: u32,
    /// OS process name; also used to re-resolve the PID after a restart.
    #[serde(rename = "name", default)]
    pub display_name: String,
    #[serde(default)]
    pub alias: String,
    #[serde(rename = "restart_cmd", default)]
    pub restart_command: String,
    #[serde(default)]
    pub auto_restart: bool,
    /// CPU percent; 0 disables the rule.
    #[serde(default)]
    pub cpu_threshold: f64,
    /// Resident memory in MiB; 0 disables the rule.
    #[serde(default)]
    pub mem_threshold_mb: f64,
    #[serde(default = "default_exceed_count")]
    pub cpu_exceed_count: u32,
    #[serde(default = "default_exceed_count")]
    pub mem_exceed_count: u32,
    /// 0 falls back to the fixed restart cooldown.
    #[serde(rename = "restart_cooldown_secs", default)]
    pub restart_cooldown_seconds: u64,
}

fn default_exceed_count() -> u32 {
    5
}

impl TargetConfig {
    pub fn new(process_id: u32) -> Self {
        Self {
            process_id,
            display_name: String::new(),
            alias: String::new(),
            restart_command: String::new(),
            auto_restart: false,
            cpu_threshold: 0.0,
            mem_threshold_mb: 0.0,
            cpu_exceed_count: default_exceed_count(),
            mem_exceed_count: default_exceed_count(),
            restart_cooldown_seconds: 0,
        }
    }

    /// Label for logs: alias when set, otherwise the process name.
    pub fn label(&self) -> &str {
        if self.alias.is_empty() {
            &self.display_name
        } else {
            &self.alias
        }
    }
}

/// Single-target monitor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(default)]
    pub cpu_threshold: f64,
    #[serde(default = "default_exceed_count")]
    pub cpu_exceed_count: u32,
    #[serde(default)]
    pub mem_threshold_mb: f64,
    #[serde(default = "default_exceed_count")]
    pub mem_exceed_count: u32,
    #[serde(rename = "restart_cmd", default)]
    pub restart_command: String,
    #[serde(default)]
    pub metrics_buffer_len: usize,
    #[serde(default)]
    pub events_buffer_len: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            pid: None,
            process_name: None,
            cpu_threshold: 0.0,
            cpu_exceed_count: default_exceed_count(),
            mem_threshold_mb: 0.0,
            mem_exceed_count: default_exceed_count(),
            restart_command: String::new(),
            metrics_buffer_len: 0,
            events_buffer_len: 0,
            log_file: None,
        }
    }
}

/// One row of a full process enumeration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub cpu_pct: f64,
    pub rss_bytes: u64,
    pub vms: u64,
    pub paged_pool: u64,
    pub non_paged_pool: u64,
    pub status: String,
    pub username: String,
    pub num_fds: u32,
    pub disk_io: f64,
    pub disk_read_rate: f64,
    pub disk_write_rate: f64,
    pub uptime_secs: u64,
    pub cmdline: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f64,
    pub cpu_cores: usize,
    pub memory_total: u64,
    pub memory_used: u64,
    pub memory_percent: f64,
    pub net_bytes_recv: u64,
    pub net_bytes_sent: u64,
    pub net_recv_rate: f64,
    pub net_send_rate: f64,
}

/// Single-target monitor status.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub running: bool,
    pub target_pid: u32,
    pub target_name: String,
    pub awaiting_rebind: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_metric: Option<MetricSample>,
    pub config: MonitorConfig,
}

/// Fleet target status including its rule counters.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub config: TargetConfig,
    pub consecutive_cpu_exceed: u32,
    pub consecutive_mem_exceed: u32,
    pub exit_reported: bool,
    pub awaiting_rebind: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sample: Option<MetricSample>,
}
