//! In-memory provider driven by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::Local;

use super::MetricsProvider;
use crate::error::{AppError, Result};
use crate::types::{MetricSample, ProcessInfo, SystemMetrics};

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    alive: bool,
    cpu: f64,
    rss: u64,
}

#[derive(Debug, Default)]
struct Script {
    processes: BTreeMap<u32, FakeProcess>,
    kills: Vec<u32>,
    restarts: Vec<String>,
    /// Process started by the next restart command.
    spawn_on_restart: Option<(u32, String)>,
    fail_restart: bool,
}

#[derive(Debug, Default)]
pub(crate) struct ScriptedProvider {
    script: Mutex<Script>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut script)
    }

    pub fn add_process(&self, pid: u32, name: &str) {
        self.with(|s| {
            s.processes.insert(
                pid,
                FakeProcess {
                    name: name.to_string(),
                    alive: true,
                    cpu: 0.0,
                    rss: 0,
                },
            );
        });
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        self.with(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.alive = alive;
            }
        });
    }

    pub fn set_cpu(&self, pid: u32, cpu: f64) {
        self.with(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.cpu = cpu;
            }
        });
    }

    pub fn set_rss(&self, pid: u32, rss: u64) {
        self.with(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.rss = rss;
            }
        });
    }

    pub fn spawn_on_restart(&self, pid: u32, name: &str) {
        self.with(|s| s.spawn_on_restart = Some((pid, name.to_string())));
    }

    pub fn fail_restarts(&self) {
        self.with(|s| s.fail_restart = true);
    }

    pub fn kills(&self) -> Vec<u32> {
        self.with(|s| s.kills.clone())
    }

    pub fn restarts(&self) -> Vec<String> {
        self.with(|s| s.restarts.clone())
    }
}

impl MetricsProvider for ScriptedProvider {
    fn find_all_pids_by_name(&self, name: &str) -> Result<Vec<u32>> {
        Ok(self.with(|s| {
            s.processes
                .iter()
                .filter(|(_, p)| p.alive && p.name == name)
                .map(|(pid, _)| *pid)
                .collect()
        }))
    }

    fn get_metrics(&self, pid: u32) -> Result<MetricSample> {
        self.with(|s| match s.processes.get(&pid) {
            Some(p) if p.alive => Ok(MetricSample {
                timestamp: Local::now(),
                pid,
                name: p.name.clone(),
                cpu_percent: p.cpu,
                resident_memory_bytes: p.rss,
                alive: true,
            }),
            _ => Err(AppError::not_alive(pid)),
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.with(|s| s.processes.get(&pid).is_some_and(|p| p.alive))
    }

    fn kill_process(&self, pid: u32) -> Result<()> {
        self.with(|s| {
            s.kills.push(pid);
            match s.processes.get_mut(&pid) {
                Some(p) => {
                    p.alive = false;
                    Ok(())
                }
                None => Err(AppError::kill_failed(pid, "no such process")),
            }
        })
    }

    fn execute_restart(&self, command: &str) -> Result<()> {
        self.with(|s| {
            s.restarts.push(command.to_string());
            if s.fail_restart {
                return Err(AppError::restart_failed(command, "scripted failure"));
            }
            if let Some((pid, name)) = s.spawn_on_restart.take() {
                s.processes.insert(
                    pid,
                    FakeProcess {
                        name,
                        alive: true,
                        cpu: 0.0,
                        rss: 0,
                    },
                );
            }
            Ok(())
        })
    }

    fn list_all_processes(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self.with(|s| {
            s.processes
                .iter()
                .filter(|(_, p)| p.alive)
                .map(|(pid, p)| ProcessInfo {
                    pid: *pid,
                    name: p.name.clone(),
                    cpu_pct: p.cpu,
                    rss_bytes: p.rss,
                    ..Default::default()
                })
                .collect()
        }))
    }

    fn get_system_metrics(&self) -> Result<SystemMetrics> {
        Ok(SystemMetrics {
            cpu_cores: 1,
            ..Default::default()
        })
    }
}
