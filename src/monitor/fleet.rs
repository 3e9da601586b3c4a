//! Multi-target monitor sharing one sampling tick.
//!
//! Target map and counters sit behind one coarse lock; each target's history has its
//! own lock so readers never wait on a tick. Target counts are expected in the tens.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    collect_sample, rebind_by_name, record_event, ExceedCounter, KILL_SETTLE_DELAY,
    RESTART_COOLDOWN,
};
use crate::error::{AppError, Result};
use crate::history::BoundedHistory;
use crate::provider::MetricsProvider;
use crate::sink::{append_or_warn, LogRecord, LogSink, SinkFactory};
use crate::types::{
    Event, EventKind, MetricSample, ProcessInfo, SystemMetrics, TargetConfig, TargetStatus,
};

/// Fleet-wide settings. Zero values fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FleetConfig {
    pub sample_interval_secs: u64,
    pub metrics_buffer_len: usize,
    pub events_buffer_len: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 1,
            metrics_buffer_len: 300,
            events_buffer_len: 100,
        }
    }
}

impl FleetConfig {
    fn normalized(self) -> Self {
        let defaults = Self::default();
        Self {
            sample_interval_secs: if self.sample_interval_secs == 0 {
                defaults.sample_interval_secs
            } else {
                self.sample_interval_secs
            },
            metrics_buffer_len: if self.metrics_buffer_len == 0 {
                defaults.metrics_buffer_len
            } else {
                self.metrics_buffer_len
            },
            events_buffer_len: if self.events_buffer_len == 0 {
                defaults.events_buffer_len
            } else {
                self.events_buffer_len
            },
        }
    }
}

struct TargetState {
    config: TargetConfig,
    history: Arc<BoundedHistory<MetricSample>>,
    cpu: ExceedCounter,
    mem: ExceedCounter,
    last_restart: Option<Instant>,
    last_sample: Option<MetricSample>,
    exit_reported: bool,
    awaiting_rebind: bool,
    /// Identifies the restart a pending rebind belongs to.
    rebind_token: u64,
}

impl TargetState {
    fn cooldown(&self) -> Duration {
        match self.config.restart_cooldown_seconds {
            0 => RESTART_COOLDOWN,
            secs => Duration::from_secs(secs),
        }
    }

    fn status(&self) -> TargetStatus {
        TargetStatus {
            config: self.config.clone(),
            consecutive_cpu_exceed: self.cpu.count(),
            consecutive_mem_exceed: self.mem.count(),
            exit_reported: self.exit_reported,
            awaiting_rebind: self.awaiting_rebind,
            last_sample: self.last_sample.clone(),
        }
    }
}

#[derive(Default)]
struct FleetState {
    targets: HashMap<u32, TargetState>,
    running: bool,
    stop_tx: Option<oneshot::Sender<()>>,
    sink: Option<Arc<dyn LogSink>>,
}

/// What a tick decided for one target, acted on after the lock is released.
#[derive(Default)]
struct Verdict {
    exit: bool,
    /// Dead after the exit was already reported; retry the restart.
    still_down: bool,
    cpu_fired: Option<u32>,
    mem_fired: Option<u32>,
}

struct FleetInner {
    provider: Arc<dyn MetricsProvider>,
    interval: Duration,
    metrics_len: usize,
    events: BoundedHistory<Event>,
    sink_factory: Option<SinkFactory>,
    next_token: AtomicU64,
    state: RwLock<FleetState>,
}

/// Watches many processes, keyed by PID.
///
/// Emits one `exit` event per alive-to-dead transition.
#[derive(Clone)]
pub struct FleetMonitor {
    inner: Arc<FleetInner>,
}

impl FleetMonitor {
    pub fn new(
        config: FleetConfig,
        provider: Arc<dyn MetricsProvider>,
        sink_factory: Option<SinkFactory>,
    ) -> Self {
        let config = config.normalized();
        Self {
            inner: Arc::new(FleetInner {
                provider,
                interval: Duration::from_secs(config.sample_interval_secs),
                metrics_len: config.metrics_buffer_len,
                events: BoundedHistory::new(config.events_buffer_len),
                sink_factory,
                next_token: AtomicU64::new(1),
                state: RwLock::new(FleetState::default()),
            }),
        }
    }

    /// Track a live process. Takes one sample before returning.
    pub fn add_target(&self, config: TargetConfig) -> Result<()> {
        let pid = config.process_id;
        if pid == 0 {
            return Err(AppError::invalid_target("pid is required"));
        }
        if self.inner.read().targets.contains_key(&pid) {
            return Err(AppError::duplicate_target(pid));
        }
        if !self.inner.provider.is_alive(pid) {
            return Err(AppError::not_alive(pid));
        }

        let initial = collect_sample(self.inner.provider.as_ref(), pid, &config.display_name);
        let mut config = config;
        if config.display_name.is_empty() {
            config.display_name = initial.name.clone();
        }
        let history = Arc::new(BoundedHistory::new(self.inner.metrics_len));
        history.push(initial.clone());

        let mut state = self.inner.write();
        if state.targets.contains_key(&pid) {
            return Err(AppError::duplicate_target(pid));
        }
        log::info!("Added target {} (PID {})", config.label(), pid);
        state.targets.insert(
            pid,
            TargetState {
                config,
                history,
                cpu: ExceedCounter::default(),
                mem: ExceedCounter::default(),
                last_restart: None,
                last_sample: Some(initial),
                exit_reported: false,
                awaiting_rebind: false,
                rebind_token: 0,
            },
        );
        Ok(())
    }

    /// Drop a target together with its history.
    pub fn remove_target(&self, pid: u32) -> Result<()> {
        let removed = self.inner.write().targets.remove(&pid);
        match removed {
            Some(target) => {
                log::info!("Removed target {} (PID {})", target.config.label(), pid);
                Ok(())
            }
            None => Err(AppError::unknown_target(pid)),
        }
    }

    pub fn remove_all_targets(&self) {
        let count = {
            let mut state = self.inner.write();
            let count = state.targets.len();
            state.targets.clear();
            count
        };
        log::info!("Removed all {} targets", count);
    }

    /// Replace the stored configuration of a tracked PID. Counters are kept.
    pub fn update_target(&self, config: TargetConfig) -> Result<()> {
        let pid = config.process_id;
        let mut state = self.inner.write();
        let target = state
            .targets
            .get_mut(&pid)
            .ok_or_else(|| AppError::unknown_target(pid))?;
        let mut config = config;
        if config.display_name.is_empty() {
            config.display_name = std::mem::take(&mut target.config.display_name);
        }
        target.config = config;
        drop(state);
        log::info!("Updated target PID {}", pid);
        Ok(())
    }

    /// Start the shared sampling loop and open a fresh log file. No-op when running.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::other(format!("No async runtime: {}", e)))?;

        let mut state = self.inner.write();
        if state.running {
            return Ok(());
        }
        state.sink = match self.inner.sink_factory.as_ref().map(|open| open()) {
            Some(Ok(sink)) => Some(sink),
            Some(Err(e)) => {
                log::warn!("Failed to open fleet log, continuing without it: {}", e);
                None
            }
            None => None,
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        state.stop_tx = Some(stop_tx);
        state.running = true;
        let targets = state.targets.len();
        drop(state);

        log::info!("Fleet monitoring started with {} targets", targets);
        runtime.spawn(Arc::clone(&self.inner).run(stop_rx));
        Ok(())
    }

    /// Stop the loop and close the log file. No-op when idle.
    pub fn stop(&self) {
        let mut state = self.inner.write();
        if !state.running {
            return;
        }
        state.running = false;
        let stop_tx = state.stop_tx.take();
        state.sink = None;
        drop(state);

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        log::info!("Fleet monitoring stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.read().running
    }

    /// Configurations of every tracked target, ordered by PID.
    pub fn targets(&self) -> Vec<TargetConfig> {
        let state = self.inner.read();
        let mut targets: Vec<TargetConfig> = state.targets.values().map(|t| t.config.clone()).collect();
        drop(state);
        targets.sort_by_key(|t| t.process_id);
        targets
    }

    pub fn target_statuses(&self) -> Vec<TargetStatus> {
        let state = self.inner.read();
        let mut statuses: Vec<TargetStatus> = state.targets.values().map(TargetState::status).collect();
        drop(state);
        statuses.sort_by_key(|s| s.config.process_id);
        statuses
    }

    /// Last `n` samples of one target; empty for an unknown PID.
    pub fn metrics(&self, pid: u32, n: usize) -> Vec<MetricSample> {
        let history = self
            .inner
            .read()
            .targets
            .get(&pid)
            .map(|t| Arc::clone(&t.history));
        history.map(|h| h.get_recent(n)).unwrap_or_default()
    }

    pub fn latest_metrics(&self) -> HashMap<u32, MetricSample> {
        self.inner
            .read()
            .targets
            .iter()
            .filter_map(|(pid, t)| t.last_sample.clone().map(|s| (*pid, s)))
            .collect()
    }

    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.inner.events.get_recent(n)
    }

    /// Last `n` events that concern `pid`, oldest first.
    pub fn target_events(&self, pid: u32, n: usize) -> Vec<Event> {
        let mut events: Vec<Event> = self
            .inner
            .events
            .get_all()
            .into_iter()
            .rev()
            .filter(|e| e.pid == pid)
            .take(n)
            .collect();
        events.reverse();
        events
    }

    pub fn list_all_processes(&self) -> Result<Vec<ProcessInfo>> {
        self.inner.provider.list_all_processes()
    }

    pub fn system_metrics(&self) -> Result<SystemMetrics> {
        self.inner.provider.get_system_metrics()
    }
}

impl FleetInner {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, FleetState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, FleetState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn sink(&self) -> Option<Arc<dyn LogSink>> {
        self.read().sink.clone()
    }

    fn emit(&self, kind: EventKind, pid: u32, name: &str, message: impl Into<String>) {
        let sink = self.sink();
        record_event(&self.events, sink.as_ref(), Event::new(kind, pid, name, message));
    }

    async fn run(self: Arc<Self>, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => self.collect_all().await,
            }
        }
    }

    async fn collect_all(self: &Arc<Self>) {
        let mut pids: Vec<u32> = self.read().targets.keys().copied().collect();
        pids.sort_unstable();
        for pid in pids {
            self.collect_one(pid).await;
        }
    }

    async fn collect_one(self: &Arc<Self>, pid: u32) {
        let Some((history, name)) = self
            .read()
            .targets
            .get(&pid)
            .map(|t| (Arc::clone(&t.history), t.config.display_name.clone()))
        else {
            return;
        };

        let sample = collect_sample(self.provider.as_ref(), pid, &name);
        history.push(sample.clone());

        let (verdict, config, sink) = {
            let mut state = self.write();
            let sink = state.sink.clone();
            let Some(target) = state.targets.get_mut(&pid) else {
                return;
            };
            let mut verdict = Verdict::default();
            if sample.alive {
                target.exit_reported = false;
                if !target.awaiting_rebind {
                    verdict.cpu_fired = target.cpu.observe(
                        sample.cpu_percent,
                        target.config.cpu_threshold,
                        target.config.cpu_exceed_count,
                    );
                    verdict.mem_fired = target.mem.observe(
                        sample.resident_memory_mb(),
                        target.config.mem_threshold_mb,
                        target.config.mem_exceed_count,
                    );
                }
            } else if !target.exit_reported {
                target.exit_reported = true;
                verdict.exit = true;
            } else if target.config.auto_restart && !target.awaiting_rebind {
                verdict.still_down = true;
            }
            target.last_sample = Some(sample.clone());
            (verdict, target.config.clone(), sink)
        };
        append_or_warn(sink.as_ref(), &LogRecord::Sample(&sample));

        if verdict.exit {
            self.emit(EventKind::Exit, pid, &config.display_name, "process exited");
            self.restart(pid, "process exited").await;
        } else if verdict.still_down {
            self.restart(pid, "process still down").await;
        }
        if let Some(times) = verdict.cpu_fired {
            self.emit(
                EventKind::CpuThreshold,
                pid,
                &config.display_name,
                format!(
                    "CPU {:.2}% exceeded threshold {:.2}% for {} times",
                    sample.cpu_percent, config.cpu_threshold, times
                ),
            );
            self.restart(pid, "CPU threshold exceeded").await;
        }
        if let Some(times) = verdict.mem_fired {
            self.emit(
                EventKind::MemThreshold,
                pid,
                &config.display_name,
                format!(
                    "memory {:.2}MB exceeded threshold {:.2}MB for {} times",
                    sample.resident_memory_mb(),
                    config.mem_threshold_mb,
                    times
                ),
            );
            self.restart(pid, "memory threshold exceeded").await;
        }
    }

    async fn restart(self: &Arc<Self>, pid: u32, reason: &str) {
        let now = Instant::now();
        let (command, name) = {
            let mut state = self.write();
            let Some(target) = state.targets.get_mut(&pid) else {
                return;
            };
            if !target.config.auto_restart || target.awaiting_rebind {
                return;
            }
            let command = target.config.restart_command.trim().to_string();
            if command.is_empty() {
                drop(state);
                log::warn!("Target PID {} has auto_restart but no restart command", pid);
                return;
            }
            let cooldown = target.cooldown();
            if target
                .last_restart
                .is_some_and(|last| now.duration_since(last) < cooldown)
            {
                drop(state);
                log::debug!("Restart of PID {} skipped (cooling down): {}", pid, reason);
                return;
            }
            target.last_restart = Some(now);
            (command, target.config.display_name.clone())
        };

        if self.provider.is_alive(pid) {
            log::info!("Killing old process PID {}", pid);
            if let Err(e) = self.provider.kill_process(pid) {
                log::warn!("Failed to kill PID {}: {}", pid, e);
            }
            tokio::time::sleep(KILL_SETTLE_DELAY).await;
        }

        log::info!("Triggering restart of PID {}: {}", pid, reason);
        if let Err(e) = self.provider.execute_restart(&command) {
            log::error!("Restart of PID {} failed: {}", pid, e);
            return;
        }
        self.emit(
            EventKind::Restart,
            pid,
            &name,
            format!("restart triggered: {}", reason),
        );

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.write();
            let Some(target) = state.targets.get_mut(&pid) else {
                return;
            };
            target.awaiting_rebind = true;
            target.rebind_token = token;
        }
        if name.is_empty() {
            log::warn!("Target PID {} has no process name, it cannot be rebound after restart", pid);
            return;
        }
        tokio::spawn(Arc::clone(self).rebind(pid, name, token));
    }

    async fn rebind(self: Arc<Self>, old_pid: u32, name: String, token: u64) {
        let accept = |candidate: u32| {
            candidate == old_pid || !self.read().targets.contains_key(&candidate)
        };
        let Some(new_pid) = rebind_by_name(self.provider.as_ref(), &name, accept).await else {
            log::warn!(
                "Failed to find new process {} after restart, PID {} stays suspended",
                name,
                old_pid
            );
            return;
        };

        let mut state = self.write();
        let pending = state
            .targets
            .get(&old_pid)
            .is_some_and(|t| t.awaiting_rebind && t.rebind_token == token);
        if !pending {
            drop(state);
            log::info!("Target PID {} changed during rebind, dropping result", old_pid);
            return;
        }
        if new_pid != old_pid && state.targets.contains_key(&new_pid) {
            drop(state);
            log::warn!("PID {} was claimed by another target during rebind", new_pid);
            return;
        }
        let Some(mut target) = state.targets.remove(&old_pid) else {
            return;
        };
        target.config.process_id = new_pid;
        target.awaiting_rebind = false;
        target.exit_reported = false;
        target.cpu.reset();
        target.mem.reset();
        state.targets.insert(new_pid, target);
        drop(state);
        log::info!("Target {} rebound from PID {} to PID {}", name, old_pid, new_pid);
    }
}
