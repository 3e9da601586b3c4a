//! Single-target monitor.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    collect_sample, rebind_by_name, record_event, ExceedCounter, KILL_SETTLE_DELAY,
    RESTART_COOLDOWN, SAMPLE_INTERVAL,
};
use crate::error::{AppError, Result};
use crate::history::BoundedHistory;
use crate::provider::MetricsProvider;
use crate::sink::{append_or_warn, jsonl_file, LogRecord, LogSink, SinkFactory};
use crate::types::{Event, EventKind, MetricSample, MonitorConfig, MonitorStatus};

const DEFAULT_METRICS_LEN: usize = 60;
const DEFAULT_EVENTS_LEN: usize = 100;

#[derive(Default)]
struct State {
    running: bool,
    pid: u32,
    /// Bumped on every start; stale rebind tasks compare against it.
    session: u64,
    stop_tx: Option<oneshot::Sender<()>>,
    sink: Option<Arc<dyn LogSink>>,
    cpu: ExceedCounter,
    mem: ExceedCounter,
    last_restart: Option<Instant>,
    last_sample: Option<MetricSample>,
    awaiting_rebind: bool,
}

struct Inner {
    provider: Arc<dyn MetricsProvider>,
    config: MonitorConfig,
    metrics: BoundedHistory<MetricSample>,
    events: BoundedHistory<Event>,
    sink_factory: Option<SinkFactory>,
    state: Mutex<State>,
}

/// Watches one process, identified by PID or by name.
///
/// Re-emits an `exit` event on every dead tick until a restart suspends it.
#[derive(Clone)]
pub struct TargetMonitor {
    inner: Arc<Inner>,
}

impl TargetMonitor {
    pub fn new(config: MonitorConfig, provider: Arc<dyn MetricsProvider>) -> Self {
        let metrics_len = match config.metrics_buffer_len {
            0 => DEFAULT_METRICS_LEN,
            n => n,
        };
        let events_len = match config.events_buffer_len {
            0 => DEFAULT_EVENTS_LEN,
            n => n,
        };
        let sink_factory = config.log_file.clone().map(jsonl_file);

        Self {
            inner: Arc::new(Inner {
                provider,
                metrics: BoundedHistory::new(metrics_len),
                events: BoundedHistory::new(events_len),
                sink_factory,
                config,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Resolve the target and launch the sampling loop.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::other(format!("No async runtime: {}", e)))?;

        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.running {
            return Err(AppError::already_running());
        }
        let pid = self.inner.resolve_pid()?;

        let sink = match self.inner.sink_factory.as_ref().map(|open| open()) {
            Some(Ok(sink)) => Some(sink),
            Some(Err(e)) => {
                log::warn!("Failed to open monitor log, continuing without it: {}", e);
                None
            }
            None => None,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        state.running = true;
        state.pid = pid;
        state.session += 1;
        state.stop_tx = Some(stop_tx);
        state.sink = sink;
        state.cpu.reset();
        state.mem.reset();
        state.awaiting_rebind = false;
        drop(state);

        log::info!("Monitoring started for PID {}", pid);
        runtime.spawn(Arc::clone(&self.inner).run(stop_rx));
        Ok(())
    }

    /// Stop sampling and release the log sink. No-op when idle.
    pub fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.running {
            return;
        }
        state.running = false;
        let stop_tx = state.stop_tx.take();
        state.sink = None;
        let pid = state.pid;
        drop(state);

        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
        log::info!("Monitoring stopped for PID {}", pid);
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner()).running
    }

    pub fn recent_metrics(&self, n: usize) -> Vec<MetricSample> {
        self.inner.metrics.get_recent(n)
    }

    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.inner.events.get_recent(n)
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        MonitorStatus {
            running: state.running,
            target_pid: state.pid,
            target_name: self.inner.config.process_name.clone().unwrap_or_default(),
            awaiting_rebind: state.awaiting_rebind,
            current_metric: state.last_sample.clone(),
            config: self.inner.config.clone(),
        }
    }
}

impl Inner {
    fn process_name(&self) -> Option<&str> {
        self.config
            .process_name
            .as_deref()
            .filter(|name| !name.is_empty())
    }

    fn resolve_pid(&self) -> Result<u32> {
        match (self.config.pid, self.process_name()) {
            (Some(pid), _) if pid > 0 => Ok(pid),
            (_, Some(name)) => self.provider.find_pid_by_name(name),
            _ => Err(AppError::invalid_target("either pid or process_name is required")),
        }
    }

    fn sink(&self) -> Option<Arc<dyn LogSink>> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sink
            .clone()
    }

    fn emit(&self, kind: EventKind, pid: u32, name: &str, message: impl Into<String>) {
        let sink = self.sink();
        record_event(&self.events, sink.as_ref(), Event::new(kind, pid, name, message));
    }

    async fn run(self: Arc<Self>, mut stop_rx: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + SAMPLE_INTERVAL, SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(self: &Arc<Self>) {
        let (pid, sink) = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.awaiting_rebind {
                return;
            }
            (state.pid, state.sink.clone())
        };

        let name = self.process_name().unwrap_or_default().to_string();
        let sample = collect_sample(self.provider.as_ref(), pid, &name);
        self.metrics.push(sample.clone());
        append_or_warn(sink.as_ref(), &LogRecord::Sample(&sample));

        if !sample.alive {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).last_sample = Some(sample);
            self.emit(EventKind::Exit, pid, &name, "process exited");
            self.restart("process exited").await;
            return;
        }

        let mem_mb = sample.resident_memory_mb();
        let (cpu_fired, mem_fired) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let cpu_fired = state.cpu.observe(
                sample.cpu_percent,
                self.config.cpu_threshold,
                self.config.cpu_exceed_count,
            );
            let mem_fired = state.mem.observe(
                mem_mb,
                self.config.mem_threshold_mb,
                self.config.mem_exceed_count,
            );
            state.last_sample = Some(sample.clone());
            (cpu_fired, mem_fired)
        };

        if let Some(times) = cpu_fired {
            self.emit(
                EventKind::CpuThreshold,
                pid,
                &sample.name,
                format!(
                    "CPU {:.2}% exceeded threshold {:.2}% for {} times",
                    sample.cpu_percent, self.config.cpu_threshold, times
                ),
            );
            self.restart("CPU threshold exceeded").await;
        }
        if let Some(times) = mem_fired {
            self.emit(
                EventKind::MemThreshold,
                pid,
                &sample.name,
                format!(
                    "memory {:.2}MB exceeded threshold {:.2}MB for {} times",
                    mem_mb, self.config.mem_threshold_mb, times
                ),
            );
            self.restart("memory threshold exceeded").await;
        }
    }

    async fn restart(self: &Arc<Self>, reason: &str) {
        let command = self.config.restart_command.trim();
        if command.is_empty() {
            log::warn!("No restart command configured, skipping restart ({})", reason);
            return;
        }

        let now = Instant::now();
        let (pid, session) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let cooling = state
                .last_restart
                .is_some_and(|last| now.duration_since(last) < RESTART_COOLDOWN);
            if cooling {
                drop(state);
                log::info!("Restart skipped (cooling down): {}", reason);
                return;
            }
            state.last_restart = Some(now);
            (state.pid, state.session)
        };

        if self.provider.is_alive(pid) {
            log::info!("Killing old process PID {}", pid);
            match self.provider.kill_process(pid) {
                Ok(()) => log::info!("Old process PID {} killed", pid),
                Err(e) => log::warn!("Failed to kill PID {}: {}", pid, e),
            }
            tokio::time::sleep(KILL_SETTLE_DELAY).await;
        }

        log::info!("Triggering restart: {}", reason);
        if let Err(e) = self.provider.execute_restart(command) {
            log::error!("Restart failed: {}", e);
            return;
        }
        let name = self.process_name().unwrap_or_default().to_string();
        self.emit(
            EventKind::Restart,
            pid,
            &name,
            format!("restart triggered: {}", reason),
        );

        self.state.lock().unwrap_or_else(|e| e.into_inner()).awaiting_rebind = true;
        if name.is_empty() {
            log::info!("Target is pinned to PID {}, rule evaluation stays suspended after restart", pid);
            return;
        }
        tokio::spawn(Arc::clone(self).rebind(name, session));
    }

    async fn rebind(self: Arc<Self>, name: String, session: u64) {
        match rebind_by_name(self.provider.as_ref(), &name, |_| true).await {
            Some(pid) => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.session != session {
                    return;
                }
                state.pid = pid;
                state.awaiting_rebind = false;
                state.cpu.reset();
                state.mem.reset();
                drop(state);
                log::info!("Found new process {} with PID {}", name, pid);
            }
            None => log::warn!(
                "Failed to find new process {} after restart, rule evaluation stays suspended",
                name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::provider::scripted::ScriptedProvider;
    use std::time::Duration;

    fn by_pid(pid: u32) -> MonitorConfig {
        MonitorConfig {
            pid: Some(pid),
            restart_command: "start-worker".to_string(),
            ..Default::default()
        }
    }

    fn monitor(config: MonitorConfig, provider: &Arc<ScriptedProvider>) -> TargetMonitor {
        let provider: Arc<dyn MetricsProvider> = Arc::clone(provider) as Arc<dyn MetricsProvider>;
        TargetMonitor::new(config, provider)
    }

    fn count(events: &[Event], kind: EventKind) -> usize {
        events.iter().filter(|e| e.kind == kind).count()
    }

    #[tokio::test]
    async fn start_requires_a_target() {
        let provider = Arc::new(ScriptedProvider::new());
        let err = monitor(MonitorConfig::default(), &provider).start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTarget);
    }

    #[tokio::test]
    async fn start_propagates_name_lookup_errors() {
        let provider = Arc::new(ScriptedProvider::new());
        let config = MonitorConfig {
            process_name: Some("worker".to_string()),
            ..Default::default()
        };
        let err = monitor(config.clone(), &provider).start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        provider.add_process(1, "worker");
        provider.add_process(2, "worker");
        let err = monitor(config, &provider).start().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
        assert_eq!(err.candidates(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_fails_and_stop_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let monitor = monitor(by_pid(7), &provider);

        monitor.start().unwrap();
        assert_eq!(monitor.start().unwrap_err().kind(), ErrorKind::AlreadyRunning);
        assert!(monitor.is_running());

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());
        monitor.start().unwrap();
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn samples_once_per_second() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        provider.set_rss(7, 4 * 1024 * 1024);
        let monitor = monitor(by_pid(7), &provider);

        monitor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        monitor.stop();
        tokio::time::sleep(Duration::from_secs(3)).await;

        let metrics = monitor.recent_metrics(100);
        assert_eq!(metrics.len(), 3);
        assert!(metrics.iter().all(|m| m.alive && m.pid == 7));
        assert_eq!(monitor.status().current_metric.unwrap().resident_memory_bytes, 4 * 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_allows_one_restart_per_window() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let monitor = monitor(by_pid(7), &provider);
        monitor.start().unwrap();

        monitor.inner.restart("first").await;
        tokio::time::advance(Duration::from_secs(5)).await;
        monitor.inner.restart("second").await;
        assert_eq!(provider.restarts().len(), 1);
        assert_eq!(provider.kills(), vec![7]);

        tokio::time::advance(Duration::from_secs(6)).await;
        monitor.inner.restart("third").await;
        assert_eq!(provider.restarts().len(), 2);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn exit_restarts_and_pid_target_stays_suspended() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let monitor = monitor(by_pid(7), &provider);
        monitor.start().unwrap();

        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        let events = monitor.recent_events(10);
        assert_eq!(count(&events, EventKind::Exit), 1);
        assert_eq!(count(&events, EventKind::Restart), 1);
        assert!(provider.kills().is_empty());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(monitor.status().awaiting_rebind);
        assert_eq!(monitor.recent_events(10).len(), 2);
        assert_eq!(provider.restarts().len(), 1);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn dead_ticks_repeat_exit_without_restart_command() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let config = MonitorConfig {
            restart_command: String::new(),
            ..by_pid(7)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        monitor.stop();

        assert_eq!(count(&monitor.recent_events(10), EventKind::Exit), 3);
        assert!(provider.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cpu_rule_fires_after_consecutive_samples() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let config = MonitorConfig {
            cpu_threshold: 80.0,
            cpu_exceed_count: 3,
            restart_command: String::new(),
            ..by_pid(7)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        provider.set_cpu(7, 85.0);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        for cpu in [85.0, 70.0, 85.0, 85.0, 85.0] {
            provider.set_cpu(7, cpu);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        monitor.stop();

        let events = monitor.recent_events(10);
        assert_eq!(count(&events, EventKind::CpuThreshold), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_rule_triggers_restart() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        provider.set_rss(7, 600 * 1024 * 1024);
        let config = MonitorConfig {
            mem_threshold_mb: 512.0,
            mem_exceed_count: 2,
            ..by_pid(7)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        monitor.stop();

        let events = monitor.recent_events(10);
        assert_eq!(count(&events, EventKind::MemThreshold), 1);
        assert_eq!(count(&events, EventKind::Restart), 1);
        assert_eq!(provider.kills(), vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn name_target_rebinds_to_new_pid() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        provider.spawn_on_restart(8, "worker");
        let config = MonitorConfig {
            pid: None,
            process_name: Some("worker".to_string()),
            ..by_pid(0)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(monitor.status().awaiting_rebind);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let status = monitor.status();
        assert!(!status.awaiting_rebind);
        assert_eq!(status.target_pid, 8);

        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop();
        assert_eq!(monitor.recent_metrics(1)[0].pid, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_rebind_stays_suspended() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let config = MonitorConfig {
            pid: None,
            process_name: Some("worker".to_string()),
            ..by_pid(0)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        monitor.stop();

        assert!(monitor.status().awaiting_rebind);
        assert_eq!(provider.restarts().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_restart_command_is_not_fatal() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        provider.fail_restarts();
        let monitor = monitor(by_pid(7), &provider);
        monitor.start().unwrap();

        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(monitor.is_running());
        let events = monitor.recent_events(10);
        assert_eq!(count(&events, EventKind::Restart), 0);
        assert_eq!(count(&events, EventKind::Exit), 2);
        monitor.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn log_file_receives_samples_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.jsonl");
        let provider = Arc::new(ScriptedProvider::new());
        provider.add_process(7, "worker");
        let config = MonitorConfig {
            log_file: Some(path.clone()),
            restart_command: String::new(),
            ..by_pid(7)
        };
        let monitor = monitor(config, &provider);
        monitor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        provider.set_alive(7, false);
        tokio::time::sleep(Duration::from_secs(1)).await;
        monitor.stop();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["alive"], true);
        assert_eq!(lines[1]["alive"], false);
        assert_eq!(lines[2]["type"], "exit");
    }
}
