//! Restart decision engines: one for a single target, one for a fleet.

mod fleet;
mod target;

use std::sync::Arc;
use std::time::Duration;

use crate::history::BoundedHistory;
use crate::provider::MetricsProvider;
use crate::sink::{append_or_warn, LogRecord, LogSink};
use crate::types::{Event, MetricSample};

pub use fleet::{FleetConfig, FleetMonitor};
pub use target::TargetMonitor;

/// Minimum time between two executed restarts of the same target.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(10);

/// Pause after killing the old process before launching the new one.
pub const KILL_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Delay before the first PID lookup after a name-based restart.
const REBIND_GRACE: Duration = Duration::from_secs(2);
const REBIND_ATTEMPTS: u32 = 10;
const REBIND_POLL: Duration = Duration::from_secs(1);

/// TargetMonitor tick interval.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive-exceed counter for one threshold rule.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ExceedCounter {
    count: u32,
}

impl ExceedCounter {
    /// Feed one sample. Returns the run length when the rule fires.
    ///
    /// A threshold of 0 or less disables the rule. A `required` of 0 behaves as 1.
    pub fn observe(&mut self, value: f64, threshold: f64, required: u32) -> Option<u32> {
        if threshold <= 0.0 || value <= threshold {
            self.count = 0;
            return None;
        }
        self.count += 1;
        if self.count >= required.max(1) {
            let fired = self.count;
            self.count = 0;
            Some(fired)
        } else {
            None
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Liveness first, then full metrics. A live process whose metrics can't be read
/// still yields an alive sample with zero readings.
pub(crate) fn collect_sample(provider: &dyn MetricsProvider, pid: u32, name: &str) -> MetricSample {
    if !provider.is_alive(pid) {
        return MetricSample::dead(pid, name);
    }
    match provider.get_metrics(pid) {
        Ok(mut sample) => {
            sample.alive = true;
            if sample.name.is_empty() {
                sample.name = name.to_string();
            }
            sample
        }
        Err(e) => {
            log::debug!("Metrics unavailable for PID {}: {}", pid, e);
            MetricSample {
                alive: true,
                ..MetricSample::dead(pid, name)
            }
        }
    }
}

pub(crate) fn record_event(events: &BoundedHistory<Event>, sink: Option<&Arc<dyn LogSink>>, event: Event) {
    log::info!("[EVENT] {}: {} (pid={})", event.kind, event.message, event.pid);
    append_or_warn(sink, &LogRecord::Event(&event));
    events.push(event);
}

/// Poll for a process named `name` after a restart. Returns the first matching PID
/// accepted by `accept`, or `None` once every attempt is used up.
pub(crate) async fn rebind_by_name(
    provider: &dyn MetricsProvider,
    name: &str,
    accept: impl Fn(u32) -> bool,
) -> Option<u32> {
    tokio::time::sleep(REBIND_GRACE).await;
    for attempt in 1..=REBIND_ATTEMPTS {
        match provider.find_all_pids_by_name(name) {
            Ok(pids) => {
                if let Some(pid) = pids.into_iter().find(|pid| accept(*pid)) {
                    return Some(pid);
                }
            }
            Err(e) => log::debug!("Rebind lookup for {} failed: {}", name, e),
        }
        if attempt < REBIND_ATTEMPTS {
            tokio::time::sleep(REBIND_POLL).await;
        }
    }
    None
}
