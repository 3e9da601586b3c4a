//! System-wide CPU and network sampling as a background task.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tokio::time::MissedTickBehavior;

use super::sampling::{RateTracker, SystemCpuTracker};

/// Cadence of the background sampler.
pub(crate) const SYSTEM_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Raw cumulative counters read by a platform provider.
pub(crate) trait SystemCounters: Send + 'static {
    /// `(total, idle)` ticks summed over all cores.
    fn cpu_times(&mut self) -> Option<(u64, u64)>;
    /// `(received, sent)` bytes summed over all interfaces.
    fn net_bytes(&mut self) -> Option<(u64, u64)>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct SystemSnapshot {
    pub cpu_percent: f64,
    pub net_bytes_recv: u64,
    pub net_bytes_sent: u64,
    pub net_recv_rate: f64,
    pub net_send_rate: f64,
}

struct Sampling<C> {
    counters: C,
    cpu: SystemCpuTracker,
    net: RateTracker<(), 2>,
    snapshot: SystemSnapshot,
}

impl<C: SystemCounters> Sampling<C> {
    fn new(counters: C) -> Self {
        Self {
            counters,
            cpu: SystemCpuTracker::default(),
            net: RateTracker::new(),
            snapshot: SystemSnapshot::default(),
        }
    }

    fn step(&mut self, now: Instant) -> SystemSnapshot {
        if let Some((total, idle)) = self.counters.cpu_times() {
            self.snapshot.cpu_percent = self.cpu.observe(total, idle);
        }
        if let Some((recv, sent)) = self.counters.net_bytes() {
            let [recv_rate, send_rate] = self.net.observe((), [recv, sent], now);
            self.snapshot.net_bytes_recv = recv;
            self.snapshot.net_bytes_sent = sent;
            self.snapshot.net_recv_rate = recv_rate;
            self.snapshot.net_send_rate = send_rate;
        }
        self.snapshot
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

async fn run<C: SystemCounters>(
    mut sampling: Sampling<C>,
    shared: Arc<RwLock<SystemSnapshot>>,
    mut stop_rx: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + SYSTEM_SAMPLE_INTERVAL,
        SYSTEM_SAMPLE_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = ticker.tick() => {
                let next = sampling.step(now());
                *shared.write().unwrap_or_else(|e| e.into_inner()) = next;
            }
        }
    }
    log::debug!("System sampler stopped");
}

/// Owns the sampling task. Queries read the cached snapshot and never block on a window.
///
/// Without a Tokio runtime at construction the snapshot keeps its baseline values.
pub(crate) struct SystemSampler {
    snapshot: Arc<RwLock<SystemSnapshot>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl SystemSampler {
    /// Takes a baseline reading, then samples every [`SYSTEM_SAMPLE_INTERVAL`].
    pub fn spawn<C: SystemCounters>(counters: C) -> Self {
        let mut sampling = Sampling::new(counters);
        let snapshot = Arc::new(RwLock::new(sampling.step(now())));

        let stop_tx = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let (stop_tx, stop_rx) = oneshot::channel();
                runtime.spawn(run(sampling, Arc::clone(&snapshot), stop_rx));
                Some(stop_tx)
            }
            Err(_) => {
                log::warn!("No async runtime, system CPU and network rates will not refresh");
                None
            }
        };

        Self {
            snapshot,
            stop_tx: Mutex::new(stop_tx),
        }
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        *self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    pub fn is_sampling(&self) -> bool {
        self.stop_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Stop the task. Safe to call more than once.
    pub fn shutdown(&self) {
        let stop_tx = self.stop_tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(());
        }
    }
}

impl Drop for SystemSampler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
