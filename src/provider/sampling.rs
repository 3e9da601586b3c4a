//! Delta trackers turning cumulative OS counters into percentages and rates.
//!
//! Nothing in here touches the OS; providers feed raw counter readings in.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Rate samples closer together than this reuse the previous rate.
pub(crate) const RATE_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct CpuSample {
    proc_ticks: u64,
    sys_ticks: u64,
    last_pct: f64,
}

/// Per-process CPU percentage, scaled like `top`: one fully busy core is 100%.
#[derive(Debug)]
pub(crate) struct CpuTracker {
    cores: usize,
    samples: HashMap<u32, CpuSample>,
}

impl CpuTracker {
    pub fn new(cores: usize) -> Self {
        Self {
            cores: cores.max(1),
            samples: HashMap::new(),
        }
    }

    /// Record `proc_ticks` (user + kernel) against the system-wide tick total
    /// read at the same instant. The first observation of a PID reports 0.
    pub fn observe(&mut self, pid: u32, proc_ticks: u64, sys_ticks: u64) -> f64 {
        let Some(prev) = self.samples.get_mut(&pid) else {
            self.samples.insert(
                pid,
                CpuSample {
                    proc_ticks,
                    sys_ticks,
                    last_pct: 0.0,
                },
            );
            return 0.0;
        };

        let delta_sys = sys_ticks.saturating_sub(prev.sys_ticks);
        if delta_sys == 0 {
            return prev.last_pct;
        }
        let delta_proc = proc_ticks.saturating_sub(prev.proc_ticks);
        let pct = delta_proc as f64 / delta_sys as f64 * 100.0 * self.cores as f64;

        *prev = CpuSample {
            proc_ticks,
            sys_ticks,
            last_pct: pct,
        };
        pct
    }

    pub fn retain(&mut self, live: impl Fn(u32) -> bool) {
        self.samples.retain(|pid, _| live(*pid));
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_tracked(&self, pid: u32) -> bool {
        self.samples.contains_key(&pid)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateSample<const N: usize> {
    totals: [u64; N],
    at: Instant,
    rates: [f64; N],
}

/// Bytes-per-second over `N` parallel cumulative counters, keyed by `K`.
#[derive(Debug)]
pub(crate) struct RateTracker<K, const N: usize> {
    samples: HashMap<K, RateSample<N>>,
}

impl<K: Eq + Hash, const N: usize> RateTracker<K, N> {
    pub fn new() -> Self {
        Self {
            samples: HashMap::new(),
        }
    }

    pub fn observe(&mut self, key: K, totals: [u64; N], now: Instant) -> [f64; N] {
        let Some(prev) = self.samples.get_mut(&key) else {
            self.samples.insert(
                key,
                RateSample {
                    totals,
                    at: now,
                    rates: [0.0; N],
                },
            );
            return [0.0; N];
        };

        let elapsed = now.saturating_duration_since(prev.at);
        if elapsed < RATE_DEBOUNCE {
            return prev.rates;
        }

        let secs = elapsed.as_secs_f64();
        let mut rates = [0.0; N];
        for (i, rate) in rates.iter_mut().enumerate() {
            *rate = totals[i].saturating_sub(prev.totals[i]) as f64 / secs;
        }
        *prev = RateSample {
            totals,
            at: now,
            rates,
        };
        rates
    }

    pub fn retain(&mut self, live: impl Fn(&K) -> bool) {
        self.samples.retain(|key, _| live(key));
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.samples.len()
    }

    #[cfg(test)]
    pub fn is_tracked(&self, key: &K) -> bool {
        self.samples.contains_key(key)
    }
}

/// System-wide busy percentage from (total, idle + iowait) tick pairs.
#[derive(Debug, Default)]
pub(crate) struct SystemCpuTracker {
    last: Option<(u64, u64)>,
    pct: f64,
}

impl SystemCpuTracker {
    pub fn observe(&mut self, total: u64, idle: u64) -> f64 {
        if let Some((last_total, last_idle)) = self.last {
            let delta_total = total.saturating_sub(last_total);
            let delta_idle = idle.saturating_sub(last_idle);
            if delta_total > 0 {
                self.pct = delta_total.saturating_sub(delta_idle) as f64 / delta_total as f64 * 100.0;
            }
        }
        self.last = Some((total, idle));
        self.pct
    }
}
