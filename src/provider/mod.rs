//! Process discovery, measurement and control, one implementation per platform.

mod background;
mod control;
mod sampling;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
mod windows;

#[cfg(test)]
pub(crate) mod scripted;

use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::types::{MetricSample, ProcessInfo, SystemMetrics};

#[cfg(target_os = "linux")]
pub use linux::LinuxProvider;
#[cfg(target_os = "windows")]
pub use windows::WindowsProvider;

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
compile_error!("monitor-agent supports Linux and Windows only");

/// Capability set the monitors depend on. All calls are synchronous.
pub trait MetricsProvider: Send + Sync {
    /// Every PID whose process name matches, in ascending order.
    fn find_all_pids_by_name(&self, name: &str) -> Result<Vec<u32>>;

    /// The single PID matching `name`.
    ///
    /// Fails with `NotFound` for zero matches and `AmbiguousMatch` (carrying the
    /// candidates) for more than one.
    fn find_pid_by_name(&self, name: &str) -> Result<u32> {
        select_single_pid(name, self.find_all_pids_by_name(name)?)
    }

    /// Current sample of a live process. CPU is 0 on the first query for a PID.
    fn get_metrics(&self, pid: u32) -> Result<MetricSample>;

    fn is_alive(&self, pid: u32) -> bool;

    fn kill_process(&self, pid: u32) -> Result<()>;

    /// Launch `command` through the platform shell. Returns once the launch was requested.
    fn execute_restart(&self, command: &str) -> Result<()>;

    /// Full enumeration. Purges sampling state of PIDs that are gone.
    fn list_all_processes(&self) -> Result<Vec<ProcessInfo>>;

    fn get_system_metrics(&self) -> Result<SystemMetrics>;
}

pub(crate) fn select_single_pid(name: &str, pids: Vec<u32>) -> Result<u32> {
    match pids.as_slice() {
        [] => Err(AppError::not_found(name)),
        [pid] => Ok(*pid),
        _ => Err(AppError::ambiguous_match(name, &pids)),
    }
}

/// The provider for the running platform. Starts its background system sampler when
/// called inside a Tokio runtime.
#[cfg(target_os = "linux")]
pub fn new_provider() -> Arc<dyn MetricsProvider> {
    Arc::new(LinuxProvider::new())
}

/// The provider for the running platform. Starts its background system sampler when
/// called inside a Tokio runtime.
#[cfg(target_os = "windows")]
pub fn new_provider() -> Arc<dyn MetricsProvider> {
    Arc::new(WindowsProvider::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use scripted::ScriptedProvider;

    #[test]
    fn single_match_resolves() {
        assert_eq!(select_single_pid("worker", vec![41]).unwrap(), 41);
    }

    #[test]
    fn zero_matches_is_not_found() {
        let err = select_single_pid("worker", Vec::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn several_matches_carry_candidates() {
        let provider = ScriptedProvider::new();
        provider.add_process(300, "worker");
        provider.add_process(200, "worker");
        provider.add_process(100, "other");

        let err = provider.find_pid_by_name("worker").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AmbiguousMatch);
        assert_eq!(err.candidates(), vec![200, 300]);
    }
}
