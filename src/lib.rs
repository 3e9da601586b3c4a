pub mod config;
pub mod error;
pub mod history;
pub mod monitor;
pub mod paths;
pub mod provider;
pub mod sink;
pub mod types;

use std::path::Path;
use std::sync::Arc;

use config::{load_config, AgentConfig};
pub use error::{AppError, ErrorKind, Result};
pub use history::BoundedHistory;
pub use monitor::{FleetConfig, FleetMonitor, TargetMonitor};
pub use provider::{new_provider, MetricsProvider};
use sink::jsonl_in_dir;
use types::TargetConfig;

const LOG_FILE_NAME: &str = "monitor-agent.log";

/// Agent entry point: load config, start monitors, wait for Ctrl-C.
pub fn run() -> Result<()> {
    let config = load_config()?;
    paths::ensure_data_dirs(&config.log_dir)?;
    init_logging(&config)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(&config))
}

fn init_logging(config: &AgentConfig) -> Result<()> {
    let log_file = fern::log_file(config.log_dir.join(LOG_FILE_NAME))
        .map_err(|e| AppError::io(format!("Failed to open agent log: {}", e)))?;
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(config.level_filter())
        .chain(std::io::stdout())
        .chain(log_file)
        .apply()
        .map_err(|e| AppError::other(format!("Failed to install logger: {}", e)))
}

async fn serve(config: &AgentConfig) -> Result<()> {
    let provider = new_provider();

    let fleet = FleetMonitor::new(
        config.fleet(),
        Arc::clone(&provider),
        Some(jsonl_in_dir(config.log_dir.clone(), "multi_monitor")),
    );
    for target in &config.targets {
        let Some(target) = resolve_target(provider.as_ref(), target) else {
            continue;
        };
        let label = target.label().to_string();
        let pid = target.process_id;
        match fleet.add_target(target) {
            Ok(()) => log::info!("Tracking {} (PID {})", label, pid),
            Err(e) => log::warn!("Skipping target {} (PID {}): {}", label, pid, e),
        }
    }
    fleet.start()?;

    let watcher = match &config.watch {
        Some(watch) => Some(start_watch(watch.clone(), Arc::clone(&provider), &config.log_dir)?),
        None => None,
    };

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");

    if let Some(watcher) = watcher {
        watcher.stop();
    }
    fleet.stop();
    Ok(())
}

/// Fill in the PID of a configured target given only by name.
fn resolve_target(provider: &dyn MetricsProvider, target: &TargetConfig) -> Option<TargetConfig> {
    if target.process_id != 0 {
        return Some(target.clone());
    }
    if target.display_name.is_empty() {
        log::warn!("Skipping target with neither pid nor name");
        return None;
    }
    match provider.find_pid_by_name(&target.display_name) {
        Ok(pid) => Some(TargetConfig {
            process_id: pid,
            ..target.clone()
        }),
        Err(e) => {
            log::warn!("Skipping target {}: {}", target.label(), e);
            None
        }
    }
}

fn start_watch(
    mut watch: types::MonitorConfig,
    provider: Arc<dyn MetricsProvider>,
    log_dir: &Path,
) -> Result<TargetMonitor> {
    if watch.log_file.is_none() {
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        watch.log_file = Some(log_dir.join(format!("monitor_{}.jsonl", stamp)));
    }
    let monitor = TargetMonitor::new(watch, provider);
    monitor.start()?;
    Ok(monitor)
}
