#![cfg(target_os = "linux")]

use std::process::Command;
use std::time::Duration;

use monitor_agent::provider::LinuxProvider;
use monitor_agent::{ErrorKind, MetricsProvider as _};

fn own_pid() -> u32 {
    std::process::id()
}

fn own_comm() -> String {
    std::fs::read_to_string("/proc/self/comm")
        .unwrap()
        .trim_end()
        .to_string()
}

#[test]
fn own_process_is_alive_and_measured() {
    let provider = LinuxProvider::new();
    assert!(provider.is_alive(own_pid()));

    let first = provider.get_metrics(own_pid()).unwrap();
    assert!(first.alive);
    assert_eq!(first.pid, own_pid());
    assert_eq!(first.name, own_comm());
    assert_eq!(first.cpu_percent, 0.0);
    assert!(first.resident_memory_bytes > 0);

    let second = provider.get_metrics(own_pid()).unwrap();
    assert!(second.cpu_percent >= 0.0);
    provider.shutdown();
}

#[test]
fn finds_itself_by_name() {
    let provider = LinuxProvider::new();
    let pids = provider.find_all_pids_by_name(&own_comm()).unwrap();
    assert!(pids.contains(&own_pid()));
    assert!(pids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn unknown_name_is_not_found() {
    let provider = LinuxProvider::new();
    let err = provider
        .find_pid_by_name("no-such-process-name-xyz")
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn dead_pid_reports_not_alive() {
    let provider = LinuxProvider::new();
    assert!(!provider.is_alive(u32::MAX - 1));
    let err = provider.get_metrics(u32::MAX - 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAlive);
}

#[test]
fn process_listing_includes_self() {
    let provider = LinuxProvider::new();
    let processes = provider.list_all_processes().unwrap();
    let me = processes
        .iter()
        .find(|p| p.pid == own_pid())
        .expect("own process listed");
    assert_eq!(me.name, own_comm());
    assert!(me.rss_bytes > 0);
    assert!(me.vms >= me.rss_bytes);
    assert!(me.num_fds > 0);
    assert!(!me.cmdline.is_empty());
    assert_eq!(me.disk_io, me.disk_read_rate + me.disk_write_rate);
}

#[tokio::test]
async fn system_metrics_refresh_in_background() {
    let provider = LinuxProvider::new();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let metrics = provider.get_system_metrics().unwrap();
    assert!((0.0..=100.0).contains(&metrics.cpu_percent));
    provider.shutdown();
}

#[test]
fn system_metrics_are_plausible() {
    let provider = LinuxProvider::new();
    let metrics = provider.get_system_metrics().unwrap();
    assert!(metrics.cpu_cores >= 1);
    assert!(metrics.memory_total > 0);
    assert!(metrics.memory_used <= metrics.memory_total);
    assert!((0.0..=100.0).contains(&metrics.memory_percent));
}

#[test]
fn kill_terminates_child() {
    let provider = LinuxProvider::new();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id();
    assert!(provider.is_alive(pid));

    provider.kill_process(pid).unwrap();
    child.wait().unwrap();
    assert!(!provider.is_alive(pid));
}

#[tokio::test]
async fn restart_command_runs_through_shell() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("restarted");
    let provider = LinuxProvider::new();
    provider
        .execute_restart(&format!("touch '{}'", marker.display()))
        .unwrap();

    for _ in 0..50 {
        if marker.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(marker.exists(), "restart command did not run");
}
