//! `/proc` backed provider.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::Local;

use super::background::{SystemCounters, SystemSampler};
use super::control;
use super::sampling::{CpuTracker, RateTracker};
use super::MetricsProvider;
use crate::error::{AppError, Result};
use crate::types::{MetricSample, ProcessInfo, SystemMetrics};

/// The kernel truncates `comm` to this many bytes.
const COMM_MAX_LEN: usize = 15;

/// Fields of `/proc/<pid>/stat` used here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PidStat {
    pub comm: String,
    pub state: char,
    /// utime + stime, in clock ticks
    pub cpu_ticks: u64,
    /// Start time since boot, in clock ticks
    pub start_ticks: u64,
}

/// Fields of `/proc/<pid>/status`, memory values in bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PidStatus {
    pub vm_rss: u64,
    pub vm_size: u64,
    pub vm_data: Option<u64>,
    pub vm_swap: Option<u64>,
    pub uid: Option<u32>,
}

/// Parse `/proc/<pid>/stat`. The command name may contain spaces and
/// parentheses, so fields are taken after the last ')'.
pub(crate) fn parse_stat(content: &str) -> Option<PidStat> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close < open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let fields: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if fields.len() < 20 {
        return None;
    }

    let state = fields[0].chars().next()?;
    let utime: u64 = fields[11].parse().ok()?;
    let stime: u64 = fields[12].parse().ok()?;
    let start_ticks: u64 = fields[19].parse().ok()?;

    Some(PidStat {
        comm,
        state,
        cpu_ticks: utime + stime,
        start_ticks,
    })
}

fn parse_kb(value: &str) -> Option<u64> {
    value
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()
        .map(|kb| kb * 1024)
}

pub(crate) fn parse_status(content: &str) -> PidStatus {
    let mut status = PidStatus::default();
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "VmRSS" => status.vm_rss = parse_kb(value).unwrap_or(0),
            "VmSize" => status.vm_size = parse_kb(value).unwrap_or(0),
            "VmData" => status.vm_data = parse_kb(value),
            "VmSwap" => status.vm_swap = parse_kb(value),
            "Uid" => {
                status.uid = value
                    .split_whitespace()
                    .next()
                    .and_then(|uid| uid.parse().ok());
            }
            _ => {}
        }
    }
    status
}

/// `(read_bytes, write_bytes)` from `/proc/<pid>/io`.
pub(crate) fn parse_io(content: &str) -> Option<(u64, u64)> {
    let mut read = None;
    let mut write = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("read_bytes:") {
            read = value.trim().parse().ok();
        } else if let Some(value) = line.strip_prefix("write_bytes:") {
            write = value.trim().parse().ok();
        }
    }
    Some((read?, write?))
}

/// `(total, idle + iowait)` from the aggregate `cpu` line of `/proc/stat`.
pub(crate) fn parse_cpu_times(content: &str) -> Option<(u64, u64)> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(|v| v.parse().unwrap_or(0))
        .collect();
    if values.len() < 5 {
        return None;
    }
    let total = values.iter().sum();
    Some((total, values[3] + values[4]))
}

/// Number of per-core `cpuN` lines in `/proc/stat`.
pub(crate) fn parse_core_count(content: &str) -> usize {
    content
        .lines()
        .filter(|l| {
            l.strip_prefix("cpu")
                .and_then(|rest| rest.chars().next())
                .is_some_and(|c| c.is_ascii_digit())
        })
        .count()
}

pub(crate) fn parse_boot_time(content: &str) -> Option<u64> {
    content
        .lines()
        .find_map(|l| l.strip_prefix("btime "))
        .and_then(|v| v.trim().parse().ok())
}

/// `(total, used)` bytes, where used = total - available.
pub(crate) fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    let mut free = 0;
    let mut buffers = 0;
    let mut cached = 0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key {
            "MemTotal" => total = parse_kb(value),
            "MemAvailable" => available = parse_kb(value),
            "MemFree" => free = parse_kb(value).unwrap_or(0),
            "Buffers" => buffers = parse_kb(value).unwrap_or(0),
            "Cached" => cached = parse_kb(value).unwrap_or(0),
            _ => {}
        }
    }
    let total = total?;
    let available = available.unwrap_or(free + buffers + cached);
    Some((total, total.saturating_sub(available)))
}

/// `(received, sent)` bytes summed over every interface in `/proc/net/dev`.
pub(crate) fn parse_net_dev(content: &str) -> Option<(u64, u64)> {
    let mut recv = 0u64;
    let mut sent = 0u64;
    let mut seen = false;
    for line in content.lines().skip(2) {
        let Some((_, counters)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = counters.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        recv += fields[0].parse::<u64>().unwrap_or(0);
        sent += fields[8].parse::<u64>().unwrap_or(0);
        seen = true;
    }
    seen.then_some((recv, sent))
}

pub(crate) fn parse_cmdline(raw: &[u8]) -> String {
    raw.split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(String::from_utf8_lossy)
        .collect::<Vec<_>>()
        .join(" ")
}

fn state_label(state: char) -> String {
    match state {
        'R' => "running".to_string(),
        'S' => "sleep".to_string(),
        'D' => "disk-sleep".to_string(),
        'T' | 't' => "stop".to_string(),
        'Z' => "zombie".to_string(),
        'I' => "idle".to_string(),
        'X' | 'x' => "dead".to_string(),
        other => other.to_string(),
    }
}

/// Whether a process with short name `comm` and raw cmdline `cmdline` is `name`.
pub(crate) fn name_matches(comm: &str, cmdline: &[u8], name: &str) -> bool {
    if comm == name {
        return true;
    }
    if comm.len() < COMM_MAX_LEN || !name.starts_with(comm) {
        return false;
    }
    let argv0 = cmdline.split(|b| *b == 0).next().unwrap_or_default();
    let argv0 = String::from_utf8_lossy(argv0);
    Path::new(argv0.as_ref())
        .file_name()
        .is_some_and(|base| base == name)
}

fn read_stat(pid: u32) -> Option<PidStat> {
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|content| parse_stat(&content))
}

fn read_system_ticks() -> Option<(u64, u64)> {
    fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|content| parse_cpu_times(&content))
}

fn list_pids() -> Result<Vec<u32>> {
    let entries = fs::read_dir("/proc").map_err(|e| AppError::process(format!("Failed to read /proc: {}", e)))?;
    Ok(entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect())
}

fn count_fds(pid: u32) -> u32 {
    fs::read_dir(format!("/proc/{}/fd", pid))
        .map(|entries| u32::try_from(entries.count()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

fn username(uid: u32) -> String {
    use nix::unistd::{Uid, User};

    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

fn clock_ticks_per_sec() -> u64 {
    use nix::unistd::{sysconf, SysconfVar};

    match sysconf(SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) => u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100),
        _ => 100,
    }
}

struct ProcCounters;

impl SystemCounters for ProcCounters {
    fn cpu_times(&mut self) -> Option<(u64, u64)> {
        read_system_ticks()
    }

    fn net_bytes(&mut self) -> Option<(u64, u64)> {
        fs::read_to_string("/proc/net/dev")
            .ok()
            .and_then(|content| parse_net_dev(&content))
    }
}

pub struct LinuxProvider {
    cores: usize,
    clock_ticks: u64,
    boot_time: u64,
    cpu: Mutex<CpuTracker>,
    disk: Mutex<RateTracker<u32, 2>>,
    sampler: SystemSampler,
}

impl LinuxProvider {
    pub fn new() -> Self {
        let proc_stat = fs::read_to_string("/proc/stat").unwrap_or_default();
        let cores = match parse_core_count(&proc_stat) {
            0 => std::thread::available_parallelism().map_or(1, usize::from),
            n => n,
        };
        log::info!("Linux provider initialized with {} cores", cores);

        Self {
            cores,
            clock_ticks: clock_ticks_per_sec(),
            boot_time: parse_boot_time(&proc_stat).unwrap_or(0),
            cpu: Mutex::new(CpuTracker::new(cores)),
            disk: Mutex::new(RateTracker::new()),
            sampler: SystemSampler::spawn(ProcCounters),
        }
    }

    /// Stop the background system sampler.
    pub fn shutdown(&self) {
        self.sampler.shutdown();
    }

    fn cpu_percent(&self, pid: u32, cpu_ticks: u64) -> f64 {
        let Some((sys_total, _)) = read_system_ticks() else {
            return 0.0;
        };
        let mut cpu = self.cpu.lock().unwrap_or_else(|e| e.into_inner());
        cpu.observe(pid, cpu_ticks, sys_total)
    }

    fn uptime_secs(&self, start_ticks: u64) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        let started = self.boot_time + start_ticks / self.clock_ticks.max(1);
        now.saturating_sub(started)
    }

    fn process_info(&self, pid: u32, stat: PidStat, now: Instant) -> ProcessInfo {
        let status = fs::read_to_string(format!("/proc/{}/status", pid))
            .map(|content| parse_status(&content))
            .unwrap_or_default();

        let (disk_read_rate, disk_write_rate) = fs::read_to_string(format!("/proc/{}/io", pid))
            .ok()
            .and_then(|content| parse_io(&content))
            .map_or((0.0, 0.0), |(read, write)| {
                let mut disk = self.disk.lock().unwrap_or_else(|e| e.into_inner());
                let [r, w] = disk.observe(pid, [read, write], now);
                (r, w)
            });

        let mut cmdline = fs::read(format!("/proc/{}/cmdline", pid))
            .map(|raw| parse_cmdline(&raw))
            .unwrap_or_default();
        if cmdline.is_empty() {
            if let Ok(exe) = fs::read_link(format!("/proc/{}/exe", pid)) {
                cmdline = exe.display().to_string();
            }
        }

        let rss = status.vm_rss;
        let vms = status.vm_size;
        ProcessInfo {
            pid,
            cpu_pct: self.cpu_percent(pid, stat.cpu_ticks),
            rss_bytes: rss,
            vms,
            paged_pool: status.vm_swap.unwrap_or(vms.saturating_sub(rss) / 10),
            non_paged_pool: status.vm_data.unwrap_or(rss / 10),
            status: state_label(stat.state),
            username: status.uid.map(username).unwrap_or_default(),
            num_fds: count_fds(pid),
            disk_io: disk_read_rate + disk_write_rate,
            disk_read_rate,
            disk_write_rate,
            uptime_secs: self.uptime_secs(stat.start_ticks),
            cmdline,
            name: stat.comm,
        }
    }
}

impl Default for LinuxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for LinuxProvider {
    fn find_all_pids_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let mut pids: Vec<u32> = list_pids()?
            .into_iter()
            .filter(|pid| {
                let Some(stat) = read_stat(*pid) else {
                    return false;
                };
                if stat.state == 'Z' {
                    return false;
                }
                let cmdline = if stat.comm.len() >= COMM_MAX_LEN {
                    fs::read(format!("/proc/{}/cmdline", pid)).unwrap_or_default()
                } else {
                    Vec::new()
                };
                name_matches(&stat.comm, &cmdline, name)
            })
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn get_metrics(&self, pid: u32) -> Result<MetricSample> {
        let stat = read_stat(pid).ok_or_else(|| AppError::not_alive(pid))?;
        let status = fs::read_to_string(format!("/proc/{}/status", pid))
            .map(|content| parse_status(&content))
            .unwrap_or_default();

        Ok(MetricSample {
            timestamp: Local::now(),
            pid,
            cpu_percent: self.cpu_percent(pid, stat.cpu_ticks),
            resident_memory_bytes: status.vm_rss,
            alive: true,
            name: stat.comm,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        control::is_process_alive(pid)
            && read_stat(pid).is_some_and(|stat| !matches!(stat.state, 'Z' | 'X' | 'x'))
    }

    fn kill_process(&self, pid: u32) -> Result<()> {
        control::force_kill(pid)
    }

    fn execute_restart(&self, command: &str) -> Result<()> {
        control::spawn_shell(command)
    }

    fn list_all_processes(&self) -> Result<Vec<ProcessInfo>> {
        let now = Instant::now();
        let mut live = HashSet::new();
        let mut result = Vec::new();

        for pid in list_pids()? {
            let Some(stat) = read_stat(pid) else {
                continue;
            };
            live.insert(pid);
            result.push(self.process_info(pid, stat, now));
        }

        self.cpu
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|pid| live.contains(&pid));
        self.disk
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|pid| live.contains(pid));

        Ok(result)
    }

    fn get_system_metrics(&self) -> Result<SystemMetrics> {
        let (memory_total, memory_used) = fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo(&content))
            .unwrap_or((0, 0));
        let snapshot = self.sampler.snapshot();

        Ok(SystemMetrics {
            cpu_percent: snapshot.cpu_percent,
            cpu_cores: self.cores,
            memory_total,
            memory_used,
            memory_percent: if memory_total == 0 {
                0.0
            } else {
                memory_used as f64 / memory_total as f64 * 100.0
            },
            net_bytes_recv: snapshot.net_bytes_recv,
            net_bytes_sent: snapshot.net_bytes_sent,
            net_recv_rate: snapshot.net_recv_rate,
            net_send_rate: snapshot.net_send_rate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) proc) S 1 4242 4242 0 -1 4194560 1200 0 3 0 \
                        250 75 0 0 20 0 4 0 98765 123456789 2048 18446744073709551615";

    #[test]
    fn stat_handles_parens_in_name() {
        let stat = parse_stat(STAT).unwrap();
        assert_eq!(stat.comm, "my (odd) proc");
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.cpu_ticks, 325);
        assert_eq!(stat.start_ticks, 98765);
    }

    #[test]
    fn stat_rejects_truncated_content() {
        assert!(parse_stat("12 (x) R 1 2 3").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn status_reads_memory_and_uid() {
        let content = "Name:\tworker\nUid:\t1000\t1000\t1000\t1000\nVmSize:\t  204800 kB\n\
                       VmRSS:\t   10240 kB\nVmData:\t    4096 kB\nVmSwap:\t       0 kB\n";
        let status = parse_status(content);
        assert_eq!(status.vm_rss, 10240 * 1024);
        assert_eq!(status.vm_size, 204800 * 1024);
        assert_eq!(status.vm_data, Some(4096 * 1024));
        assert_eq!(status.vm_swap, Some(0));
        assert_eq!(status.uid, Some(1000));
    }

    #[test]
    fn kernel_thread_status_has_no_memory() {
        let status = parse_status("Name:\tkworker/0:1\nUid:\t0\t0\t0\t0\n");
        assert_eq!(status.vm_rss, 0);
        assert_eq!(status.vm_data, None);
    }

    #[test]
    fn io_reads_storage_bytes() {
        let content = "rchar: 999\nwchar: 888\nsyscr: 1\nsyscw: 2\nread_bytes: 4096\n\
                       write_bytes: 8192\ncancelled_write_bytes: 0\n";
        assert_eq!(parse_io(content), Some((4096, 8192)));
        assert_eq!(parse_io("rchar: 1\n"), None);
    }

    #[test]
    fn cpu_times_count_iowait_as_idle() {
        let content = "cpu  100 5 50 800 20 3 2 0 0 0\ncpu0 50 2 25 400 10 1 1 0 0 0\n\
                       cpu1 50 3 25 400 10 2 1 0 0 0\nbtime 1700000000\n";
        assert_eq!(parse_cpu_times(content), Some((980, 820)));
        assert_eq!(parse_core_count(content), 2);
        assert_eq!(parse_boot_time(content), Some(1_700_000_000));
    }

    #[test]
    fn meminfo_prefers_available() {
        let content = "MemTotal:       16000 kB\nMemFree:         2000 kB\nMemAvailable:    6000 kB\n\
                       Buffers:          500 kB\nCached:          3000 kB\n";
        assert_eq!(parse_meminfo(content), Some((16000 * 1024, 10000 * 1024)));
    }

    #[test]
    fn meminfo_falls_back_without_available() {
        let content = "MemTotal: 1000 kB\nMemFree: 100 kB\nBuffers: 100 kB\nCached: 200 kB\n";
        assert_eq!(parse_meminfo(content), Some((1000 * 1024, 600 * 1024)));
    }

    #[test]
    fn net_dev_sums_interfaces() {
        let content = "Inter-|   Receive                                                |  Transmit\n \
face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed\n    \
lo:    1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0\n  \
eth0:  5000      50    0    0    0     0          0         0     2500      25    0    0    0     0       0          0\n";
        assert_eq!(parse_net_dev(content), Some((6000, 3500)));
    }

    #[test]
    fn cmdline_joins_arguments() {
        assert_eq!(parse_cmdline(b"/usr/bin/python3\0-m\0http.server\0"), "/usr/bin/python3 -m http.server");
        assert_eq!(parse_cmdline(b""), "");
    }

    #[test]
    fn truncated_comm_matches_argv0() {
        let cmdline = b"/opt/app/bin/very-long-service-name\0--flag\0";
        assert!(name_matches("very-long-servi", cmdline, "very-long-service-name"));
        assert!(!name_matches("very-long-servi", cmdline, "very-long-service-other"));
        assert!(name_matches("nginx", b"", "nginx"));
        assert!(!name_matches("nginx", b"", "nginx-extra"));
    }

    #[test]
    fn listing_purges_state_of_exited_processes() {
        let provider = LinuxProvider::new();
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        let io_readable = fs::read_to_string(format!("/proc/{}/io", pid)).is_ok();

        provider.get_metrics(pid).unwrap();
        provider.list_all_processes().unwrap();
        assert!(provider.cpu.lock().unwrap().is_tracked(pid));
        if io_readable {
            assert!(provider.disk.lock().unwrap().is_tracked(&pid));
        }

        provider.kill_process(pid).unwrap();
        child.wait().unwrap();
        provider.list_all_processes().unwrap();
        assert!(!provider.cpu.lock().unwrap().is_tracked(pid));
        assert!(!provider.disk.lock().unwrap().is_tracked(&pid));

        // a recycled PID starts from a fresh baseline
        assert_eq!(provider.cpu.lock().unwrap().observe(pid, 500, 10_000), 0.0);
    }
}
