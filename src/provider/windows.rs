//! Windows native API provider.

use std::collections::HashSet;
use std::ffi::c_void;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use chrono::Local;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, FILETIME, HANDLE, NO_ERROR, STILL_ACTIVE};
use windows::Win32::NetworkManagement::IpHelper::{FreeMibTable, GetIfTable2, MIB_IF_ROW2, MIB_IF_TABLE2};
use windows::Win32::Security::{
    GetTokenInformation, LookupAccountSidW, TokenUser, SID_NAME_USE, TOKEN_QUERY, TOKEN_USER,
};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W, TH32CS_SNAPPROCESS,
};
use windows::Win32::System::ProcessStatus::{
    GetProcessMemoryInfo, PROCESS_MEMORY_COUNTERS, PROCESS_MEMORY_COUNTERS_EX,
};
use windows::Win32::System::SystemInformation::{
    GetSystemInfo, GlobalMemoryStatusEx, MEMORYSTATUSEX, SYSTEM_INFO,
};
use windows::Win32::System::Threading::{
    GetExitCodeProcess, GetProcessHandleCount, GetProcessIoCounters, GetProcessTimes,
    GetSystemTimes, OpenProcess, OpenProcessToken, QueryFullProcessImageNameW, TerminateProcess,
    IO_COUNTERS, PROCESS_ACCESS_RIGHTS, PROCESS_NAME_WIN32, PROCESS_QUERY_LIMITED_INFORMATION,
    PROCESS_TERMINATE, PROCESS_VM_READ,
};

use super::background::{SystemCounters, SystemSampler};
use super::control;
use super::sampling::{CpuTracker, RateTracker};
use super::MetricsProvider;
use crate::error::{AppError, Result};
use crate::types::{MetricSample, ProcessInfo, SystemMetrics};

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_OFFSET: u64 = 116_444_736_000_000_000;
const FILETIME_TICKS_PER_SEC: u64 = 10_000_000;

/// Closes the wrapped handle on drop, on every return path.
pub(super) struct OwnedHandle(HANDLE);

impl OwnedHandle {
    pub(super) fn open_process(pid: u32, access: PROCESS_ACCESS_RIGHTS) -> Option<Self> {
        unsafe { OpenProcess(access, false, pid) }.ok().map(Self)
    }

    fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

fn filetime_to_u64(ft: FILETIME) -> u64 {
    (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
}

fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|c| *c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}

/// Exact name or `name.exe`, ignoring case.
pub(crate) fn exe_name_matches(exe: &str, name: &str) -> bool {
    exe.eq_ignore_ascii_case(name) || exe.eq_ignore_ascii_case(&format!("{}.exe", name))
}

/// Check if a process is alive via OpenProcess + GetExitCodeProcess.
pub fn is_process_alive(pid: u32) -> bool {
    let Some(handle) = OwnedHandle::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION) else {
        return false;
    };
    let mut exit_code: u32 = 0;
    unsafe { GetExitCodeProcess(handle.raw(), &mut exit_code) }.is_ok()
        && (exit_code as i32) == STILL_ACTIVE.0
}

pub(super) fn terminate(pid: u32) -> Result<()> {
    let handle = OwnedHandle::open_process(pid, PROCESS_TERMINATE)
        .ok_or_else(|| AppError::kill_failed(pid, "OpenProcess failed"))?;
    unsafe { TerminateProcess(handle.raw(), 1) }
        .map_err(|e| AppError::kill_failed(pid, format!("TerminateProcess failed: {}", e)))
}

/// `(pid, exe name)` for every process in a Toolhelp snapshot.
fn snapshot_processes() -> Result<Vec<(u32, String)>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }
        .map_err(|e| AppError::process(format!("CreateToolhelp32Snapshot failed: {}", e)))?;
    let snapshot = OwnedHandle(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut processes = Vec::new();
    if unsafe { Process32FirstW(snapshot.raw(), &mut entry) }.is_err() {
        return Ok(processes);
    }
    loop {
        processes.push((entry.th32ProcessID, wide_to_string(&entry.szExeFile)));
        if unsafe { Process32NextW(snapshot.raw(), &mut entry) }.is_err() {
            break;
        }
    }
    Ok(processes)
}

/// user + kernel time of a process, in 100ns units, plus its creation time.
fn process_times(handle: &OwnedHandle) -> Option<(u64, u64)> {
    let mut creation = FILETIME::default();
    let mut exit = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();
    unsafe { GetProcessTimes(handle.raw(), &mut creation, &mut exit, &mut kernel, &mut user) }.ok()?;
    Some((
        filetime_to_u64(kernel) + filetime_to_u64(user),
        filetime_to_u64(creation),
    ))
}

/// `(kernel + user, idle)` summed over all cores. Kernel time includes idle.
fn system_times() -> Option<(u64, u64)> {
    let mut idle = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();
    unsafe { GetSystemTimes(Some(&mut idle), Some(&mut kernel), Some(&mut user)) }.ok()?;
    Some((
        filetime_to_u64(kernel) + filetime_to_u64(user),
        filetime_to_u64(idle),
    ))
}

fn memory_counters(handle: &OwnedHandle) -> PROCESS_MEMORY_COUNTERS_EX {
    let mut counters = PROCESS_MEMORY_COUNTERS_EX {
        cb: std::mem::size_of::<PROCESS_MEMORY_COUNTERS_EX>() as u32,
        ..Default::default()
    };
    let ok = unsafe {
        GetProcessMemoryInfo(
            handle.raw(),
            (&mut counters as *mut PROCESS_MEMORY_COUNTERS_EX).cast::<PROCESS_MEMORY_COUNTERS>(),
            counters.cb,
        )
    }
    .is_ok();
    if ok {
        counters
    } else {
        PROCESS_MEMORY_COUNTERS_EX::default()
    }
}

fn handle_count(handle: &OwnedHandle) -> u32 {
    let mut count = 0u32;
    match unsafe { GetProcessHandleCount(handle.raw(), &mut count) } {
        Ok(()) => count,
        Err(_) => 0,
    }
}

fn io_bytes(handle: &OwnedHandle) -> Option<(u64, u64)> {
    let mut counters = IO_COUNTERS::default();
    unsafe { GetProcessIoCounters(handle.raw(), &mut counters) }.ok()?;
    Some((counters.ReadTransferCount, counters.WriteTransferCount))
}

fn image_path(handle: &OwnedHandle) -> Option<String> {
    let mut buf = [0u16; 1024];
    let mut size = buf.len() as u32;
    unsafe {
        QueryFullProcessImageNameW(
            handle.raw(),
            PROCESS_NAME_WIN32,
            PWSTR(buf.as_mut_ptr()),
            &mut size,
        )
    }
    .ok()?;
    Some(String::from_utf16_lossy(&buf[..size as usize]))
}

fn process_username(handle: &OwnedHandle) -> Option<String> {
    let mut token = HANDLE::default();
    unsafe { OpenProcessToken(handle.raw(), TOKEN_QUERY, &mut token) }.ok()?;
    let token = OwnedHandle(token);

    let mut needed = 0u32;
    let _ = unsafe { GetTokenInformation(token.raw(), TokenUser, None, 0, &mut needed) };
    if needed == 0 {
        return None;
    }
    // u64 storage keeps TOKEN_USER aligned
    let mut buffer = vec![0u64; (needed as usize).div_ceil(8)];
    unsafe {
        GetTokenInformation(
            token.raw(),
            TokenUser,
            Some(buffer.as_mut_ptr().cast::<c_void>()),
            needed,
            &mut needed,
        )
    }
    .ok()?;
    let user = unsafe { &*(buffer.as_ptr().cast::<TOKEN_USER>()) };

    let mut name = [0u16; 256];
    let mut domain = [0u16; 256];
    let mut name_len = name.len() as u32;
    let mut domain_len = domain.len() as u32;
    let mut sid_use = SID_NAME_USE::default();
    unsafe {
        LookupAccountSidW(
            PCWSTR::null(),
            user.User.Sid,
            Some(PWSTR(name.as_mut_ptr())),
            &mut name_len,
            Some(PWSTR(domain.as_mut_ptr())),
            &mut domain_len,
            &mut sid_use,
        )
    }
    .ok()?;

    let name = wide_to_string(&name);
    let domain = wide_to_string(&domain);
    Some(if domain.is_empty() {
        name
    } else {
        format!("{}\\{}", domain, name)
    })
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

fn uptime_from_creation(creation: u64) -> u64 {
    if creation <= FILETIME_UNIX_OFFSET {
        return 0;
    }
    let started = (creation - FILETIME_UNIX_OFFSET) / FILETIME_TICKS_PER_SEC;
    unix_now_secs().saturating_sub(started)
}

struct NativeCounters;

impl SystemCounters for NativeCounters {
    fn cpu_times(&mut self) -> Option<(u64, u64)> {
        system_times()
    }

    fn net_bytes(&mut self) -> Option<(u64, u64)> {
        let mut table: *mut MIB_IF_TABLE2 = std::ptr::null_mut();
        if unsafe { GetIfTable2(&mut table) } != NO_ERROR || table.is_null() {
            return None;
        }
        let (mut recv, mut sent) = (0u64, 0u64);
        unsafe {
            let count = (*table).NumEntries as usize;
            let rows = std::slice::from_raw_parts((*table).Table.as_ptr().cast::<MIB_IF_ROW2>(), count);
            for row in rows {
                recv += row.InOctets;
                sent += row.OutOctets;
            }
            FreeMibTable(table.cast::<c_void>().cast_const());
        }
        Some((recv, sent))
    }
}

pub struct WindowsProvider {
    cores: usize,
    cpu: Mutex<CpuTracker>,
    disk: Mutex<RateTracker<u32, 2>>,
    sampler: SystemSampler,
}

impl WindowsProvider {
    pub fn new() -> Self {
        let mut info = SYSTEM_INFO::default();
        unsafe { GetSystemInfo(&mut info) };
        let cores = (info.dwNumberOfProcessors as usize).max(1);
        log::info!("Windows provider initialized with {} cores", cores);

        Self {
            cores,
            cpu: Mutex::new(CpuTracker::new(cores)),
            disk: Mutex::new(RateTracker::new()),
            sampler: SystemSampler::spawn(NativeCounters),
        }
    }

    /// Stop the background system sampler.
    pub fn shutdown(&self) {
        self.sampler.shutdown();
    }

    fn open_for_query(pid: u32) -> Option<OwnedHandle> {
        OwnedHandle::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION | PROCESS_VM_READ)
            .or_else(|| OwnedHandle::open_process(pid, PROCESS_QUERY_LIMITED_INFORMATION))
    }

    fn cpu_percent(&self, pid: u32, proc_time: u64) -> f64 {
        let Some((sys_total, _)) = system_times() else {
            return 0.0;
        };
        let mut cpu = self.cpu.lock().unwrap_or_else(|e| e.into_inner());
        cpu.observe(pid, proc_time, sys_total)
    }

    fn process_info(&self, pid: u32, name: String, now: Instant) -> ProcessInfo {
        let mut info = ProcessInfo {
            pid,
            name,
            status: "running".to_string(),
            ..Default::default()
        };
        let Some(handle) = Self::open_for_query(pid) else {
            return info;
        };

        if let Some((proc_time, creation)) = process_times(&handle) {
            info.cpu_pct = self.cpu_percent(pid, proc_time);
            info.uptime_secs = uptime_from_creation(creation);
        }

        let mem = memory_counters(&handle);
        info.rss_bytes = mem.WorkingSetSize as u64;
        info.vms = mem.PrivateUsage as u64;
        info.paged_pool = mem.QuotaPagedPoolUsage as u64;
        info.non_paged_pool = mem.QuotaNonPagedPoolUsage as u64;
        info.num_fds = handle_count(&handle);
        info.username = process_username(&handle).unwrap_or_default();

        if let Some((read, write)) = io_bytes(&handle) {
            let mut disk = self.disk.lock().unwrap_or_else(|e| e.into_inner());
            let [r, w] = disk.observe(pid, [read, write], now);
            info.disk_read_rate = r;
            info.disk_write_rate = w;
            info.disk_io = r + w;
        }

        if let Some(path) = image_path(&handle) {
            info.cmdline = format!("\"{}\"", path);
        }
        info
    }
}

impl Default for WindowsProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for WindowsProvider {
    fn find_all_pids_by_name(&self, name: &str) -> Result<Vec<u32>> {
        let mut pids: Vec<u32> = snapshot_processes()?
            .into_iter()
            .filter(|(_, exe)| exe_name_matches(exe, name))
            .map(|(pid, _)| pid)
            .collect();
        pids.sort_unstable();
        Ok(pids)
    }

    fn get_metrics(&self, pid: u32) -> Result<MetricSample> {
        let handle = Self::open_for_query(pid).ok_or_else(|| AppError::not_alive(pid))?;
        let (proc_time, _) = process_times(&handle)
            .ok_or_else(|| AppError::process(format!("GetProcessTimes failed for PID {}", pid)))?;
        let mem = memory_counters(&handle);
        let name = image_path(&handle)
            .and_then(|path| path.rsplit('\\').next().map(str::to_string))
            .unwrap_or_default();

        Ok(MetricSample {
            timestamp: Local::now(),
            pid,
            name,
            cpu_percent: self.cpu_percent(pid, proc_time),
            resident_memory_bytes: mem.WorkingSetSize as u64,
            alive: true,
        })
    }

    fn is_alive(&self, pid: u32) -> bool {
        control::is_process_alive(pid)
    }

    fn kill_process(&self, pid: u32) -> Result<()> {
        control::force_kill(pid)
    }

    fn execute_restart(&self, command: &str) -> Result<()> {
        control::spawn_shell(command)
    }

    fn list_all_processes(&self) -> Result<Vec<ProcessInfo>> {
        let now = Instant::now();
        let processes = snapshot_processes()?;
        let live: HashSet<u32> = processes.iter().map(|(pid, _)| *pid).collect();

        let result = processes
            .into_iter()
            .map(|(pid, name)| self.process_info(pid, name, now))
            .collect();

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
        let mut status = MEMORYSTATUSEX {
            dwLength: std::mem::size_of::<MEMORYSTATUSEX>() as u32,
            ..Default::default()
        };
        let (memory_total, memory_used) = match unsafe { GlobalMemoryStatusEx(&mut status) } {
            Ok(()) => (
                status.ullTotalPhys,
                status.ullTotalPhys.saturating_sub(status.ullAvailPhys),
            ),
            Err(_) => (0, 0),
        };
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
