//! Platform-agnostic process control: liveness, termination, restart spawn.

use std::process::Stdio;

use tokio::process::Command;

use crate::error::{AppError, Result};

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::windows::is_process_alive(pid)
}

/// Check if a process is alive by PID.
///
/// Zombies still answer the null signal; the Linux provider filters them separately.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    raw > 0 && kill(Pid::from_raw(raw), None).is_ok()
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    super::windows::terminate(pid)
}

#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| AppError::kill_failed(pid, "invalid pid"))?;
    kill(Pid::from_raw(raw), Signal::SIGKILL)
        .map_err(|e| AppError::kill_failed(pid, format!("SIGKILL failed: {}", e)))
}

fn shell_command(command: &str) -> Command {
    #[cfg(target_os = "windows")]
    let mut cmd = {
        use windows::Win32::System::Threading::CREATE_NO_WINDOW;

        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd.creation_flags(CREATE_NO_WINDOW.0);
        cmd
    };

    #[cfg(not(target_os = "windows"))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd.process_group(0);
        cmd
    };

    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

/// Launch `command` through the platform shell without waiting for it.
///
/// Needs a Tokio runtime; the child is reaped by a background task.
pub fn spawn_shell(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(AppError::restart_failed(command, "empty command"));
    }
    if tokio::runtime::Handle::try_current().is_err() {
        return Err(AppError::restart_failed(command, "no async runtime"));
    }

    let mut child = shell_command(command)
        .spawn()
        .map_err(|e| AppError::restart_failed(command, e.to_string()))?;
    let pid = child.id().unwrap_or_default();

    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => log::debug!("Restart shell {} finished: {}", pid, status),
            Err(e) => log::warn!("Failed to wait for restart shell {}: {}", pid, e),
        }
    });

    log::info!("Restart command launched (shell pid {}): {}", pid, command);
    Ok(())
}
