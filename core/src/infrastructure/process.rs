//! OS process primitives: liveness probing, termination, and spawning the
//! detached worker.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};


/// Capability to ask the OS whether a process exists.
pub trait LivenessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Production probe: `kill(pid, 0)`.
///
/// `ESRCH` means the process is gone; any other outcome (including `EPERM`
/// for a process owned by someone else) means it exists.
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Check if a process with the given PID is alive. PIDs that cannot name a
/// single process (0, or beyond `pid_t`) are reported dead without probing.
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

/// Stop a process: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns `true` once the process is gone.
pub fn terminate_pid(pid: u32, grace: Duration) -> bool {
    if !is_pid_alive(pid) {
        return true;
    }
    let raw = pid as libc::pid_t;
    unsafe {
        libc::kill(raw, libc::SIGTERM);
    }

    let step = Duration::from_millis(50);
    let mut waited = Duration::ZERO;
    while waited < grace {
        if !is_pid_alive(pid) {
            debug!(pid, "process exited after SIGTERM");
            return true;
        }
        std::thread::sleep(step);
        waited += step;
    }

    info!(pid, "process ignored SIGTERM, sending SIGKILL");
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }
    std::thread::sleep(step);
    !is_pid_alive(pid)
}

/// Deliver an arbitrary signal; `false` if the process could not be signalled.
pub fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

/// Start the worker as a detached background process.
///
/// Spawns `<current_exe> start <interval_ms>` with `USAGEBAR_CONFIG_DIR` set
/// to the given directory and stdout/stderr redirected to `daemon.log`.
/// Returns the PID of the spawned process.
pub fn spawn_worker(config_dir: &Path, interval_ms: u64) -> Result<u32> {
    let exe = std::env::current_exe()
        .map_err(|e| Error::Other(format!("cannot determine current executable: {}", e)))?;

    std::fs::create_dir_all(config_dir)?;
    let log_path = config_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let log_stderr = log_file.try_clone()?;

    let mut command = Command::new(&exe);
    command
        .args(["start", &interval_ms.to_string()])
        .env("USAGEBAR_CONFIG_DIR", config_dir)
        .stdin(std::process::Stdio::null())
        .stdout(log_file)
        .stderr(log_stderr);

    let pid = spawn_detached(command)?;
    info!(pid, log = %log_path.display(), "spawned detached worker");
    Ok(pid)
}

/// Spawn `command` in its own process group and reap it from a background
/// thread. An unreaped child stays a zombie after exit, and `kill(pid, 0)`
/// still succeeds on a zombie.
pub fn spawn_detached(mut command: Command) -> Result<u32> {
    let mut child = command
        .process_group(0)
        .spawn()
        .map_err(|e| Error::Other(format!("cannot spawn worker: {}", e)))?;
    let pid = child.id();

    std::thread::Builder::new()
        .name(format!("usagebar-reap-{}", pid))
        .spawn(move || match child.wait() {
            Ok(status) => debug!(pid, %status, "detached child exited"),
            Err(e) => debug!(pid, error = %e, "cannot wait on detached child"),
        })
        .map_err(|e| Error::Other(format!("cannot start reaper thread: {}", e)))?;
    Ok(pid)
}

/// Host name for lock ownership records.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if ret != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}
