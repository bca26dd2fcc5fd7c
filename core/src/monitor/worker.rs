//! Worker lifecycle capabilities used by the watchdog.
//!
//! `SpawnedWorker` supervises the worker from outside (CLI, standalone
//! monitor). `ResidentWorker` is what the worker uses on itself: it can
//! re-announce its pid but never signals its own process.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::infrastructure::keys;
use crate::infrastructure::process::{is_pid_alive, spawn_worker, terminate_pid};
use crate::lock::{lock_path, read_owner};
use crate::refresh::publish::Publisher;


pub trait WorkerControl: Send + Sync {
    fn stop(&self, pid: u32) -> Result<()>;
    /// Remove lock and pid artifacts left by a dead worker.
    fn cleanup(&self) -> Result<()>;
    /// Start a worker and return its pid.
    fn start(&self) -> Result<u32>;
}

pub const PID_FILE: &str = "usagebar.pid";

pub struct SpawnedWorker {
    config_dir: PathBuf,
    lock_name: String,
    interval_ms: u64,
    grace: Duration,
}

impl SpawnedWorker {
    pub fn new(config_dir: PathBuf, lock_name: &str, interval_ms: u64) -> Self {
        SpawnedWorker {
            config_dir,
            lock_name: lock_name.to_string(),
            interval_ms,
            grace: Duration::from_secs(3),
        }
    }
}

impl WorkerControl for SpawnedWorker {
    fn stop(&self, pid: u32) -> Result<()> {
        if terminate_pid(pid, self.grace) {
            info!(pid, "worker stopped");
            Ok(())
        } else {
            Err(Error::Other(format!("worker pid {} survived SIGKILL", pid)))
        }
    }

    fn cleanup(&self) -> Result<()> {
        let lock = lock_path(&self.config_dir, &self.lock_name);
        if let Some(owner) = read_owner(&lock) {
            if is_pid_alive(owner.pid) {
                return Err(Error::LockHeld {
                    path: lock,
                    pid: owner.pid,
                });
            }
        }
        for path in [lock, self.config_dir.join(PID_FILE)] {
            match std::fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed stale artifact"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn start(&self) -> Result<u32> {
        spawn_worker(&self.config_dir, self.interval_ms)
    }
}

/// Control handle the running worker holds over itself.
pub struct ResidentWorker {
    publisher: Publisher,
    pid: u32,
}

impl ResidentWorker {
    pub fn new(publisher: Publisher) -> Self {
        ResidentWorker {
            publisher,
            pid: std::process::id(),
        }
    }
}

impl WorkerControl for ResidentWorker {
    fn stop(&self, pid: u32) -> Result<()> {
        if pid == self.pid {
            return Err(Error::Other("refusing to signal own process".into()));
        }
        warn!(pid, "stopping stray worker");
        if terminate_pid(pid, Duration::from_secs(3)) {
            Ok(())
        } else {
            Err(Error::Other(format!("worker pid {} survived SIGKILL", pid)))
        }
    }

    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<u32> {
        self.publisher
            .store()
            .set(&self.publisher.namespace().key(keys::DAEMON_PID), &self.pid.to_string())?;
        info!(pid = self.pid, "re-published worker pid");
        Ok(self.pid)
    }
}
