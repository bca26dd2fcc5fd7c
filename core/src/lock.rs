//! Single-instance lock.
//!
//! The lock is a JSON file `<dir>/<name>.lock` created with `create_new`,
//! recording the owning pid, the time it was last touched and the host. A
//! lock whose owner is dead, or that has not been touched within the
//! timeout, is abandoned and reclaimed.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::now_secs;
use crate::error::{Error, Result};
use crate::infrastructure::process::{hostname, LivenessProbe};


/// A freshly created lock file may be briefly empty before its owner writes it.
const UNREADABLE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockInfo {
    pub pid: u32,
    /// Epoch seconds of acquisition or the last touch.
    pub timestamp: u64,
    pub hostname: String,
}

pub fn lock_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.lock", name))
}

/// Owner recorded in a lock file, if it exists and parses.
pub fn read_owner(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl InstanceLock {
    pub fn acquire(
        dir: &Path,
        name: &str,
        timeout: Duration,
        probe: &dyn LivenessProbe,
    ) -> Result<InstanceLock> {
        std::fs::create_dir_all(dir)?;
        let path = lock_path(dir, name);
        let pid = std::process::id();

        // One reclaim is allowed; losing the race after that means someone
        // else got there first.
        for _ in 0..2 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    let info = LockInfo {
                        pid,
                        timestamp: now_secs(),
                        hostname: hostname(),
                    };
                    file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                    debug!(path = %path.display(), pid, "lock acquired");
                    return Ok(InstanceLock {
                        path,
                        pid,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(Error::Io(e)),
            }

            match read_owner(&path) {
                Some(info) if info.pid == pid => {
                    let lock = InstanceLock {
                        path,
                        pid,
                        released: false,
                    };
                    lock.touch()?;
                    return Ok(lock);
                }
                Some(info) => {
                    let age = now_secs().saturating_sub(info.timestamp);
                    let alive = probe.is_alive(info.pid);
                    if alive && age < timeout.as_secs() {
                        return Err(Error::LockHeld {
                            path,
                            pid: info.pid,
                        });
                    }
                    warn!(
                        path = %path.display(),
                        owner = info.pid,
                        owner_alive = alive,
                        age_secs = age,
                        "reclaiming abandoned lock"
                    );
                }
                None => {
                    let young = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| t.elapsed().ok())
                        .map(|age| age < UNREADABLE_GRACE)
                        .unwrap_or(false);
                    if young {
                        return Err(Error::LockHeld { path, pid: 0 });
                    }
                    warn!(path = %path.display(), "reclaiming unreadable lock");
                }
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let pid = read_owner(&path).map(|i| i.pid).unwrap_or(0);
        Err(Error::LockHeld { path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owned(&self) -> bool {
        !self.released && read_owner(&self.path).map(|i| i.pid) == Some(self.pid)
    }

    /// Refresh the timestamp so the lock does not look abandoned.
    pub fn touch(&self) -> Result<()> {
        if !self.is_owned() {
            return Err(Error::Other(format!(
                "lock {} is no longer owned by pid {}",
                self.path.display(),
                self.pid
            )));
        }
        let info = LockInfo {
            pid: self.pid,
            timestamp: now_secs(),
            hostname: hostname(),
        };
        std::fs::write(&self.path, serde_json::to_string(&info)?)?;
        Ok(())
    }

    /// Remove the lock file if this process still owns it.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        if self.is_owned() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to remove lock");
            }
        }
        self.released = true;
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Probe(bool);

    impl LivenessProbe for Probe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(300);

    fn write_lock(dir: &Path, info: &LockInfo) {
        std::fs::write(lock_path(dir, "usagebar"), serde_json::to_string(info).unwrap()).unwrap();
    }

    #[test]
    fn acquire_writes_owner_record() {
        let dir = tempfile::tempdir().unwrap();
        let lock = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
        let info = read_owner(lock.path()).unwrap();
        assert_eq!(info.pid, std::process::id());
        assert!(!info.hostname.is_empty());
        assert!(lock.is_owned());
    }

    #[test]
    fn live_foreign_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockInfo {
                pid: 4_000_001,
                timestamp: now_secs(),
                hostname: "h".into(),
            },
        );
        let err = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap_err();
        assert!(matches!(err, Error::LockHeld { pid: 4_000_001, .. }));
    }

    #[test]
    fn dead_owner_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockInfo {
                pid: 4_000_001,
                timestamp: now_secs(),
                hostname: "h".into(),
            },
        );
        let lock = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(false)).unwrap();
        assert_eq!(read_owner(lock.path()).unwrap().pid, std::process::id());
    }

    #[test]
    fn expired_lock_is_reclaimed_even_if_owner_alive() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockInfo {
                pid: 4_000_001,
                timestamp: now_secs() - 301,
                hostname: "h".into(),
            },
        );
        assert!(InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).is_ok());
    }

    #[test]
    fn own_lock_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let first = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
        let second = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
        assert!(first.is_owned() && second.is_owned());
    }

    #[test]
    fn fresh_unreadable_lock_is_held() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(lock_path(dir.path(), "usagebar"), "").unwrap();
        let err = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap_err();
        assert!(matches!(err, Error::LockHeld { pid: 0, .. }));
    }

    #[test]
    fn drop_removes_only_owned_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path(), "usagebar");
        {
            let _lock = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());

        let lock = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
        // Someone else reclaimed it meanwhile.
        write_lock(
            dir.path(),
            &LockInfo {
                pid: 4_000_001,
                timestamp: now_secs(),
                hostname: "h".into(),
            },
        );
        assert!(lock.touch().is_err());
        drop(lock);
        assert_eq!(read_owner(&path).unwrap().pid, 4_000_001);
    }

    #[test]
    fn touch_refreshes_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        write_lock(
            dir.path(),
            &LockInfo {
                pid: std::process::id(),
                timestamp: 1,
                hostname: "h".into(),
            },
        );
        let lock = InstanceLock::acquire(dir.path(), "usagebar", TIMEOUT, &Probe(true)).unwrap();
        assert!(read_owner(lock.path()).unwrap().timestamp > 1);
    }
}
