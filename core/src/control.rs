//! Control: worker lifecycle operations used by the command-line frontend.
//!
//! Everything here runs outside the worker process. The worker is found
//! through the pid it announces in the store (falling back to
//! `usagebar.pid`), stopped with signals, and started as a detached child.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::now_ms;
use crate::daemon::{load_settings, CONFIG_FILE, STATS_FILE};
use crate::error::{Error, Result};
use crate::infrastructure::keys;
use crate::infrastructure::process::{send_signal, LivenessProbe, SignalProbe};
use crate::infrastructure::runner::{CommandRunner, ShellRunner};
use crate::infrastructure::tmux::TmuxStore;
use crate::infrastructure::KeyValueStore;
use crate::lock::lock_path;
use crate::monitor::freshness::FreshnessTracker;
use crate::monitor::reliability::{start_monitoring, ReliabilityCoordinator};
use crate::monitor::watchdog::ProcessWatchdog;
use crate::monitor::worker::{SpawnedWorker, WorkerControl, PID_FILE};
use crate::recovery::{Sleeper, ThreadSleeper};
use crate::refresh::{CommandSource, CycleOutcome, Publisher, RefreshCycle, UpstreamSource};
use crate::timer::RepeatingTimer;
use crate::types::config::Settings;
use crate::types::health::{RecoveryOutcome, ReliabilityReport};

/// How long `start_detached` waits for the new worker to announce itself.
const START_TIMEOUT: Duration = Duration::from_secs(10);
const START_POLL: Duration = Duration::from_millis(100);


/// Resolve the configuration directory.
///
/// Priority: explicit override, `USAGEBAR_CONFIG_DIR`, `$HOME/.config/usagebar`.
pub fn resolve_config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if let Ok(dir) = std::env::var("USAGEBAR_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home).join(".config").join("usagebar")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped { pid: u32 },
    /// No live worker; stale artifacts were cleaned up.
    NotRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearOutcome {
    pub removed: usize,
    /// Pid of the worker told to drop its cache.
    pub signalled: Option<u32>,
}

/// Everything `usagebar status` prints.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub config_dir: PathBuf,
    pub report: ReliabilityReport,
    /// Published values with freshness and age added.
    pub published: BTreeMap<String, String>,
    /// The worker's last `stats.json`, if any.
    pub worker_stats: Option<serde_json::Value>,
}


pub struct Control {
    config_dir: PathBuf,
    settings: Settings,
    store: Arc<dyn KeyValueStore>,
    upstream: Arc<dyn UpstreamSource>,
    probe: Arc<dyn LivenessProbe>,
    worker: Arc<dyn WorkerControl>,
    sleeper: Arc<dyn Sleeper>,
}

impl Control {
    /// Production wiring. `interval_ms` overrides the interval passed to a
    /// worker started from here.
    pub fn new(config_dir: &Path, interval_ms: Option<u64>) -> Control {
        let settings = load_settings(config_dir);
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        let store = Arc::new(TmuxStore::new(
            runner.clone(),
            Duration::from_millis(settings.refresh.store_timeout_ms),
            Duration::from_millis(settings.refresh.bulk_timeout_ms),
        ));
        let upstream = Arc::new(CommandSource::from_settings(runner, &settings.refresh));
        let worker = Arc::new(SpawnedWorker::new(
            config_dir.to_path_buf(),
            &settings.lock.name,
            interval_ms.unwrap_or(settings.refresh.interval_ms),
        ));
        Control {
            config_dir: config_dir.to_path_buf(),
            settings,
            store,
            upstream,
            probe: Arc::new(SignalProbe),
            worker,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_parts(
        config_dir: &Path,
        settings: Settings,
        store: Arc<dyn KeyValueStore>,
        upstream: Arc<dyn UpstreamSource>,
        probe: Arc<dyn LivenessProbe>,
        worker: Arc<dyn WorkerControl>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Control {
        Control {
            config_dir: config_dir.to_path_buf(),
            settings,
            store,
            upstream,
            probe,
            worker,
            sleeper,
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.store.clone(),
            crate::infrastructure::Namespace::new(&self.settings.store.prefix),
        )
    }

    /// The announced worker pid if that process is alive.
    pub fn live_worker(&self) -> Option<u32> {
        let from_store = self
            .publisher()
            .get(keys::DAEMON_PID)
            .ok()
            .flatten()
            .and_then(|v| v.trim().parse::<u32>().ok());
        let from_file = || {
            std::fs::read_to_string(self.config_dir.join(PID_FILE))
                .ok()
                .and_then(|v| v.trim().parse::<u32>().ok())
        };
        from_store
            .or_else(from_file)
            .filter(|pid| *pid > 0 && self.probe.is_alive(*pid))
    }

    /// Run one refresh cycle in this process and return what it published.
    pub fn run_once(&self) -> (CycleOutcome, BTreeMap<String, String>) {
        let mut cycle = RefreshCycle::new(
            self.store.clone(),
            self.upstream.clone(),
            self.sleeper.clone(),
            Some(self.config_dir.join(CONFIG_FILE)),
            self.settings.clone(),
        );
        let outcome = cycle.tick(now_ms());
        let published = cycle.publisher().read().unwrap_or_default();
        (outcome, published)
    }

    /// Spawn a detached worker and wait until it announces a live pid.
    pub fn start_detached(&self) -> Result<u32> {
        if let Some(pid) = self.live_worker() {
            return Err(Error::LockHeld {
                path: lock_path(&self.config_dir, &self.settings.lock.name),
                pid,
            });
        }
        let spawned = self.worker.start()?;

        let watchdog = self.watchdog();
        let mut waited = Duration::ZERO;
        while waited < START_TIMEOUT {
            watchdog.clear_pid_cache();
            if let Some(pid) = watchdog.get_daemon_pid(now_ms())? {
                if watchdog.is_process_alive(pid) {
                    info!(pid, "worker is up");
                    return Ok(pid);
                }
            }
            self.sleeper.sleep(START_POLL);
            waited += START_POLL;
        }
        Err(Error::Other(format!(
            "worker pid {} did not become healthy within {}s; see daemon.log",
            spawned,
            START_TIMEOUT.as_secs()
        )))
    }

    /// Stop a live worker, or mark the store stopped and clean up after a
    /// dead one.
    pub fn stop(&self) -> Result<StopOutcome> {
        if let Some(pid) = self.live_worker() {
            self.worker.stop(pid)?;
            return Ok(StopOutcome::Stopped { pid });
        }

        let publisher = self.publisher();
        if let Err(e) = publisher.mark_stopped(&self.settings.colors.inactive) {
            warn!(error = %e, "could not publish stopped status");
        }
        if let Err(e) = self
            .store
            .unset(&publisher.namespace().key(keys::DAEMON_PID))
        {
            warn!(error = %e, "could not remove stale worker pid");
        }
        self.worker.cleanup()?;
        Ok(StopOutcome::NotRunning)
    }

    /// Unset every published key and tell a live worker to drop its cache.
    pub fn clear(&self) -> Result<ClearOutcome> {
        let removed = self.publisher().clear(true)?;
        let signalled = self
            .live_worker()
            .filter(|pid| send_signal(*pid, libc::SIGUSR1));
        Ok(ClearOutcome { removed, signalled })
    }

    pub fn status(&self, now_ms: u64) -> StatusReport {
        let coordinator = self.coordinator();
        let report = coordinator.generate_report(now_ms);
        let published = match (self.publisher().read(), report.freshness.as_ref()) {
            (Ok(values), Some(sample)) => coordinator.freshness().annotate(&values, sample),
            (Ok(values), None) => values,
            (Err(_), _) => BTreeMap::new(),
        };
        StatusReport {
            config_dir: self.config_dir.clone(),
            report,
            published,
            worker_stats: read_worker_stats(&self.config_dir),
        }
    }

    /// One auto-recovery pass from outside the worker.
    pub fn heal(&self, now_ms: u64) -> RecoveryOutcome {
        self.coordinator().perform_auto_recovery(now_ms)
    }

    /// Supervise the worker from this process until the timer is dropped.
    pub fn monitor(&self, interval: Duration) -> Result<RepeatingTimer> {
        start_monitoring(Arc::new(Mutex::new(self.coordinator())), interval)
    }

    fn watchdog(&self) -> ProcessWatchdog {
        ProcessWatchdog::new(
            self.publisher(),
            self.probe.clone(),
            self.worker.clone(),
            self.sleeper.clone(),
            self.settings.watchdog.clone(),
        )
    }

    fn coordinator(&self) -> ReliabilityCoordinator {
        let freshness = FreshnessTracker::new(
            self.publisher(),
            self.settings.freshness.clone(),
            &self.settings.colors.error,
        );
        ReliabilityCoordinator::new(
            self.watchdog(),
            freshness,
            self.sleeper.clone(),
            self.settings.reliability.clone(),
        )
    }
}

pub fn read_worker_stats(config_dir: &Path) -> Option<serde_json::Value> {
    let raw = std::fs::read_to_string(config_dir.join(STATS_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}
