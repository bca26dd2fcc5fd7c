//! Process watchdog for the worker.
//!
//! The worker announces its pid in the store on startup. The watchdog reads
//! it back (cached for `pid_cache_ms`), probes liveness, and restarts the
//! worker through a `WorkerControl` with bounded attempts and a cooldown.
//! `perform_health_check` only diagnoses; it never acts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::infrastructure::keys;
use crate::infrastructure::process::LivenessProbe;
use crate::recovery::retry::Sleeper;
use crate::refresh::publish::Publisher;
use crate::types::config::WatchdogSettings;
use crate::types::health::DaemonHealth;

use super::worker::WorkerControl;


#[derive(Debug, Clone, Copy)]
struct CachedPid {
    pid: Option<u32>,
    read_at_ms: u64,
}

pub struct ProcessWatchdog {
    publisher: Publisher,
    probe: Arc<dyn LivenessProbe>,
    worker: Arc<dyn WorkerControl>,
    sleeper: Arc<dyn Sleeper>,
    settings: WatchdogSettings,
    cached: Mutex<Option<CachedPid>>,
}

impl ProcessWatchdog {
    pub fn new(
        publisher: Publisher,
        probe: Arc<dyn LivenessProbe>,
        worker: Arc<dyn WorkerControl>,
        sleeper: Arc<dyn Sleeper>,
        settings: WatchdogSettings,
    ) -> Self {
        ProcessWatchdog {
            publisher,
            probe,
            worker,
            sleeper,
            settings,
            cached: Mutex::new(None),
        }
    }

    /// Pid the worker published, served from cache while it is recent.
    pub fn get_daemon_pid(&self, now_ms: u64) -> Result<Option<u32>> {
        if let Ok(cached) = self.cached.lock() {
            if let Some(c) = *cached {
                if now_ms.saturating_sub(c.read_at_ms) < self.settings.pid_cache_ms {
                    return Ok(c.pid);
                }
            }
        }

        let pid = self
            .publisher
            .get(keys::DAEMON_PID)?
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|p| *p > 0);
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(CachedPid {
                pid,
                read_at_ms: now_ms,
            });
        }
        Ok(pid)
    }

    pub fn clear_pid_cache(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = None;
        }
    }

    /// Non-positive pids are dead without asking the OS.
    pub fn is_process_alive(&self, pid: u32) -> bool {
        pid > 0 && self.probe.is_alive(pid)
    }

    pub fn is_healthy(&self, now_ms: u64) -> Result<bool> {
        Ok(match self.get_daemon_pid(now_ms)? {
            Some(pid) => self.is_process_alive(pid),
            None => false,
        })
    }

    /// Stop whatever is there, clean up, start fresh, and re-check.
    pub fn restart(&self, now_ms: u64) -> Result<bool> {
        if let Ok(Some(pid)) = self.get_daemon_pid(now_ms) {
            if self.is_process_alive(pid) {
                if let Err(e) = self.worker.stop(pid) {
                    debug!(pid, error = %e, "stop before restart failed");
                }
            }
        }
        if let Err(e) = self.worker.cleanup() {
            warn!(error = %e, "cleanup before restart failed");
        }
        match self.worker.start() {
            Ok(pid) => info!(pid, "worker started"),
            Err(e) => {
                warn!(error = %e, "failed to start worker");
                return Ok(false);
            }
        }

        self.sleeper
            .sleep(Duration::from_millis(self.settings.settle_ms));
        self.clear_pid_cache();
        self.is_healthy(now_ms.saturating_add(self.settings.settle_ms))
    }

    /// Make sure a worker is running, restarting up to the configured limit.
    pub fn ensure_running(&self, now_ms: u64) -> Result<bool> {
        if self.is_healthy(now_ms)? {
            return Ok(true);
        }
        let max = self.settings.max_restart_attempts.max(1);
        for attempt in 1..=max {
            info!(attempt, max, "restarting worker");
            if self.restart(now_ms)? {
                return Ok(true);
            }
            if attempt < max {
                self.sleeper
                    .sleep(Duration::from_millis(self.settings.restart_cooldown_ms));
            }
        }
        warn!(attempts = max, "worker restart attempts exhausted");
        Ok(false)
    }

    pub fn perform_health_check(&self, now_ms: u64) -> Result<DaemonHealth> {
        let mut health = DaemonHealth {
            daemon_pid: self.get_daemon_pid(now_ms)?,
            ..DaemonHealth::default()
        };
        match health.daemon_pid {
            None => {
                health.issues.push("no worker pid published".into());
                health
                    .recovery_actions
                    .push("start the worker: usagebar start --detach".into());
            }
            Some(pid) if !self.is_process_alive(pid) => {
                health
                    .issues
                    .push(format!("worker pid {} is not running", pid));
                health
                    .recovery_actions
                    .push("restart the worker: usagebar heal".into());
                health
                    .recovery_actions
                    .push("inspect daemon.log in the config directory".into());
            }
            Some(_) => health.is_alive = true,
        }
        Ok(health)
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::infrastructure::mock::MockStore;
    use crate::infrastructure::Namespace;
    use crate::recovery::retry::tests::RecordingSleeper;

    /// Liveness from a mutable set of pids.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub alive: Mutex<HashSet<u32>>,
        pub probes: AtomicU32,
    }

    impl FakeProbe {
        pub fn set_alive(&self, pid: u32, alive: bool) {
            let mut set = self.alive.lock().unwrap();
            if alive {
                set.insert(pid);
            } else {
                set.remove(&pid);
            }
        }
    }

    impl LivenessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.alive.lock().unwrap().contains(&pid)
        }
    }

    /// Starts "processes" by publishing a pid and marking it alive, after a
    /// scripted number of failed starts.
    pub(crate) struct FakeWorker {
        pub store: Arc<MockStore>,
        pub probe: Arc<FakeProbe>,
        pub next_pid: AtomicU32,
        pub failing_starts: AtomicU32,
        pub starts: AtomicU32,
        pub stops: AtomicU32,
        pub cleanups: AtomicU32,
    }

    impl FakeWorker {
        pub fn new(store: Arc<MockStore>, probe: Arc<FakeProbe>, failing_starts: u32) -> Self {
            FakeWorker {
                store,
                probe,
                next_pid: AtomicU32::new(5_000),
                failing_starts: AtomicU32::new(failing_starts),
                starts: AtomicU32::new(0),
                stops: AtomicU32::new(0),
                cleanups: AtomicU32::new(0),
            }
        }
    }

    impl WorkerControl for FakeWorker {
        fn stop(&self, pid: u32) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            self.probe.set_alive(pid, false);
            Ok(())
        }

        fn cleanup(&self) -> Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn start(&self) -> Result<u32> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            // A failing start spawns something that dies immediately.
            if self.failing_starts.load(Ordering::SeqCst) > 0 {
                self.failing_starts.fetch_sub(1, Ordering::SeqCst);
                return Ok(pid);
            }
            self.store.seed("@usagebar_daemon_pid", &pid.to_string());
            self.probe.set_alive(pid, true);
            Ok(pid)
        }
    }

    pub(crate) struct Rig {
        pub store: Arc<MockStore>,
        pub probe: Arc<FakeProbe>,
        pub worker: Arc<FakeWorker>,
        pub sleeper: Arc<RecordingSleeper>,
    }

    pub(crate) fn rig(failing_starts: u32) -> (Rig, ProcessWatchdog) {
        let store = Arc::new(MockStore::new());
        let probe = Arc::new(FakeProbe::default());
        let worker = Arc::new(FakeWorker::new(store.clone(), probe.clone(), failing_starts));
        let sleeper = Arc::new(RecordingSleeper::default());
        let publisher = Publisher::new(store.clone(), Namespace::new("@usagebar_"));
        let watchdog = ProcessWatchdog::new(
            publisher,
            probe.clone(),
            worker.clone(),
            sleeper.clone(),
            WatchdogSettings::default(),
        );
        let rig = Rig {
            store,
            probe,
            worker,
            sleeper,
        };
        (rig, watchdog)
    }

    #[test]
    fn exited_detached_worker_is_unhealthy() {
        use crate::infrastructure::process::{spawn_detached, SignalProbe};

        let mut command = std::process::Command::new("sh");
        command.args(["-c", "exit 0"]);
        let pid = spawn_detached(command).unwrap();

        let store = Arc::new(MockStore::new());
        store.seed("@usagebar_daemon_pid", &pid.to_string());
        let probe = Arc::new(FakeProbe::default());
        let w = ProcessWatchdog::new(
            Publisher::new(store.clone(), Namespace::new("@usagebar_")),
            Arc::new(SignalProbe),
            Arc::new(FakeWorker::new(store, probe, 0)),
            Arc::new(RecordingSleeper::default()),
            WatchdogSettings::default(),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while w.is_process_alive(pid) && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(w.get_daemon_pid(0).unwrap(), Some(pid));
        assert!(!w.is_healthy(0).unwrap());
    }

    #[test]
    fn no_pid_is_unhealthy() {
        let (_, w) = rig(0);
        assert_eq!(w.get_daemon_pid(0).unwrap(), None);
        assert!(!w.is_healthy(0).unwrap());
    }

    #[test]
    fn live_pid_is_healthy() {
        let (r, w) = rig(0);
        r.store.seed("@usagebar_daemon_pid", "4242");
        r.probe.set_alive(4242, true);
        assert!(w.is_healthy(0).unwrap());
    }

    #[test]
    fn invalid_pids_are_dead_without_probing() {
        let (r, w) = rig(0);
        assert!(!w.is_process_alive(0));
        assert_eq!(r.probe.probes.load(Ordering::SeqCst), 0);

        r.store.seed("@usagebar_daemon_pid", "-12");
        assert_eq!(w.get_daemon_pid(0).unwrap(), None);
        w.clear_pid_cache();
        r.store.seed("@usagebar_daemon_pid", "0");
        assert_eq!(w.get_daemon_pid(0).unwrap(), None);
    }

    #[test]
    fn pid_is_cached_for_configured_window() {
        let (r, w) = rig(0);
        r.store.seed("@usagebar_daemon_pid", "100");
        assert_eq!(w.get_daemon_pid(0).unwrap(), Some(100));
        r.store.seed("@usagebar_daemon_pid", "200");
        assert_eq!(w.get_daemon_pid(29_999).unwrap(), Some(100));
        assert_eq!(w.get_daemon_pid(30_000).unwrap(), Some(200));
    }

    #[test]
    fn ensure_running_is_noop_when_healthy() {
        let (r, w) = rig(0);
        r.store.seed("@usagebar_daemon_pid", "4242");
        r.probe.set_alive(4242, true);
        assert!(w.ensure_running(0).unwrap());
        assert_eq!(r.worker.starts.load(Ordering::SeqCst), 0);
        assert_eq!(r.worker.stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_sequence() {
        let (r, w) = rig(0);
        r.store.seed("@usagebar_daemon_pid", "4242");
        r.probe.set_alive(4242, true);
        assert!(w.restart(0).unwrap());
        assert_eq!(r.worker.stops.load(Ordering::SeqCst), 1);
        assert_eq!(r.worker.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(r.worker.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            r.sleeper.delays.lock().unwrap().clone(),
            vec![Duration::from_millis(2_000)]
        );
        // The cache was cleared, so the new pid is seen.
        assert_eq!(w.get_daemon_pid(0).unwrap(), Some(5_000));
    }

    #[test]
    fn ensure_running_retries_with_cooldown() {
        let (r, w) = rig(2);
        assert!(w.ensure_running(0).unwrap());
        assert_eq!(r.worker.starts.load(Ordering::SeqCst), 3);
        let delays = r.sleeper.delays.lock().unwrap().clone();
        // settle, cooldown, settle, cooldown, settle
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(2_000),
                Duration::from_millis(5_000),
                Duration::from_millis(2_000),
                Duration::from_millis(5_000),
                Duration::from_millis(2_000),
            ]
        );
    }

    #[test]
    fn ensure_running_gives_up_after_max_attempts() {
        let (r, w) = rig(10);
        assert!(!w.ensure_running(0).unwrap());
        assert_eq!(r.worker.starts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn health_check_reports_without_acting() {
        let (r, w) = rig(0);
        r.store.seed("@usagebar_daemon_pid", "4242");
        let h = w.perform_health_check(0).unwrap();
        assert_eq!(h.daemon_pid, Some(4242));
        assert!(!h.is_alive);
        assert_eq!(h.issues, vec!["worker pid 4242 is not running".to_string()]);
        assert!(!h.recovery_actions.is_empty());
        assert_eq!(r.worker.starts.load(Ordering::SeqCst), 0);
        assert_eq!(r.store.write_count(), 0);

        r.probe.set_alive(4242, true);
        let h = w.perform_health_check(0).unwrap();
        assert!(h.is_alive);
        assert!(h.issues.is_empty());
    }

    #[test]
    fn health_check_fails_when_store_unreachable() {
        let (r, w) = rig(0);
        r.store.set_unavailable(true);
        assert!(w.perform_health_check(0).is_err());
    }
}
