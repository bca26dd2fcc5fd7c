//! Daemon: the usagebar worker process.
//!
//! The daemon owns the refresh cycle and, when auto-recovery is enabled, a
//! reliability coordinator watching over itself. Both run on their own
//! timers. The main loop only handles events (signals, `DaemonHandle`
//! requests) and keeps the instance lock fresh.
//!
//! # Lifecycle
//!
//! 1. Acquire the instance lock (the only fatal failure)
//! 2. Announce the pid in the store and in `usagebar.pid`
//! 3. Run one refresh cycle, then start the refresh and reliability timers
//! 4. Loop on events until `Shutdown`
//! 5. Stop timers, publish `status=stopped`, withdraw the pid, release the lock

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, TryLockError};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cache::CacheSummary;
use crate::clock::now_ms;
use crate::error::{Error, Result};
use crate::infrastructure::keys;
use crate::infrastructure::process::{LivenessProbe, SignalProbe};
use crate::infrastructure::runner::{CommandRunner, ShellRunner};
use crate::infrastructure::tmux::TmuxStore;
use crate::infrastructure::KeyValueStore;
use crate::lock::InstanceLock;
use crate::monitor::freshness::FreshnessTracker;
use crate::monitor::reliability::{start_monitoring, ReliabilityCoordinator};
use crate::monitor::watchdog::ProcessWatchdog;
use crate::monitor::worker::{ResidentWorker, PID_FILE};
use crate::recovery::{Sleeper, ThreadSleeper};
use crate::refresh::{CommandSource, CycleStats, Publisher, RefreshCycle, UpstreamSource};
use crate::timer::RepeatingTimer;
use crate::types::config::Settings;

pub const CONFIG_FILE: &str = "config.yaml";
pub const STATS_FILE: &str = "stats.json";


/// Events that can be sent to the daemon's main loop via the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    /// Drop the refresh cache and counters; the next cycle recomputes.
    Clear,
    /// Request the daemon to shut down gracefully.
    Shutdown,
}

/// Handle returned from `Daemon::handle()` allowing threads to send events.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    pub fn clear(&self) -> Result<()> {
        self.send(DaemonEvent::Clear)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(DaemonEvent::Shutdown)
    }

    fn send(&self, event: DaemonEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|e| Error::Other(format!("daemon channel send failed: {}", e)))
    }
}

/// Runtime options that do not come from `config.yaml`.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    /// Overrides `refresh.interval_ms`.
    pub interval_ms: Option<u64>,
    /// Install SIGTERM/SIGINT/SIGHUP/SIGUSR1 handlers.
    pub handle_signals: bool,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        DaemonOptions {
            interval_ms: None,
            handle_signals: true,
        }
    }
}

/// Contents of `stats.json`, rewritten after every cycle.
#[derive(Debug, Serialize)]
struct StatsFile<'a> {
    pid: u32,
    updated_at_ms: u64,
    interval_ms: u64,
    stats: &'a CycleStats,
    cache: CacheSummary,
}


pub struct Daemon {
    config_dir: PathBuf,
    settings: Settings,
    interval: Duration,
    handle_signals: bool,
    store: Arc<dyn KeyValueStore>,
    probe: Arc<dyn LivenessProbe>,
    sleeper: Arc<dyn Sleeper>,
    cycle: Arc<Mutex<RefreshCycle>>,
    receiver: mpsc::Receiver<DaemonEvent>,
    handle: DaemonHandle,
}

impl Daemon {
    /// Production wiring: tmux store, shell upstream command, `kill(0)` probe.
    pub fn new(config_dir: &Path, options: DaemonOptions) -> Daemon {
        let settings = load_settings(config_dir);
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        let store = Arc::new(TmuxStore::new(
            runner.clone(),
            Duration::from_millis(settings.refresh.store_timeout_ms),
            Duration::from_millis(settings.refresh.bulk_timeout_ms),
        ));
        let upstream = Arc::new(CommandSource::from_settings(runner, &settings.refresh));
        Self::with_parts(
            config_dir,
            settings,
            options,
            store,
            upstream,
            Arc::new(SignalProbe),
            Arc::new(ThreadSleeper),
        )
    }

    pub fn with_parts(
        config_dir: &Path,
        settings: Settings,
        options: DaemonOptions,
        store: Arc<dyn KeyValueStore>,
        upstream: Arc<dyn UpstreamSource>,
        probe: Arc<dyn LivenessProbe>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Daemon {
        let interval_ms = options
            .interval_ms
            .unwrap_or(settings.refresh.interval_ms)
            .max(1);
        let cycle = RefreshCycle::new(
            store.clone(),
            upstream,
            sleeper.clone(),
            Some(config_dir.join(CONFIG_FILE)),
            settings.clone(),
        );
        let (sender, receiver) = mpsc::channel();
        Daemon {
            config_dir: config_dir.to_path_buf(),
            settings,
            interval: Duration::from_millis(interval_ms),
            handle_signals: options.handle_signals,
            store,
            probe,
            sleeper,
            cycle: Arc::new(Mutex::new(cycle)),
            receiver,
            handle: DaemonHandle { sender },
        }
    }

    /// Get a handle for sending events to this daemon.
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    /// Run until shutdown. Fails only when the instance lock is held.
    pub fn run(&mut self) -> Result<()> {
        let mut lock = InstanceLock::acquire(
            &self.config_dir,
            &self.settings.lock.name,
            Duration::from_secs(self.settings.lock.timeout_secs),
            self.probe.as_ref(),
        )?;
        let pid = std::process::id();
        info!(pid, interval_ms = self.interval.as_millis() as u64, "usagebar worker starting");

        let publisher = self.publisher();
        self.announce(&publisher, pid);
        refresh_and_record(&self.cycle, &self.config_dir, self.interval, &AtomicU64::new(0));

        let mut refresh_timer = self.start_refresh_timer()?;
        let mut monitor_timer = self.start_reliability_timer(&publisher)?;
        let signals = if self.handle_signals {
            Some(SignalListener::start(self.handle.clone())?)
        } else {
            None
        };

        let touch_every = Duration::from_secs((self.settings.lock.timeout_secs / 3).max(1));
        loop {
            match self.receiver.recv_timeout(touch_every) {
                Ok(DaemonEvent::Clear) => {
                    match self.cycle.lock() {
                        Ok(mut c) => c.clear(),
                        Err(_) => error!("refresh cycle poisoned, cannot clear"),
                    }
                    write_stats(&self.cycle, &self.config_dir, self.interval);
                }
                Ok(DaemonEvent::Shutdown) => {
                    info!("shutdown requested");
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = lock.touch() {
                        error!(error = %e, "instance lock lost, shutting down");
                        break;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("daemon channel disconnected, shutting down");
                    break;
                }
            }
        }

        if let Some(listener) = signals {
            listener.stop();
        }
        refresh_timer.stop();
        if let Some(timer) = monitor_timer.as_mut() {
            timer.stop();
        }
        if refresh_timer.skipped() > 0 {
            info!(skipped = refresh_timer.skipped(), "refresh ticks skipped by overruns");
        }
        write_stats(&self.cycle, &self.config_dir, self.interval);
        self.withdraw(&publisher, pid);
        lock.release();
        info!(pid, "usagebar worker stopped");
        Ok(())
    }

    fn publisher(&self) -> Publisher {
        match self.cycle.lock() {
            Ok(c) => c.publisher(),
            Err(poisoned) => poisoned.into_inner().publisher(),
        }
    }

    fn announce(&self, publisher: &Publisher, pid: u32) {
        let key = publisher.namespace().key(keys::DAEMON_PID);
        if let Err(e) = self.store.set(&key, &pid.to_string()) {
            warn!(error = %e, "could not publish worker pid");
        }
        if let Err(e) = std::fs::write(self.config_dir.join(PID_FILE), pid.to_string()) {
            warn!(error = %e, "could not write pid file");
        }
    }

    /// Best effort: the store may already be gone with the tmux server.
    fn withdraw(&self, publisher: &Publisher, pid: u32) {
        if let Err(e) = publisher.mark_stopped(&self.settings.colors.inactive) {
            debug!(error = %e, "could not publish stopped status");
        }

        let own = publisher
            .get(keys::DAEMON_PID)
            .ok()
            .flatten()
            .map(|v| v.trim() == pid.to_string())
            .unwrap_or(false);
        if own {
            if let Err(e) = self.store.unset(&publisher.namespace().key(keys::DAEMON_PID)) {
                debug!(error = %e, "could not remove worker pid");
            }
        }
        match std::fs::remove_file(self.config_dir.join(PID_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "could not remove pid file"),
        }
    }

    fn start_refresh_timer(&self) -> Result<RepeatingTimer> {
        let cycle = self.cycle.clone();
        let dir = self.config_dir.clone();
        let interval = self.interval;
        let busy = AtomicU64::new(0);
        RepeatingTimer::start("usagebar-refresh", interval, move || {
            refresh_and_record(&cycle, &dir, interval, &busy);
        })
    }

    fn start_reliability_timer(&self, publisher: &Publisher) -> Result<Option<RepeatingTimer>> {
        let reliability = &self.settings.reliability;
        if !reliability.auto_recovery {
            debug!("auto-recovery disabled, no reliability timer");
            return Ok(None);
        }
        let watchdog = ProcessWatchdog::new(
            publisher.clone(),
            self.probe.clone(),
            Arc::new(ResidentWorker::new(publisher.clone())),
            self.sleeper.clone(),
            self.settings.watchdog.clone(),
        );
        let freshness = FreshnessTracker::new(
            publisher.clone(),
            self.settings.freshness.clone(),
            &self.settings.colors.error,
        );
        let coordinator =
            ReliabilityCoordinator::new(watchdog, freshness, self.sleeper.clone(), reliability.clone());
        let timer = start_monitoring(
            Arc::new(Mutex::new(coordinator)),
            Duration::from_millis(reliability.monitor_interval_ms.max(1)),
        )?;
        Ok(Some(timer))
    }
}


/// Read `config.yaml`, falling back to defaults when it is broken.
pub fn load_settings(config_dir: &Path) -> Settings {
    match Settings::load(&config_dir.join(CONFIG_FILE)) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "invalid configuration, using defaults");
            Settings::default()
        }
    }
}

/// One refresh tick from a timer. A tick that finds the cycle busy is
/// skipped and counted on the next tick that gets through.
fn refresh_and_record(
    cycle: &Mutex<RefreshCycle>,
    config_dir: &Path,
    interval: Duration,
    busy: &AtomicU64,
) {
    match cycle.try_lock() {
        Ok(mut c) => {
            let skipped = busy.swap(0, Ordering::SeqCst);
            if skipped > 0 {
                c.record_skipped(skipped);
            }
            c.tick(now_ms());
        }
        Err(TryLockError::WouldBlock) => {
            busy.fetch_add(1, Ordering::SeqCst);
            debug!("refresh cycle still running, tick skipped");
            return;
        }
        Err(TryLockError::Poisoned(_)) => {
            error!("refresh cycle poisoned, tick skipped");
            return;
        }
    }
    write_stats(cycle, config_dir, interval);
}

fn write_stats(cycle: &Mutex<RefreshCycle>, config_dir: &Path, interval: Duration) {
    let (stats, cache) = match cycle.lock() {
        Ok(c) => (c.stats(), c.cache_summary(now_ms())),
        Err(_) => return,
    };
    let file = StatsFile {
        pid: std::process::id(),
        updated_at_ms: now_ms(),
        interval_ms: interval.as_millis() as u64,
        stats: &stats,
        cache,
    };
    let result = serde_json::to_string_pretty(&file)
        .map_err(Error::from)
        .and_then(|json| {
            let tmp = config_dir.join(format!("{}.tmp", STATS_FILE));
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, config_dir.join(STATS_FILE))?;
            Ok(())
        });
    if let Err(e) = result {
        debug!(error = %e, "could not write stats file");
    }
}


// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Turns process signals into daemon events on a listener thread.
struct SignalListener {
    handle: signal_hook::iterator::Handle,
    thread: JoinHandle<()>,
}

impl SignalListener {
    fn start(daemon: DaemonHandle) -> Result<SignalListener> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};

        let mut signals = signal_hook::iterator::Signals::new([SIGTERM, SIGINT, SIGHUP, SIGUSR1])
            .map_err(|e| Error::Other(format!("failed to register signal listeners: {}", e)))?;
        let handle = signals.handle();
        let thread = std::thread::Builder::new()
            .name("usagebar-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    let event = if signal == SIGUSR1 {
                        DaemonEvent::Clear
                    } else {
                        DaemonEvent::Shutdown
                    };
                    info!(signal, event = ?event, "signal received");
                    if daemon.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| Error::Other(format!("failed to start signal listener: {}", e)))?;
        Ok(SignalListener { handle, thread })
    }

    fn stop(self) {
        self.handle.close();
        if self.thread.join().is_err() {
            warn!("signal listener thread panicked");
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockStore;
    use crate::lock::{lock_path, LockInfo};
    use crate::recovery::retry::tests::RecordingSleeper;
    use crate::types::snapshot::UsageSnapshot;

    struct ActiveSource;

    impl UpstreamSource for ActiveSource {
        fn fetch(&self) -> Result<UsageSnapshot> {
            UsageSnapshot::parse(r#"{"isActive":true,"totalTokens":42000,"costUSD":3.1}"#)
        }
    }

    struct Probe(bool);

    impl LivenessProbe for Probe {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }
    }

    fn daemon(dir: &Path, store: Arc<MockStore>, alive: bool) -> Daemon {
        let mut settings = Settings::default();
        settings.reliability.auto_recovery = false;
        Daemon::with_parts(
            dir,
            settings,
            DaemonOptions {
                interval_ms: Some(3_600_000),
                handle_signals: false,
            },
            store,
            Arc::new(ActiveSource),
            Arc::new(Probe(alive)),
            Arc::new(RecordingSleeper::default()),
        )
    }

    fn read_stats(dir: &Path) -> serde_json::Value {
        let raw = std::fs::read_to_string(dir.join(STATS_FILE)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn quick_restart_republishes_active_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let mut first = daemon(dir.path(), store.clone(), true);
        first.handle().shutdown().unwrap();
        first.run().unwrap();
        let before = store.bulk_writes().len();

        let mut second = daemon(dir.path(), store.clone(), true);
        second.handle().shutdown().unwrap();
        second.run().unwrap();

        let writes = store.bulk_writes();
        assert!(writes[before..]
            .iter()
            .any(|w| w.get("@usagebar_status").map(String::as_str) == Some("active")));
    }

    #[test]
    fn run_publishes_then_withdraws_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let mut d = daemon(dir.path(), store.clone(), true);
        let handle = d.handle();
        handle.shutdown().unwrap();
        d.run().unwrap();

        let snap = store.snapshot();
        assert_eq!(snap["@usagebar_status"], "stopped");
        assert_eq!(snap["@usagebar_payload_hash"], "");
        assert_eq!(snap["@usagebar_tokens"], "42.0k");
        assert!(!snap.contains_key("@usagebar_daemon_pid"));
        assert!(!lock_path(dir.path(), "usagebar").exists());
        assert!(!dir.path().join(PID_FILE).exists());

        let stats = read_stats(dir.path());
        assert_eq!(stats["stats"]["cycles"], 1);
        assert_eq!(stats["stats"]["misses"], 1);
    }

    #[test]
    fn pid_is_announced_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let mut d = daemon(dir.path(), store.clone(), true);
        let handle = d.handle();
        let worker = std::thread::spawn(move || d.run());

        let key = "@usagebar_daemon_pid";
        let mut announced = None;
        for _ in 0..200 {
            if let Some(v) = store.snapshot().get(key) {
                announced = Some(v.clone());
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(announced, Some(std::process::id().to_string()));
        assert!(dir.path().join(PID_FILE).exists());

        handle.shutdown().unwrap();
        worker.join().unwrap().unwrap();
        assert!(!store.snapshot().contains_key(key));
    }

    #[test]
    fn clear_resets_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MockStore::new());
        let mut d = daemon(dir.path(), store, true);
        let handle = d.handle();
        handle.clear().unwrap();
        handle.shutdown().unwrap();
        d.run().unwrap();

        let stats = read_stats(dir.path());
        assert_eq!(stats["stats"]["cycles"], 0);
        assert_eq!(stats["cache"]["has_entry"], false);
    }

    #[test]
    fn held_lock_aborts_before_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let info = LockInfo {
            pid: 4_000_001,
            timestamp: crate::clock::now_secs(),
            hostname: "h".into(),
        };
        std::fs::write(
            lock_path(dir.path(), "usagebar"),
            serde_json::to_string(&info).unwrap(),
        )
        .unwrap();

        let store = Arc::new(MockStore::new());
        let mut d = daemon(dir.path(), store.clone(), true);
        let err = d.run().unwrap_err();
        assert!(matches!(err, Error::LockHeld { pid: 4_000_001, .. }));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn broken_config_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "thresholds: [").unwrap();
        assert_eq!(load_settings(dir.path()), Settings::default());
    }
}
