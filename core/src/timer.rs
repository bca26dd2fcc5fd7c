//! Fixed-cadence background timer.
//!
//! Each timer is one named thread. Ticks run to completion on that thread,
//! so a timer never overlaps with itself. When a tick overruns one or more
//! periods the missed ticks are skipped and counted rather than queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{Error, Result};


pub struct RepeatingTimer {
    name: String,
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    skipped: Arc<AtomicU64>,
    ticks: Arc<AtomicU64>,
}

impl RepeatingTimer {
    /// Start calling `tick` every `interval`, first after one interval.
    pub fn start<F>(name: &str, interval: Duration, mut tick: F) -> Result<RepeatingTimer>
    where
        F: FnMut() + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let skipped = Arc::new(AtomicU64::new(0));
        let ticks = Arc::new(AtomicU64::new(0));
        let (skipped_t, ticks_t) = (skipped.clone(), ticks.clone());
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    tick();
                    ticks_t.fetch_add(1, Ordering::SeqCst);

                    next += interval;
                    let now = Instant::now();
                    if next <= now {
                        let behind = ((now - next).as_nanos() / interval.as_nanos()) as u64 + 1;
                        skipped_t.fetch_add(behind, Ordering::SeqCst);
                        next += interval * behind as u32;
                        warn!(timer = thread_name.as_str(), missed = behind, "tick overran, skipping");
                    }
                }
                debug!(timer = thread_name.as_str(), "timer stopped");
            })
            .map_err(|e| Error::Other(format!("cannot start timer thread {}: {}", name, e)))?;

        Ok(RepeatingTimer {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            skipped,
            ticks,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ticks skipped because an earlier tick overran.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Wake the thread, let any running tick finish, and join it.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(timer = self.name.as_str(), "timer thread panicked");
            }
        }
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.stop();
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_repeatedly_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let mut timer = RepeatingTimer::start("test-tick", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(120));
        timer.stop();
        let n = count.load(Ordering::SeqCst);
        assert!(n >= 3, "only {} ticks", n);
        assert_eq!(timer.ticks(), n);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), n);
    }

    #[test]
    fn stop_wakes_a_long_interval_immediately() {
        let mut timer = RepeatingTimer::start("test-long", Duration::from_secs(3600), || {}).unwrap();
        let started = Instant::now();
        timer.stop();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(timer.ticks(), 0);
    }

    #[test]
    fn overrunning_ticks_are_skipped_not_queued() {
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let mut timer = RepeatingTimer::start("test-slow", Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(35));
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(200));
        timer.stop();
        assert!(timer.skipped() > 0);
        // Far fewer ticks than 200 / 10.
        assert!(count.load(Ordering::SeqCst) < 10);
    }
}
