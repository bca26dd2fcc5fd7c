//! Reliability coordinator: fuses worker liveness and data freshness into a
//! verdict and drives automatic recovery.
//!
//! # Monitoring tick
//!
//! 1. Generate a report (health check and freshness read run concurrently)
//! 2. High/Medium: reset the failure counter
//! 3. Low/Critical: count the failure, run auto-recovery if enabled
//! 4. Escalate to a fatal log entry once failures reach the alert threshold

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::clock::now_ms;
use crate::error::Result;
use crate::format::format_age;
use crate::recovery::retry::Sleeper;
use crate::timer::RepeatingTimer;
use crate::types::config::ReliabilitySettings;
use crate::types::health::{
    DaemonHealth, Freshness, FreshnessSample, RecoveryOutcome, ReliabilityReport,
    ReliabilityVerdict,
};

use super::freshness::FreshnessTracker;
use super::watchdog::ProcessWatchdog;


pub struct ReliabilityCoordinator {
    watchdog: ProcessWatchdog,
    freshness: FreshnessTracker,
    sleeper: Arc<dyn Sleeper>,
    settings: ReliabilitySettings,
    consecutive_failures: u32,
}

impl ReliabilityCoordinator {
    pub fn new(
        watchdog: ProcessWatchdog,
        freshness: FreshnessTracker,
        sleeper: Arc<dyn Sleeper>,
        settings: ReliabilitySettings,
    ) -> Self {
        ReliabilityCoordinator {
            watchdog,
            freshness,
            sleeper,
            settings,
            consecutive_failures: 0,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn watchdog(&self) -> &ProcessWatchdog {
        &self.watchdog
    }

    pub fn freshness(&self) -> &FreshnessTracker {
        &self.freshness
    }

    /// Build a report. Never fails: an unreachable store or a panicking
    /// probe yields a Critical report describing the failure.
    pub fn generate_report(&self, now_ms: u64) -> ReliabilityReport {
        let (health, freshness) = std::thread::scope(|s| {
            let h = s.spawn(|| self.watchdog.perform_health_check(now_ms));
            let f = s.spawn(|| self.freshness.classify(now_ms / 1000));
            (flatten(h.join()), flatten(f.join()))
        });

        match (health, freshness) {
            (Ok(health), Ok(sample)) => {
                let verdict = ReliabilityVerdict::from_signals(health.is_alive, sample.classification);
                build_report(verdict, health, Some(sample), Vec::new(), now_ms)
            }
            (health, sample) => {
                let mut failures = Vec::new();
                let health = health.unwrap_or_else(|e| {
                    failures.push(format!("worker health check failed: {}", e));
                    DaemonHealth::default()
                });
                let sample = match sample {
                    Ok(s) => Some(s),
                    Err(e) => {
                        failures.push(format!("freshness check failed: {}", e));
                        None
                    }
                };
                warn!(failures = ?failures, "reliability report degraded to critical");
                build_report(ReliabilityVerdict::Critical, health, sample, failures, now_ms)
            }
        }
    }

    /// One recovery pass: invalidate expired data, make sure the worker runs,
    /// settle, and re-check. Does nothing when the verdict is already
    /// acceptable.
    pub fn perform_auto_recovery(&mut self, now_ms: u64) -> RecoveryOutcome {
        let before = self.generate_report(now_ms);
        self.recover_from(&before, now_ms)
    }

    fn recover_from(&mut self, before: &ReliabilityReport, now_ms: u64) -> RecoveryOutcome {
        if before.verdict.is_acceptable() {
            self.consecutive_failures = 0;
            return RecoveryOutcome {
                success: true,
                actions_performed: Vec::new(),
            };
        }

        let mut actions = Vec::new();
        let expired = before
            .freshness
            .as_ref()
            .map(|f| f.classification == Freshness::Expired)
            .unwrap_or(true);

        if expired {
            let now_secs = now_ms / 1000;
            if self.freshness.settings().auto_invalidate {
                match self.freshness.invalidate_if_expired(now_secs) {
                    Ok(true) => actions.push("invalidated expired data".to_string()),
                    Ok(false) => {}
                    Err(e) => actions.push(format!("invalidating expired data failed: {}", e)),
                }
            } else {
                match self.freshness.flag_expired(now_secs) {
                    Ok(true) => actions.push("flagged expired data".to_string()),
                    Ok(false) => {}
                    Err(e) => actions.push(format!("flagging expired data failed: {}", e)),
                }
            }
        }

        let was_alive = before.daemon_health.is_alive;
        match self.watchdog.ensure_running(now_ms) {
            Ok(true) if !was_alive => actions.push("restarted worker".to_string()),
            Ok(true) => {}
            Ok(false) => actions.push("worker restart failed".to_string()),
            Err(e) => actions.push(format!("worker restart failed: {}", e)),
        }

        self.sleeper
            .sleep(Duration::from_millis(self.settings.recovery_settle_ms));
        self.watchdog.clear_pid_cache();
        let after = self.generate_report(now_ms.saturating_add(self.settings.recovery_settle_ms));
        let success = after.verdict.is_acceptable();
        if success {
            self.consecutive_failures = 0;
        }
        info!(
            success,
            before = ?before.verdict,
            after = ?after.verdict,
            actions = ?actions,
            "auto-recovery finished"
        );
        RecoveryOutcome {
            success,
            actions_performed: actions,
        }
    }

    /// One monitoring pass. Returns the report that triggered any action.
    pub fn monitor_tick(&mut self, now_ms: u64) -> ReliabilityReport {
        let report = self.generate_report(now_ms);
        if report.verdict.is_acceptable() {
            if self.consecutive_failures > 0 {
                info!(verdict = ?report.verdict, "reliability restored");
            }
            self.consecutive_failures = 0;
            return report;
        }

        self.consecutive_failures += 1;
        warn!(
            verdict = ?report.verdict,
            consecutive_failures = self.consecutive_failures,
            issues = ?report.critical_issues,
            "reliability degraded"
        );

        let recovered = self.settings.auto_recovery && self.recover_from(&report, now_ms).success;
        if !recovered && self.consecutive_failures >= self.settings.critical_alert_threshold {
            error!(
                severity = "fatal",
                consecutive_failures = self.consecutive_failures,
                verdict = ?report.verdict,
                "reliability has not recovered; manual intervention required"
            );
        }
        report
    }
}

/// Run `monitor_tick` every `interval` on a background timer.
pub fn start_monitoring(
    coordinator: Arc<Mutex<ReliabilityCoordinator>>,
    interval: Duration,
) -> Result<RepeatingTimer> {
    RepeatingTimer::start("usagebar-reliability", interval, move || {
        match coordinator.lock() {
            Ok(mut c) => {
                c.monitor_tick(now_ms());
            }
            Err(_) => error!("reliability coordinator poisoned, skipping tick"),
        }
    })
}

fn flatten<T>(joined: std::thread::Result<Result<T>>) -> std::result::Result<T, String> {
    match joined {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("probe thread panicked".to_string()),
    }
}

fn build_report(
    verdict: ReliabilityVerdict,
    daemon_health: DaemonHealth,
    freshness: Option<FreshnessSample>,
    failures: Vec<String>,
    now_ms: u64,
) -> ReliabilityReport {
    let expired = freshness
        .as_ref()
        .map(|f| f.classification == Freshness::Expired)
        .unwrap_or(false);

    let mut critical_issues = failures;
    if !matches!(verdict, ReliabilityVerdict::High | ReliabilityVerdict::Medium) {
        critical_issues.extend(daemon_health.issues.iter().cloned());
        if expired {
            critical_issues.push(match freshness.as_ref().and_then(|f| f.last_stamped_at) {
                Some(_) => format!(
                    "published data expired {} ago",
                    format_age(freshness.as_ref().map(|f| f.age_secs).unwrap_or(0))
                ),
                None => "no data has ever been published".to_string(),
            });
        }
    }

    let recommendations = match verdict {
        ReliabilityVerdict::Critical => vec![
            "restart the worker now: usagebar heal".to_string(),
            "inspect daemon.log in the config directory for the cause".to_string(),
            "check that tmux is running and the usage command works: usagebar once".to_string(),
        ],
        ReliabilityVerdict::Low => {
            let mut r = Vec::new();
            if !daemon_health.is_alive {
                r.push("restart the worker: usagebar heal".to_string());
            }
            if expired {
                r.push("re-validate published data: usagebar once".to_string());
            }
            r
        }
        ReliabilityVerdict::Medium => vec![format!(
            "data is stale ({} old) but the worker is alive; it should catch up",
            format_age(freshness.as_ref().map(|f| f.age_secs).unwrap_or(0))
        )],
        ReliabilityVerdict::High => Vec::new(),
    };

    ReliabilityReport {
        verdict,
        daemon_health,
        freshness,
        recommendations,
        critical_issues,
        generated_at_ms: now_ms,
    }
}
