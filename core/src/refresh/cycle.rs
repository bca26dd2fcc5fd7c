//! Refresh cycle: the orchestration that runs on every timer tick.
//!
//! `RefreshCycle::tick` performs one strictly sequential pass:
//! 1. Reload configuration (falls back to defaults when invalid)
//! 2. Fetch a usage snapshot (falls back to an inactive snapshot)
//! 3. Fingerprint config and data, consult the single-slot cache
//! 4. Hit: replay the cached payload through the freshness stamp
//! 5. Miss: render, publish and stamp, then refresh the cache entry
//!
//! A tick never returns an error. Failures that survive the retry layer are
//! counted and turned into a best-effort `status=error` publish.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::{CacheEngine, CacheSummary, FingerprintHasher, Lookup, MissReason};
use crate::error::{Error, Result};
use crate::format::render;
use crate::infrastructure::{keys, KeyValueStore, Namespace};
use crate::monitor::freshness::{FreshnessTracker, StampOutcome};
use crate::recovery::{ErrorKind, ErrorRecord, RetryExecutor, RetryPolicy, Sleeper};
use crate::types::config::Settings;
use crate::types::snapshot::UsageSnapshot;

use super::publish::Publisher;
use super::upstream::UpstreamSource;


// ---------------------------------------------------------------------------
// Outcome and statistics
// ---------------------------------------------------------------------------

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Cache hit; `written` is whether the replay touched the store.
    Reused { written: bool },
    /// Cache miss; the payload was recomputed.
    Published { reason: MissReason, written: bool },
    Failed { kind: ErrorKind },
}

/// Counters for the life of the cycle (or since the last clear).
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStats {
    pub cycles: u64,
    pub hits: u64,
    pub misses: u64,
    /// Ticks whose publish changed the store.
    pub writes: u64,
    pub recoveries: u64,
    pub failures: u64,
    /// Timer ticks dropped because a cycle was still running.
    pub skipped: u64,
    pub last_duration_ms: u64,
    pub last_error: Option<String>,
    pub ttl_ms: u64,
    pub errors: Vec<ErrorRecord>,
}


// ---------------------------------------------------------------------------
// RefreshCycle
// ---------------------------------------------------------------------------

pub struct RefreshCycle {
    store: Arc<dyn KeyValueStore>,
    upstream: Arc<dyn UpstreamSource>,
    config_path: Option<PathBuf>,
    settings: Settings,
    cache: CacheEngine,
    hasher: FingerprintHasher,
    retry: RetryExecutor,
    stats: CycleStats,
}

impl RefreshCycle {
    /// `config_path` is re-read on every tick; `None` pins `settings`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        upstream: Arc<dyn UpstreamSource>,
        sleeper: Arc<dyn Sleeper>,
        config_path: Option<PathBuf>,
        settings: Settings,
    ) -> Self {
        RefreshCycle {
            store,
            upstream,
            config_path,
            settings,
            cache: CacheEngine::new(),
            hasher: FingerprintHasher::default(),
            retry: RetryExecutor::new(sleeper),
            stats: CycleStats::default(),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.store.clone(),
            Namespace::new(&self.settings.store.prefix),
        )
    }

    pub fn cache_summary(&self, now_ms: u64) -> CacheSummary {
        self.cache.summary(now_ms)
    }

    pub fn stats(&self) -> CycleStats {
        let mut stats = self.stats.clone();
        stats.recoveries = self.retry.ledger().recoveries();
        stats.ttl_ms = self.cache.ttl_ms();
        stats.errors = self.retry.ledger().records().cloned().collect();
        stats
    }

    pub fn record_skipped(&mut self, ticks: u64) {
        self.stats.skipped += ticks;
    }

    /// Drop the cache entry, the hasher anchor and every counter. The next
    /// tick recomputes.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.hasher.reset();
        self.retry.ledger_mut().clear();
        self.stats = CycleStats::default();
        info!("refresh cache and counters cleared");
    }

    pub fn tick(&mut self, now_ms: u64) -> CycleOutcome {
        let started = Instant::now();
        self.stats.cycles += 1;

        let outcome = match self.run(now_ms) {
            Ok(outcome) => {
                self.stats.last_error = None;
                outcome
            }
            Err(e) => self.fail(e),
        };

        self.stats.last_duration_ms = started.elapsed().as_millis() as u64;
        debug!(
            outcome = ?outcome,
            duration_ms = self.stats.last_duration_ms,
            ttl_ms = self.cache.ttl_ms(),
            "refresh cycle finished"
        );
        outcome
    }

    fn run(&mut self, now_ms: u64) -> Result<CycleOutcome> {
        self.reload_settings();
        let policy = RetryPolicy::from_settings(&self.settings.refresh);

        let upstream = self.upstream.clone();
        let snapshot = self
            .retry
            .with_retry("fetch usage", &policy, || upstream.fetch(), UsageSnapshot::unavailable)?
            .value;

        let compute_started = Instant::now();
        let fingerprints = self.hasher.fingerprints(&self.settings, &snapshot);
        let cached = match self.cache.lookup(&fingerprints, now_ms) {
            Lookup::Hit(published) => Ok(published.clone()),
            Lookup::Miss(reason) => Err(reason),
        };

        match cached {
            Ok(published) => {
                let written = self.stamp(&policy, &published, now_ms)?;
                self.cache.record_hit();
                self.stats.hits += 1;
                Ok(CycleOutcome::Reused { written })
            }
            Err(reason) => {
                debug!(reason = reason.as_str(), "cache miss, recomputing");
                let payload = render(&snapshot, &self.settings);
                let written = self.stamp(&policy, &payload, now_ms)?;
                let compute_ms = compute_started.elapsed().as_millis() as u64;
                self.cache.store(fingerprints, payload, compute_ms, now_ms);
                self.stats.misses += 1;
                Ok(CycleOutcome::Published { reason, written })
            }
        }
    }

    fn reload_settings(&mut self) {
        let path = match &self.config_path {
            Some(p) => p.clone(),
            None => return,
        };
        // A broken file does not fix itself within a backoff.
        let policy = RetryPolicy::from_settings(&self.settings.refresh).with_attempts(1);
        match self
            .retry
            .with_retry("load config", &policy, || Settings::load(&path), Settings::default)
        {
            Ok(loaded) => {
                if loaded.value != self.settings {
                    info!(path = %path.display(), "configuration changed");
                }
                self.settings = loaded.value;
            }
            Err(e) => warn!(error = %e, "keeping previous configuration"),
        }
    }

    /// Publish through the freshness stamp; returns whether the store changed.
    fn stamp(
        &mut self,
        policy: &RetryPolicy,
        payload: &BTreeMap<String, String>,
        now_ms: u64,
    ) -> Result<bool> {
        let tracker = FreshnessTracker::new(
            self.publisher(),
            self.settings.freshness.clone(),
            &self.settings.colors.error,
        );
        let stamped = self.retry.with_retry(
            "publish",
            policy,
            || tracker.stamp(payload, now_ms / 1000),
            || StampOutcome::Unchanged,
        )?;
        let written = match stamped.value {
            StampOutcome::Published(outcome) => {
                if !outcome.failed.is_empty() {
                    warn!(keys = ?outcome.failed, "some keys could not be published");
                }
                !outcome.is_noop()
            }
            StampOutcome::Unchanged => false,
        };
        if written {
            self.stats.writes += 1;
        }
        Ok(written)
    }

    /// The executor already recorded the failure in the ledger.
    fn fail(&mut self, err: Error) -> CycleOutcome {
        let kind = ErrorKind::classify(&err);
        self.stats.failures += 1;
        self.stats.last_error = Some(err.to_string());

        let mut degraded = BTreeMap::new();
        degraded.insert(keys::STATUS.to_string(), "error".to_string());
        degraded.insert(keys::MESSAGE.to_string(), kind.guidance().to_string());
        degraded.insert(keys::COLOR.to_string(), self.settings.colors.error.clone());
        // Forces the next stamp to rewrite the payload.
        degraded.insert(keys::PAYLOAD_HASH.to_string(), String::new());
        if let Err(e) = self.publisher().merge(&degraded) {
            debug!(error = %e, "could not publish error status");
        }
        CycleOutcome::Failed { kind }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
