//! Single-slot output cache with an adaptive TTL.
//!
//! The engine remembers the last published payload together with the
//! fingerprints it was computed from. The TTL adapts to how often the data
//! actually changes: a high miss ratio shrinks it toward the floor, a low one
//! grows it toward the ceiling, and expensive recomputation biases it upward.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::debug;

use super::fingerprint::Fingerprints;


pub const MIN_TTL_MS: u64 = 5_000;
pub const MAX_TTL_MS: u64 = 120_000;
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Outcomes kept for the hit/miss ratio.
const WINDOW: usize = 10;
/// Outcomes required before the TTL moves at all.
const MIN_SAMPLES: usize = 3;
/// Largest single adjustment.
const MAX_STEP_MS: u64 = 10_000;
const SHRINK_ABOVE_MISS_RATIO: f64 = 0.8;
const GROW_BELOW_MISS_RATIO: f64 = 0.3;
/// Average miss compute time considered expensive.
const SLOW_COMPUTE_MS: u64 = 1_000;


#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprints: Fingerprints,
    pub published: BTreeMap<String, String>,
    pub stored_at_ms: u64,
    /// TTL in force when the entry was stored.
    pub ttl_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    Hit(&'a BTreeMap<String, String>),
    Miss(MissReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissReason {
    Empty,
    ConfigChanged,
    DataChanged,
    Expired,
}

impl MissReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissReason::Empty => "empty",
            MissReason::ConfigChanged => "config_changed",
            MissReason::DataChanged => "data_changed",
            MissReason::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Outcome {
    hit: bool,
    compute_ms: u64,
}


// ---------------------------------------------------------------------------
// AdaptiveTtl
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AdaptiveTtl {
    outcomes: VecDeque<Outcome>,
    ttl_ms: u64,
}

impl Default for AdaptiveTtl {
    fn default() -> Self {
        AdaptiveTtl {
            outcomes: VecDeque::with_capacity(WINDOW),
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl AdaptiveTtl {
    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn miss_ratio(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let misses = self.outcomes.iter().filter(|o| !o.hit).count();
        Some(misses as f64 / self.outcomes.len() as f64)
    }

    /// Mean compute time over the misses in the window.
    pub fn avg_compute_ms(&self) -> u64 {
        let (sum, n) = self
            .outcomes
            .iter()
            .filter(|o| !o.hit)
            .fold((0u64, 0u64), |(s, n), o| (s.saturating_add(o.compute_ms), n + 1));
        if n == 0 {
            0
        } else {
            sum / n
        }
    }

    /// Feed one cycle's outcome and adjust the TTL.
    pub fn record(&mut self, hit: bool, compute_ms: u64) {
        if self.outcomes.len() == WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(Outcome { hit, compute_ms });
        if self.outcomes.len() < MIN_SAMPLES {
            return;
        }

        let miss_ratio = self.miss_ratio().unwrap_or(0.0);
        let slow = self.avg_compute_ms() > SLOW_COMPUTE_MS;
        let step = (self.ttl_ms / 4).clamp(1, MAX_STEP_MS);

        let before = self.ttl_ms;
        if miss_ratio > SHRINK_ABOVE_MISS_RATIO {
            self.ttl_ms = self.ttl_ms.saturating_sub(step);
        } else if miss_ratio < GROW_BELOW_MISS_RATIO {
            let grow = if slow { (step * 2).min(MAX_STEP_MS) } else { step };
            self.ttl_ms = self.ttl_ms.saturating_add(grow);
        } else if slow {
            self.ttl_ms = self.ttl_ms.saturating_add(step / 2);
        }
        self.ttl_ms = self.ttl_ms.clamp(MIN_TTL_MS, MAX_TTL_MS);

        if self.ttl_ms != before {
            debug!(from = before, to = self.ttl_ms, miss_ratio, slow, "adaptive ttl adjusted");
        }
    }
}


// ---------------------------------------------------------------------------
// CacheEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CacheEngine {
    entry: Option<CacheEntry>,
    ttl: AdaptiveTtl,
}

/// Point-in-time view for status output.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CacheSummary {
    pub has_entry: bool,
    pub entry_age_ms: Option<u64>,
    pub ttl_ms: u64,
    pub miss_ratio: Option<f64>,
    pub avg_compute_ms: u64,
}

impl CacheEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hit needs both fingerprints to match and the entry to be younger
    /// than the current TTL.
    pub fn lookup(&self, fingerprints: &Fingerprints, now_ms: u64) -> Lookup<'_> {
        let entry = match &self.entry {
            None => return Lookup::Miss(MissReason::Empty),
            Some(e) => e,
        };
        if entry.fingerprints.config != fingerprints.config {
            return Lookup::Miss(MissReason::ConfigChanged);
        }
        if entry.fingerprints.data != fingerprints.data {
            return Lookup::Miss(MissReason::DataChanged);
        }
        if now_ms.saturating_sub(entry.stored_at_ms) >= self.ttl.ttl_ms() {
            return Lookup::Miss(MissReason::Expired);
        }
        Lookup::Hit(&entry.published)
    }

    /// Replace the entry after a recompute.
    pub fn store(
        &mut self,
        fingerprints: Fingerprints,
        published: BTreeMap<String, String>,
        compute_ms: u64,
        now_ms: u64,
    ) {
        self.entry = Some(CacheEntry {
            fingerprints,
            published,
            stored_at_ms: now_ms,
            ttl_ms: self.ttl.ttl_ms(),
        });
        self.ttl.record(false, compute_ms);
    }

    pub fn record_hit(&mut self) {
        self.ttl.record(true, 0);
    }

    /// Drop the entry and return the TTL state to defaults.
    pub fn clear(&mut self) {
        self.entry = None;
        self.ttl = AdaptiveTtl::default();
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        self.entry.as_ref()
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl.ttl_ms()
    }

    pub fn summary(&self, now_ms: u64) -> CacheSummary {
        CacheSummary {
            has_entry: self.entry.is_some(),
            entry_age_ms: self
                .entry
                .as_ref()
                .map(|e| now_ms.saturating_sub(e.stored_at_ms)),
            ttl_ms: self.ttl.ttl_ms(),
            miss_ratio: self.ttl.miss_ratio(),
            avg_compute_ms: self.ttl.avg_compute_ms(),
        }
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fps(config: &str, data: &str) -> Fingerprints {
        Fingerprints {
            config: config.into(),
            data: data.into(),
        }
    }

    fn payload() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("tokens".to_string(), "130.0k".to_string());
        m
    }

    #[test]
    fn empty_cache_misses() {
        let c = CacheEngine::new();
        assert_eq!(c.lookup(&fps("c", "d"), 0), Lookup::Miss(MissReason::Empty));
    }

    #[test]
    fn hit_within_ttl_then_miss_at_ttl() {
        let mut c = CacheEngine::new();
        c.store(fps("c", "d"), payload(), 10, 1_000);
        assert!(matches!(c.lookup(&fps("c", "d"), 1_000), Lookup::Hit(_)));
        assert!(matches!(c.lookup(&fps("c", "d"), 30_999), Lookup::Hit(_)));
        assert_eq!(
            c.lookup(&fps("c", "d"), 31_000),
            Lookup::Miss(MissReason::Expired)
        );
    }

    #[test]
    fn fingerprint_mismatch_misses() {
        let mut c = CacheEngine::new();
        c.store(fps("c", "d"), payload(), 10, 0);
        assert_eq!(c.lookup(&fps("x", "d"), 1), Lookup::Miss(MissReason::ConfigChanged));
        assert_eq!(c.lookup(&fps("c", "x"), 1), Lookup::Miss(MissReason::DataChanged));
    }

    #[test]
    fn hit_returns_stored_payload() {
        let mut c = CacheEngine::new();
        c.store(fps("c", "d"), payload(), 10, 0);
        match c.lookup(&fps("c", "d"), 5) {
            Lookup::Hit(p) => assert_eq!(p, &payload()),
            other => panic!("expected hit, got {:?}", other),
        }
    }

    #[test]
    fn clear_resets_everything() {
        let mut c = CacheEngine::new();
        for i in 0..10 {
            c.store(fps("c", &i.to_string()), payload(), 10, i);
        }
        assert!(c.ttl_ms() < DEFAULT_TTL_MS);
        c.clear();
        assert!(c.entry().is_none());
        assert_eq!(c.ttl_ms(), DEFAULT_TTL_MS);
        assert_eq!(c.summary(0).miss_ratio, None);
    }

    #[test]
    fn ttl_waits_for_minimum_samples() {
        let mut t = AdaptiveTtl::default();
        t.record(false, 10);
        t.record(false, 10);
        assert_eq!(t.ttl_ms(), DEFAULT_TTL_MS);
        t.record(false, 10);
        assert!(t.ttl_ms() < DEFAULT_TTL_MS);
    }

    #[test]
    fn constant_change_shrinks_to_floor() {
        let mut t = AdaptiveTtl::default();
        for _ in 0..100 {
            t.record(false, 5);
        }
        assert_eq!(t.ttl_ms(), MIN_TTL_MS);
    }

    #[test]
    fn stable_data_grows_to_ceiling() {
        let mut t = AdaptiveTtl::default();
        for _ in 0..200 {
            t.record(true, 0);
        }
        assert_eq!(t.ttl_ms(), MAX_TTL_MS);
    }

    #[test]
    fn steps_are_bounded() {
        let mut t = AdaptiveTtl::default();
        let mut prev = t.ttl_ms();
        for i in 0..300 {
            // Alternate long runs of misses and hits to swing the TTL.
            let hit = (i / 25) % 2 == 0;
            t.record(hit, if hit { 0 } else { 5_000 });
            let now = t.ttl_ms();
            assert!(prev.abs_diff(now) <= MAX_STEP_MS, "{} -> {}", prev, now);
            assert!((MIN_TTL_MS..=MAX_TTL_MS).contains(&now));
            prev = now;
        }
    }

    #[test]
    fn expensive_compute_biases_growth() {
        // Half hits, half misses: neutral ratio, only compute cost decides.
        let mut cheap = AdaptiveTtl::default();
        let mut slow = AdaptiveTtl::default();
        for i in 0..10 {
            cheap.record(i % 2 == 0, if i % 2 == 0 { 0 } else { 50 });
            slow.record(i % 2 == 0, if i % 2 == 0 { 0 } else { 4_000 });
        }
        assert_eq!(cheap.ttl_ms(), DEFAULT_TTL_MS);
        assert!(slow.ttl_ms() > DEFAULT_TTL_MS);
    }

    #[test]
    fn lookup_uses_live_ttl() {
        let mut c = CacheEngine::new();
        c.store(fps("c", "d"), payload(), 10, 0);
        for _ in 0..50 {
            c.record_hit();
        }
        // TTL has grown since the entry was stored.
        assert!(c.ttl_ms() > DEFAULT_TTL_MS);
        assert!(matches!(c.lookup(&fps("c", "d"), 40_000), Lookup::Hit(_)));
    }

    #[test]
    fn summary_reports_age() {
        let mut c = CacheEngine::new();
        c.store(fps("c", "d"), payload(), 1_500, 1_000);
        let s = c.summary(4_000);
        assert!(s.has_entry);
        assert_eq!(s.entry_age_ms, Some(3_000));
        assert_eq!(s.avg_compute_ms, 1_500);
        assert_eq!(s.miss_ratio, Some(1.0));
    }
}
