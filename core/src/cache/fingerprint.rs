//! Fingerprints deciding whether a refresh cycle must recompute.
//!
//! The configuration fingerprint is exact. The snapshot fingerprint is
//! tolerant: each token counter is anchored, and an anchor only moves once
//! its counter has drifted at least `threshold` away from it, so monitoring
//! noise below the threshold keeps the fingerprint stable while accumulated
//! drift still produces a new one.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::types::config::Settings;
use crate::types::snapshot::UsageSnapshot;


/// Token drift (absolute) tolerated before the data fingerprint changes.
pub const DEFAULT_TOKEN_TOLERANCE: u64 = 100;

/// The pair of fingerprints the cache compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprints {
    pub config: String,
    pub data: String,
}

/// Hex sha256 of the canonical JSON of the output-affecting settings.
pub fn config_fingerprint(settings: &Settings) -> String {
    // Struct fields serialize in declaration order, so this is canonical.
    let bytes = serde_json::to_vec(&settings.output()).unwrap_or_default();
    digest(&bytes)
}

/// Hex sha256 of a sorted map, so incidental field order never matters.
pub fn hash_map(values: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in values {
        hasher.update(k.as_bytes());
        hasher.update([0u8]);
        hasher.update(v.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}


// ---------------------------------------------------------------------------
// FingerprintHasher
// ---------------------------------------------------------------------------

/// Last value reported for one counter.
#[derive(Debug, Clone, Copy, Default)]
struct Anchor(Option<u64>);

impl Anchor {
    fn settle(&mut self, value: u64, threshold: u64) -> u64 {
        match self.0 {
            Some(a) if a.abs_diff(value) < threshold => a,
            _ => {
                self.0 = Some(value);
                value
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    threshold: u64,
    total: Anchor,
    input: Anchor,
    output: Anchor,
}

impl FingerprintHasher {
    pub fn new(threshold: u64) -> Self {
        FingerprintHasher {
            threshold: threshold.max(1),
            total: Anchor::default(),
            input: Anchor::default(),
            output: Anchor::default(),
        }
    }

    pub fn fingerprints(&mut self, settings: &Settings, snapshot: &UsageSnapshot) -> Fingerprints {
        Fingerprints {
            config: config_fingerprint(settings),
            data: self.tolerant_hash(snapshot),
        }
    }

    /// Fingerprint a snapshot, ignoring token drift below the threshold.
    ///
    /// Other numeric fields are reduced to the precision they are displayed
    /// with: cost to cents, durations to minutes, rates to whole units.
    pub fn tolerant_hash(&mut self, snapshot: &UsageSnapshot) -> String {
        let tokens = self.total.settle(snapshot.total_tokens, self.threshold);

        let mut canon: BTreeMap<String, String> = BTreeMap::new();
        canon.insert("active".into(), snapshot.is_active.to_string());
        canon.insert("tokens".into(), tokens.to_string());
        canon.insert("cost_cents".into(), cents(snapshot.cost_usd).to_string());
        if let Some(m) = snapshot.remaining_minutes() {
            canon.insert("remaining_min".into(), whole(m).to_string());
        }
        if let Some(r) = snapshot.tokens_per_minute() {
            canon.insert("rate".into(), whole(r).to_string());
        }
        if let Some(s) = &snapshot.start_time {
            canon.insert("start".into(), s.clone());
        }
        if let Some(e) = &snapshot.end_time {
            canon.insert("end".into(), e.clone());
        }
        if let Some(c) = &snapshot.token_counts {
            let input = self.input.settle(c.input_tokens, self.threshold);
            let output = self.output.settle(c.output_tokens, self.threshold);
            canon.insert("input".into(), input.to_string());
            canon.insert("output".into(), output.to_string());
        }
        if let Some(l) = &snapshot.token_limit_status {
            canon.insert("limit".into(), l.limit.to_string());
        }
        hash_map(&canon)
    }

    /// Forget the anchors; the next snapshot becomes the new reference.
    pub fn reset(&mut self) {
        self.total = Anchor::default();
        self.input = Anchor::default();
        self.output = Anchor::default();
    }
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        FingerprintHasher::new(DEFAULT_TOKEN_TOLERANCE)
    }
}

fn cents(usd: f64) -> i64 {
    if usd.is_finite() {
        (usd * 100.0).round() as i64
    } else {
        0
    }
}

fn whole(v: f64) -> i64 {
    if v.is_finite() {
        v.round() as i64
    } else {
        0
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
