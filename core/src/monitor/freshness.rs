//! Freshness tracking for the published payload.
//!
//! The store holds the only copy of the stamp (`last_update`, epoch seconds)
//! and the hash of the payload it belongs to. Classification re-reads it on
//! every call since another process may have written it.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::cache::fingerprint::hash_map;
use crate::error::Result;
use crate::format::{format_age, format_epoch_clock};
use crate::infrastructure::keys;
use crate::refresh::publish::{PublishOutcome, Publisher};
use crate::types::config::FreshnessSettings;
use crate::types::health::{Freshness, FreshnessSample};


/// Result of a stamp request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StampOutcome {
    Published(PublishOutcome),
    /// Same payload, stamp still recent.
    Unchanged,
}

pub struct FreshnessTracker {
    publisher: Publisher,
    settings: FreshnessSettings,
    error_color: String,
}

impl FreshnessTracker {
    pub fn new(publisher: Publisher, settings: FreshnessSettings, error_color: &str) -> Self {
        FreshnessTracker {
            publisher,
            settings,
            error_color: error_color.to_string(),
        }
    }

    pub fn settings(&self) -> &FreshnessSettings {
        &self.settings
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    /// Publish `payload` with a new stamp, unless the store already holds the
    /// same payload under a stamp younger than `restamp_after_secs`.
    ///
    /// "Same" means the stored hash matches and every payload key still holds
    /// its value; another writer may have overwritten keys without touching
    /// the hash.
    pub fn stamp(&self, payload: &BTreeMap<String, String>, now_secs: u64) -> Result<StampOutcome> {
        let current = self.publisher.read()?;
        let hash = hash_map(payload);

        let same_payload = current.get(keys::PAYLOAD_HASH) == Some(&hash)
            && payload.iter().all(|(k, v)| current.get(k) == Some(v));
        let stamped_at = current.get(keys::LAST_UPDATE).and_then(|v| v.parse::<u64>().ok());
        if same_payload {
            if let Some(at) = stamped_at {
                if now_secs.saturating_sub(at) < self.settings.restamp_after_secs {
                    debug!(age_secs = now_secs.saturating_sub(at), "payload unchanged, stamp kept");
                    return Ok(StampOutcome::Unchanged);
                }
            }
        }

        let mut full = payload.clone();
        full.insert(keys::LAST_UPDATE.into(), now_secs.to_string());
        full.insert(keys::PAYLOAD_HASH.into(), hash);
        let outcome = self.publisher.publish_against(&current, &full)?;
        Ok(StampOutcome::Published(outcome))
    }

    pub fn classify(&self, now_secs: u64) -> Result<FreshnessSample> {
        let raw = self.publisher.get(keys::LAST_UPDATE)?;
        Ok(self.sample(raw.as_deref(), now_secs))
    }

    fn sample(&self, raw: Option<&str>, now_secs: u64) -> FreshnessSample {
        match raw.and_then(|v| v.trim().parse::<u64>().ok()) {
            None => FreshnessSample {
                last_stamped_at: None,
                age_secs: u64::MAX,
                classification: Freshness::Expired,
            },
            Some(at) => {
                let age = now_secs.saturating_sub(at);
                FreshnessSample {
                    last_stamped_at: Some(at),
                    age_secs: age,
                    classification: Freshness::classify(
                        age,
                        self.settings.fresh_secs,
                        self.settings.stale_secs,
                    ),
                }
            }
        }
    }

    /// Replace expired data with a degraded payload and re-stamp it.
    ///
    /// Returns whether anything was replaced. Does nothing while
    /// `auto_invalidate` is off.
    pub fn invalidate_if_expired(&self, now_secs: u64) -> Result<bool> {
        let current = self.publisher.read()?;
        let sample = self.sample(current.get(keys::LAST_UPDATE).map(String::as_str), now_secs);
        if sample.classification != Freshness::Expired || !self.settings.auto_invalidate {
            return Ok(false);
        }

        // An already degraded payload keeps pointing at the last good data.
        let last_good = match (current.get(keys::STATUS), current.get(keys::LAST_GOOD)) {
            (Some(status), Some(prev)) if status == "expired" => prev.clone(),
            _ => sample
                .last_stamped_at
                .map(format_epoch_clock)
                .unwrap_or_else(|| "never".to_string()),
        };
        let message = match sample.last_stamped_at {
            Some(_) => format!("data expired {} ago", format_age(sample.age_secs)),
            None => "no data published yet".to_string(),
        };

        let mut degraded = BTreeMap::new();
        degraded.insert(keys::STATUS.to_string(), "expired".to_string());
        degraded.insert(keys::MESSAGE.to_string(), message.clone());
        degraded.insert(keys::COLOR.to_string(), self.error_color.clone());
        degraded.insert(keys::LAST_GOOD.to_string(), last_good);
        degraded.insert(keys::LAST_UPDATE.to_string(), now_secs.to_string());
        degraded.insert(keys::PAYLOAD_HASH.to_string(), hash_map(&degraded));

        self.publisher.publish_against(&current, &degraded)?;
        info!(age_secs = sample.age_secs, "{}, published degraded payload", message);
        Ok(true)
    }

    /// Add classification and age fields to a payload. Expired payloads get a
    /// warning marker when auto-invalidation is off.
    pub fn annotate(
        &self,
        payload: &BTreeMap<String, String>,
        sample: &FreshnessSample,
    ) -> BTreeMap<String, String> {
        let mut out = payload.clone();
        out.insert(
            keys::FRESHNESS.to_string(),
            sample.classification.as_str().to_string(),
        );
        let age = match sample.last_stamped_at {
            Some(_) => format_age(sample.age_secs),
            None => "unknown".to_string(),
        };
        if sample.classification == Freshness::Expired && !self.settings.auto_invalidate {
            out.insert(keys::WARNING.to_string(), format!("⚠ data expired {} ago", age));
        }
        out.insert(keys::AGE.to_string(), age);
        out
    }

    /// Write the expiry warning into the store without replacing content.
    pub fn flag_expired(&self, now_secs: u64) -> Result<bool> {
        let sample = self.classify(now_secs)?;
        if sample.classification != Freshness::Expired {
            return Ok(false);
        }
        let marker = self.annotate(&BTreeMap::new(), &sample);
        self.publisher.merge(&marker)?;
        warn!(age_secs = sample.age_secs, "published data expired, warning marker set");
        Ok(true)
    }
}
