//! Differential writer for the published namespace.
//!
//! Every publish reads the namespace once, writes only the keys whose values
//! differ in a single bulk call, and removes payload keys that are no longer
//! part of the payload. Reserved keys owned by the worker process are never
//! removed. Nothing is written when the store already holds the payload.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::infrastructure::{keys, KeyValueStore, Namespace, RESERVED_KEYS};


#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Keys set in the bulk write.
    pub written: usize,
    /// Stale keys unset.
    pub removed: usize,
    /// Keys that could not be written even individually.
    pub failed: Vec<String>,
}

impl PublishOutcome {
    pub fn is_noop(&self) -> bool {
        self.written == 0 && self.removed == 0
    }
}

#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn KeyValueStore>,
    namespace: Namespace,
}

impl Publisher {
    pub fn new(store: Arc<dyn KeyValueStore>, namespace: Namespace) -> Self {
        Publisher { store, namespace }
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// Current namespace contents by short name.
    pub fn read(&self) -> Result<BTreeMap<String, String>> {
        self.namespace.read_all(self.store.as_ref())
    }

    pub fn get(&self, short: &str) -> Result<Option<String>> {
        self.store.get(&self.namespace.key(short))
    }

    /// Replace the published payload with `desired`.
    pub fn publish(&self, desired: &BTreeMap<String, String>) -> Result<PublishOutcome> {
        let current = self.read()?;
        self.publish_against(&current, desired)
    }

    /// Replace the payload given an already-read `current` view.
    pub fn publish_against(
        &self,
        current: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<PublishOutcome> {
        let mut outcome = self.write_changed(current, desired)?;

        for key in current.keys() {
            if desired.contains_key(key) || RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            match self.store.unset(&self.namespace.key(key)) {
                Ok(()) => outcome.removed += 1,
                Err(e) => {
                    warn!(key = key.as_str(), error = %e, "failed to remove stale key");
                    outcome.failed.push(key.clone());
                }
            }
        }

        if outcome.is_noop() {
            debug!("store already current, nothing published");
        } else {
            debug!(written = outcome.written, removed = outcome.removed, "published");
        }
        Ok(outcome)
    }

    /// Set the given keys where they differ, leaving everything else alone.
    pub fn merge(&self, values: &BTreeMap<String, String>) -> Result<PublishOutcome> {
        let current = self.read()?;
        self.write_changed(&current, values)
    }

    /// Publish the terminal "stopped" status. The payload hash is cleared so
    /// the next worker's first stamp always rewrites the display.
    pub fn mark_stopped(&self, color: &str) -> Result<PublishOutcome> {
        let mut stopped = BTreeMap::new();
        stopped.insert(keys::STATUS.to_string(), "stopped".to_string());
        stopped.insert(keys::MESSAGE.to_string(), "usagebar worker stopped".to_string());
        stopped.insert(keys::COLOR.to_string(), color.to_string());
        stopped.insert(keys::PAYLOAD_HASH.to_string(), String::new());
        self.merge(&stopped)
    }

    /// Unset every key in the namespace, keeping reserved keys if asked.
    pub fn clear(&self, keep_reserved: bool) -> Result<usize> {
        let current = self.read()?;
        let mut removed = 0;
        for key in current.keys() {
            if keep_reserved && RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.store.unset(&self.namespace.key(key))?;
            removed += 1;
        }
        Ok(removed)
    }

    fn write_changed(
        &self,
        current: &BTreeMap<String, String>,
        desired: &BTreeMap<String, String>,
    ) -> Result<PublishOutcome> {
        let changed: BTreeMap<String, String> = desired
            .iter()
            .filter(|(k, v)| current.get(*k) != Some(*v))
            .map(|(k, v)| (self.namespace.key(k), v.clone()))
            .collect();

        let mut outcome = PublishOutcome::default();
        if changed.is_empty() {
            return Ok(outcome);
        }
        let bulk = self.store.bulk_set(&changed)?;
        outcome.written = bulk.written;
        outcome.failed = bulk
            .failed
            .iter()
            .map(|k| self.namespace.short(k).unwrap_or(k.as_str()).to_string())
            .collect();
        Ok(outcome)
    }
}
