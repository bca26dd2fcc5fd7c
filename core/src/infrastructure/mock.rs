//! In-memory option store for testing.
//!
//! Records every mutating call and can be switched into a failing mode,
//! making it easy to write deterministic tests for the refresh and
//! reliability layers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::error::{CommandError, Error, Result};

use super::{BulkOutcome, KeyValueStore};

/// A test double that keeps options in a map and counts writes.
pub struct MockStore {
    values: Mutex<BTreeMap<String, String>>,
    /// Number of mutating calls (`set`, `bulk_set`, `unset`).
    writes: AtomicUsize,
    /// Every `bulk_set` payload, in order.
    bulk_writes: Mutex<Vec<BTreeMap<String, String>>>,
    unavailable: AtomicBool,
}

impl MockStore {
    pub fn new() -> Self {
        MockStore {
            values: Mutex::new(BTreeMap::new()),
            writes: AtomicUsize::new(0),
            bulk_writes: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Total mutating calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn bulk_writes(&self) -> Vec<BTreeMap<String, String>> {
        self.bulk_writes.lock().map(|b| b.clone()).unwrap_or_default()
    }

    /// Current contents.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.values.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Seed a value without counting it as a write.
    pub fn seed(&self, key: &str, value: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value.to_string());
        }
    }

    /// Make every call fail as if the tmux server were gone.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Store(CommandError::Failed {
                command: "tmux".into(),
                code: Some(1),
                stderr: "no server running on /tmp/tmux-1000/default".into(),
            }));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.values
            .lock()
            .map_err(|_| Error::Other("mock store poisoned".into()))
    }
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MockStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn bulk_set(&self, values: &BTreeMap<String, String>) -> Result<BulkOutcome> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut log) = self.bulk_writes.lock() {
            log.push(values.clone());
        }
        let mut stored = self.lock()?;
        for (k, v) in values {
            stored.insert(k.clone(), v.clone());
        }
        Ok(BulkOutcome {
            written: values.len(),
            failed: Vec::new(),
        })
    }

    fn enumerate(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        self.check()?;
        Ok(self
            .lock()?
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn unset(&self, key: &str) -> Result<()> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.lock()?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_counts_writes_not_reads() {
        let store = MockStore::new();
        store.set("@a", "1").unwrap();
        assert_eq!(store.get("@a").unwrap(), Some("1".into()));
        store.enumerate("@").unwrap();
        assert_eq!(store.write_count(), 1);
        store.unset("@a").unwrap();
        assert_eq!(store.write_count(), 2);
        assert_eq!(store.get("@a").unwrap(), None);
    }

    #[test]
    fn mock_seed_is_not_a_write() {
        let store = MockStore::new();
        store.seed("@a", "1");
        assert_eq!(store.write_count(), 0);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn mock_unavailable_fails_everything() {
        let store = MockStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.get("@a"), Err(Error::Store(_))));
        assert!(store.enumerate("@").is_err());
        store.set_unavailable(false);
        assert!(store.get("@a").is_ok());
    }
}
