//! Infrastructure backends: the multiplexer option store, command execution
//! and OS process control.
//!
//! Provides the `KeyValueStore` trait with a tmux implementation (production)
//! and an in-memory one (testing), plus the `Namespace` that maps short
//! payload names onto prefixed tmux user options.

pub mod mock;
pub mod process;
pub mod runner;
pub mod tmux;

use std::collections::BTreeMap;

use crate::error::Result;

/// Result of a bulk write that may have partially failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub written: usize,
    /// Keys whose individual fallback write also failed.
    pub failed: Vec<String>,
}

/// A process-wide string store that the status line reads asynchronously.
///
/// Keys are full option names (including the namespace prefix).
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Write several keys, ideally in one call. Implementations fall back to
    /// per-key writes when the combined call fails and report what stuck.
    fn bulk_set(&self, values: &BTreeMap<String, String>) -> Result<BulkOutcome>;

    /// All keys starting with `prefix`, with their values.
    fn enumerate(&self, prefix: &str) -> Result<BTreeMap<String, String>>;

    fn unset(&self, key: &str) -> Result<()>;
}

/// Short payload names that belong to the worker process rather than the
/// published payload. The publisher never removes them.
pub const RESERVED_KEYS: &[&str] = &[keys::DAEMON_PID];

/// Short names of the options usagebar publishes.
pub mod keys {
    pub const STATUS: &str = "status";
    pub const TOKENS: &str = "tokens";
    pub const TOKENS_RAW: &str = "tokens_raw";
    pub const LIMIT: &str = "limit";
    pub const PERCENT: &str = "percent";
    pub const COST: &str = "cost";
    pub const REMAINING: &str = "remaining";
    pub const BURN_RATE: &str = "burn_rate";
    pub const WARNING_LEVEL: &str = "warning_level";
    pub const COLOR: &str = "color";
    pub const SESSION_START: &str = "session_start";
    pub const SESSION_END: &str = "session_end";
    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const OUTPUT_TOKENS: &str = "output_tokens";
    pub const MESSAGE: &str = "message";
    pub const LAST_GOOD: &str = "last_good";
    pub const LAST_UPDATE: &str = "last_update";
    pub const PAYLOAD_HASH: &str = "payload_hash";
    pub const FRESHNESS: &str = "freshness";
    pub const AGE: &str = "age";
    pub const WARNING: &str = "warning";
    pub const DAEMON_PID: &str = "daemon_pid";
}

/// Maps short names to full option names under a fixed prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: &str) -> Self {
        Namespace {
            prefix: prefix.to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `status` -> `@usagebar_status`
    pub fn key(&self, short: &str) -> String {
        format!("{}{}", self.prefix, short)
    }

    /// `@usagebar_status` -> `status`; `None` for keys outside the namespace.
    pub fn short<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.prefix.as_str())
    }

    /// Prefix every key of a short-name map.
    pub fn qualify(&self, values: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        values
            .iter()
            .map(|(k, v)| (self.key(k), v.clone()))
            .collect()
    }

    /// Read the namespace back as a short-name map.
    pub fn read_all(&self, store: &dyn KeyValueStore) -> Result<BTreeMap<String, String>> {
        let full = store.enumerate(&self.prefix)?;
        Ok(full
            .into_iter()
            .filter_map(|(k, v)| self.short(&k).map(|s| (s.to_string(), v)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::mock::MockStore;

    #[test]
    fn mock_implements_store() {
        let store = MockStore::new();
        let _: &dyn KeyValueStore = &store;
    }

    #[test]
    fn namespace_round_trip() {
        let ns = Namespace::new("@usagebar_");
        assert_eq!(ns.key("status"), "@usagebar_status");
        assert_eq!(ns.short("@usagebar_status"), Some("status"));
        assert_eq!(ns.short("@other_status"), None);
    }

    #[test]
    fn namespace_read_all_strips_prefix() {
        let store = MockStore::new();
        store.set("@usagebar_tokens", "1.2k").unwrap();
        store.set("@elsewhere", "x").unwrap();
        let ns = Namespace::new("@usagebar_");
        let all = ns.read_all(&store).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all.get("tokens").map(String::as_str), Some("1.2k"));
    }
}
