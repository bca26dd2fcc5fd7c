//! Change detection for the refresh cycle.
//!
//! `fingerprint` reduces configuration and snapshots to comparable strings;
//! `engine` keeps the single cached payload and tunes its TTL from recent
//! hit/miss history.

pub mod engine;
pub mod fingerprint;

pub use engine::{CacheEngine, CacheEntry, CacheSummary, Lookup, MissReason};
pub use fingerprint::{FingerprintHasher, Fingerprints};
