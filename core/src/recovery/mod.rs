//! Retry and recovery.
//!
//! `retry` runs fallible operations with backoff; `classify` maps the final
//! failure onto the error taxonomy and its fallback, and keeps the ledger of
//! what went wrong during this process's lifetime.

pub mod classify;
pub mod retry;

pub use classify::{ErrorKind, ErrorLedger, ErrorRecord, FallbackAction, RecoveryStrategy};
pub use retry::{Retried, RetryExecutor, RetryPolicy, Sleeper, ThreadSleeper};
