//! Retry policies and the retry executor.
//!
//! `RetryPolicy` computes backoff delays (fixed, linear, exponential).
//! `RetryExecutor` runs a fallible operation under a policy, sleeps between
//! attempts through an injectable `Sleeper`, and once attempts are exhausted
//! classifies the last error and applies the fallback from the recovery
//! table, recording the outcome in its `ErrorLedger`.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::clock::now_ms;
use crate::error::Result;
use crate::types::config::{BackoffStrategy, RefreshSettings};

use super::classify::{ErrorKind, ErrorLedger, FallbackAction};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// How many attempts an operation gets and how long to wait between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, strategy: BackoffStrategy, base_delay_ms: u64) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            strategy,
            base_delay_ms,
        }
    }

    pub fn from_settings(refresh: &RefreshSettings) -> Self {
        RetryPolicy::new(
            refresh.retry_attempts,
            refresh.backoff_strategy,
            refresh.retry_backoff_ms,
        )
    }

    /// Same backoff, different attempt budget.
    pub fn with_attempts(&self, max_attempts: u32) -> Self {
        RetryPolicy::new(max_attempts, self.strategy, self.base_delay_ms)
    }

    /// Whether another attempt follows the given (1-indexed) failed attempt.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay after the given (1-indexed) failed attempt.
    ///
    /// Linear is `base * attempt`; exponential doubles from `base`.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let attempt = attempt.max(1);
        match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(2u64.saturating_pow(attempt - 1)),
        }
    }
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, linear backoff, 500ms base delay.
    fn default() -> Self {
        RetryPolicy::from_settings(&RefreshSettings::default())
    }
}

// ---------------------------------------------------------------------------
// Sleeper
// ---------------------------------------------------------------------------

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

// ---------------------------------------------------------------------------
// RetryExecutor
// ---------------------------------------------------------------------------

/// The value an executor run produced, and whether it came from a fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    /// Set when retries were exhausted and the fallback supplied `value`.
    pub recovered: Option<ErrorKind>,
}

pub struct RetryExecutor {
    sleeper: Arc<dyn Sleeper>,
    ledger: ErrorLedger,
}

impl RetryExecutor {
    pub fn new(sleeper: Arc<dyn Sleeper>) -> Self {
        RetryExecutor {
            sleeper,
            ledger: ErrorLedger::new(),
        }
    }

    pub fn ledger(&self) -> &ErrorLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut ErrorLedger {
        &mut self.ledger
    }

    /// Run `op` up to `policy.max_attempts` times. A failure whose kind is
    /// not retryable ends the run at once.
    ///
    /// After the last failure the error is classified and recorded. Kinds
    /// whose fallback is `UseDefault` call `fallback` exactly once and return
    /// its value; the others log guidance and return the error.
    pub fn with_retry<T, F, D>(
        &mut self,
        label: &str,
        policy: &RetryPolicy,
        mut op: F,
        fallback: D,
    ) -> Result<Retried<T>>
    where
        F: FnMut() -> Result<T>,
        D: FnOnce() -> T,
    {
        let mut attempt = 0;
        let (last_err, kind) = loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(op = label, attempt, "succeeded after retry");
                    }
                    return Ok(Retried {
                        value,
                        attempts: attempt,
                        recovered: None,
                    });
                }
                Err(e) => {
                    let kind = ErrorKind::classify(&e);
                    if !kind.strategy().retryable || !policy.should_retry(attempt) {
                        break (e, kind);
                    }
                    let delay = policy.delay_ms(attempt);
                    debug!(op = label, attempt, delay_ms = delay, error = %e, "attempt failed, backing off");
                    self.sleeper.sleep(Duration::from_millis(delay));
                }
            }
        };

        self.ledger.record(kind, now_ms());
        match kind.strategy().fallback {
            FallbackAction::UseDefault => {
                warn!(
                    op = label,
                    attempts = attempt,
                    kind = kind.as_str(),
                    error = %last_err,
                    "{}",
                    kind.guidance()
                );
                self.ledger.record_recovery();
                Ok(Retried {
                    value: fallback(),
                    attempts: attempt,
                    recovered: Some(kind),
                })
            }
            FallbackAction::LogOnly => {
                warn!(op = label, attempts = attempt, kind = kind.as_str(), error = %last_err, "{}", kind.guidance());
                Err(last_err)
            }
            FallbackAction::Surface => {
                error!(op = label, attempts = attempt, kind = kind.as_str(), error = %last_err, "{}", kind.guidance());
                Err(last_err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
