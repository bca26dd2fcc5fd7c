//! Failure taxonomy, the fixed recovery table, and the per-process ledger.
//!
//! Classification works on the typed [`Error`]: which external call failed
//! and how. Only the multiplexer's stderr is inspected as text, since tmux
//! reports session and permission problems nowhere else.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{CommandError, Error};


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UpstreamMissing,
    UpstreamTimeout,
    MalformedResponse,
    StoreUnavailable,
    StoreNoSession,
    StorePermission,
    ConfigInvalid,
    Unknown,
}

/// What happens once retries are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackAction {
    /// Substitute the caller's safe default and continue.
    UseDefault,
    /// Log guidance and hand the error back; the next cycle retries.
    LogOnly,
    /// Log loudly and hand the error back; needs a human.
    Surface,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecoveryStrategy {
    /// Whether another attempt can succeed. Non-retryable kinds stop after
    /// the first failure; the rest use the caller's `RetryPolicy` budget.
    pub retryable: bool,
    pub fallback: FallbackAction,
}

impl ErrorKind {
    pub fn classify(err: &Error) -> ErrorKind {
        match err {
            Error::Upstream(cmd) => match cmd {
                CommandError::NotFound { .. } => ErrorKind::UpstreamMissing,
                CommandError::Failed { code: Some(127), .. } => ErrorKind::UpstreamMissing,
                CommandError::Spawn { source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    ErrorKind::UpstreamMissing
                }
                CommandError::Timeout { .. } => ErrorKind::UpstreamTimeout,
                _ => ErrorKind::Unknown,
            },
            Error::Malformed(_) | Error::Json(_) => ErrorKind::MalformedResponse,
            Error::Config(_) | Error::Yaml(_) => ErrorKind::ConfigInvalid,
            Error::Store(cmd) => classify_store(cmd),
            _ => ErrorKind::Unknown,
        }
    }

    pub fn strategy(&self) -> RecoveryStrategy {
        let (retryable, fallback) = match self {
            ErrorKind::UpstreamMissing => (false, FallbackAction::UseDefault),
            ErrorKind::UpstreamTimeout => (true, FallbackAction::UseDefault),
            ErrorKind::MalformedResponse => (true, FallbackAction::UseDefault),
            ErrorKind::ConfigInvalid => (false, FallbackAction::UseDefault),
            ErrorKind::StoreUnavailable => (true, FallbackAction::LogOnly),
            ErrorKind::StoreNoSession => (true, FallbackAction::LogOnly),
            ErrorKind::StorePermission => (false, FallbackAction::Surface),
            ErrorKind::Unknown => (false, FallbackAction::UseDefault),
        };
        RecoveryStrategy {
            retryable,
            fallback,
        }
    }

    /// One line telling the operator what to do about it.
    pub fn guidance(&self) -> &'static str {
        match self {
            ErrorKind::UpstreamMissing => {
                "usage command not found; install it or set refresh.upstream_command"
            }
            ErrorKind::UpstreamTimeout => {
                "usage command timed out; raise refresh.upstream_timeout_ms if this persists"
            }
            ErrorKind::MalformedResponse => "usage command returned unexpected output; check its version",
            ErrorKind::StoreUnavailable => "tmux option table unreachable; will retry next cycle",
            ErrorKind::StoreNoSession => "no tmux server running; start tmux and values will appear",
            ErrorKind::StorePermission => "tmux socket permission denied; check TMUX_TMPDIR ownership",
            ErrorKind::ConfigInvalid => "config.yaml is invalid; using defaults until it is fixed",
            ErrorKind::Unknown => "unexpected failure; treated as recovered",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::UpstreamMissing => "upstream_missing",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::StoreNoSession => "store_no_session",
            ErrorKind::StorePermission => "store_permission",
            ErrorKind::ConfigInvalid => "config_invalid",
            ErrorKind::Unknown => "unknown",
        }
    }
}

fn classify_store(cmd: &CommandError) -> ErrorKind {
    if let CommandError::Spawn { source, .. } = cmd {
        if source.kind() == std::io::ErrorKind::PermissionDenied {
            return ErrorKind::StorePermission;
        }
    }
    let stderr = cmd.stderr().to_lowercase();
    if stderr.contains("permission denied") {
        ErrorKind::StorePermission
    } else if stderr.contains("no server running")
        || stderr.contains("no current session")
        || stderr.contains("no sessions")
        || stderr.contains("error connecting")
    {
        ErrorKind::StoreNoSession
    } else {
        ErrorKind::StoreUnavailable
    }
}


// ---------------------------------------------------------------------------
// ErrorLedger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub occurrence_count: u64,
    pub last_occurrence_ms: u64,
    pub strategy: RecoveryStrategy,
}

/// Classified failures seen by this process, one record per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ErrorLedger {
    records: BTreeMap<ErrorKind, ErrorRecord>,
    recoveries: u64,
}

impl ErrorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: ErrorKind, now_ms: u64) -> &ErrorRecord {
        let rec = self.records.entry(kind).or_insert(ErrorRecord {
            kind,
            occurrence_count: 0,
            last_occurrence_ms: 0,
            strategy: kind.strategy(),
        });
        rec.occurrence_count += 1;
        rec.last_occurrence_ms = now_ms;
        rec
    }

    pub fn record_recovery(&mut self) {
        self.recoveries += 1;
    }

    pub fn get(&self, kind: ErrorKind) -> Option<&ErrorRecord> {
        self.records.get(&kind)
    }

    pub fn records(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.values()
    }

    pub fn total(&self) -> u64 {
        self.records.values().map(|r| r.occurrence_count).sum()
    }

    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.recoveries = 0;
    }
}
