//! Tmux option-table store: command builder, output parser and the
//! `KeyValueStore` implementation that runs them.
//!
//! Values live in global user options (`set-option -g @name value`), which
//! the status line reads with `#{@name}`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::runner::CommandRunner;
use super::{BulkOutcome, KeyValueStore};

// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// Builds tmux CLI command strings without executing them.
pub struct TmuxCommandBuilder;

impl TmuxCommandBuilder {
    pub fn new() -> Self {
        TmuxCommandBuilder
    }

    /// `tmux show-option -gqv <key>`
    pub fn show_option(&self, key: &str) -> String {
        format!("tmux show-option -gqv {}", shell_escape(key))
    }

    /// `tmux set-option -gq <key> <value>`
    pub fn set_option(&self, key: &str, value: &str) -> String {
        format!("tmux {}", self.set_clause(key, value))
    }

    /// One `tmux` invocation setting every pair, chained with `\;`.
    pub fn set_options(&self, values: &BTreeMap<String, String>) -> String {
        let clauses: Vec<String> = values
            .iter()
            .map(|(k, v)| self.set_clause(k, v))
            .collect();
        format!("tmux {}", clauses.join(" \\; "))
    }

    /// `tmux set-option -gu <key>`
    pub fn unset_option(&self, key: &str) -> String {
        format!("tmux set-option -gu {}", shell_escape(key))
    }

    /// `tmux show-options -g`
    pub fn show_options(&self) -> String {
        "tmux show-options -g".to_string()
    }

    fn set_clause(&self, key: &str, value: &str) -> String {
        format!(
            "set-option -gq {} {}",
            shell_escape(key),
            shell_escape(&escape_trailing_semicolon(value))
        )
    }
}

impl Default for TmuxCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

/// Parse `show-options -g` output into a map, keeping keys with `prefix`.
///
/// Lines look like `@name value` or `@name "value with spaces"`.
pub fn parse_show_options(output: &str, prefix: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let (key, raw) = match line.split_once(' ') {
            Some((k, v)) => (k, v),
            None => (line, ""),
        };
        if !key.starts_with(prefix) {
            continue;
        }
        values.insert(key.to_string(), unquote(raw));
    }
    values
}

/// Undo tmux's quoting of option values.
fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 && raw.starts_with('"') && raw.ends_with('"') {
        let inner = &raw[1..raw.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        return out;
    }
    if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') {
        return raw[1..raw.len() - 1].to_string();
    }
    raw.to_string()
}

// ---------------------------------------------------------------------------
// Escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe use in a shell command.
///
/// Wraps the value in single quotes and escapes any embedded single quotes
/// using the `'\''` idiom.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '@' | ','))
    {
        return s.to_string();
    }
    let escaped = s.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

/// tmux treats an argument ending in `;` as a command separator.
fn escape_trailing_semicolon(value: &str) -> String {
    match value.strip_suffix(';') {
        Some(head) => format!("{}\\;", head),
        None => value.to_string(),
    }
}

// ---------------------------------------------------------------------------
// TmuxStore (KeyValueStore implementation)
// ---------------------------------------------------------------------------

/// `KeyValueStore` over the tmux global option table.
pub struct TmuxStore {
    builder: TmuxCommandBuilder,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
    bulk_timeout: Duration,
}

impl TmuxStore {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration, bulk_timeout: Duration) -> Self {
        TmuxStore {
            builder: TmuxCommandBuilder::new(),
            runner,
            timeout,
            bulk_timeout,
        }
    }

    fn run(&self, cmd: &str, timeout: Duration) -> Result<String> {
        self.runner.run(cmd, timeout).map_err(Error::Store)
    }
}

impl KeyValueStore for TmuxStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let out = self.run(&self.builder.show_option(key), self.timeout)?;
        let value = out.trim_end_matches('\n');
        if value.is_empty() {
            Ok(None)
        } else {
            Ok(Some(value.to_string()))
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.run(&self.builder.set_option(key, value), self.timeout)?;
        Ok(())
    }

    fn bulk_set(&self, values: &BTreeMap<String, String>) -> Result<BulkOutcome> {
        if values.is_empty() {
            return Ok(BulkOutcome::default());
        }
        let combined = self.builder.set_options(values);
        let first_err = match self.run(&combined, self.bulk_timeout) {
            Ok(_) => {
                debug!(keys = values.len(), "bulk option write");
                return Ok(BulkOutcome {
                    written: values.len(),
                    failed: Vec::new(),
                });
            }
            Err(e) => e,
        };

        warn!(error = %first_err, keys = values.len(), "bulk write failed, falling back to per-key writes");
        let mut outcome = BulkOutcome::default();
        for (key, value) in values {
            match self.set(key, value) {
                Ok(()) => outcome.written += 1,
                Err(e) => {
                    debug!(key = key.as_str(), error = %e, "per-key write failed");
                    outcome.failed.push(key.clone());
                }
            }
        }
        if outcome.written == 0 {
            return Err(first_err);
        }
        if !outcome.failed.is_empty() {
            warn!(failed = ?outcome.failed, "partial bulk write");
        }
        Ok(outcome)
    }

    fn enumerate(&self, prefix: &str) -> Result<BTreeMap<String, String>> {
        let out = self.run(&self.builder.show_options(), self.timeout)?;
        Ok(parse_show_options(&out, prefix))
    }

    fn unset(&self, key: &str) -> Result<()> {
        self.run(&self.builder.unset_option(key), self.timeout)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
