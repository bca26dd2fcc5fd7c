use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};


#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TokenStyle {
    /// `130.0k`, `1.5M`
    Compact,
    /// `130,000`
    Full,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CostStyle {
    Currency,
    Plain,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeStyle {
    /// `1h 25m`
    Compact,
    /// `1 hour 25 minutes`
    Verbose,
    /// `1:25`
    Clock,
}


#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Thresholds {
    pub warning_percent: f64,
    pub danger_percent: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            warning_percent: 70.0,
            danger_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub token_style: TokenStyle,
    pub cost_style: CostStyle,
    pub time_style: TimeStyle,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            token_style: TokenStyle::Compact,
            cost_style: CostStyle::Currency,
            time_style: TimeStyle::Compact,
        }
    }
}

/// tmux colour names used for the `color` option.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ColorPalette {
    pub normal: String,
    pub warning: String,
    pub danger: String,
    pub error: String,
    pub inactive: String,
}

impl Default for ColorPalette {
    fn default() -> Self {
        ColorPalette {
            normal: "green".into(),
            warning: "yellow".into(),
            danger: "red".into(),
            error: "red".into(),
            inactive: "colour244".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RefreshSettings {
    pub interval_ms: u64,
    pub upstream_command: String,
    pub upstream_timeout_ms: u64,
    pub store_timeout_ms: u64,
    pub bulk_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        RefreshSettings {
            interval_ms: 15_000,
            upstream_command: "ccusage blocks --active --json".into(),
            upstream_timeout_ms: 15_000,
            store_timeout_ms: 5_000,
            bulk_timeout_ms: 30_000,
            retry_attempts: 3,
            retry_backoff_ms: 500,
            backoff_strategy: BackoffStrategy::Linear,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FreshnessSettings {
    pub fresh_secs: u64,
    pub stale_secs: u64,
    /// Identical payloads are re-stamped once the stamp is at least this old.
    /// Keep it above `refresh.interval_ms` so cache hits write nothing, and
    /// below `fresh_secs` so hits keep the data fresh.
    pub restamp_after_secs: u64,
    pub auto_invalidate: bool,
}

impl Default for FreshnessSettings {
    fn default() -> Self {
        FreshnessSettings {
            fresh_secs: 30,
            stale_secs: 300,
            restamp_after_secs: 25,
            auto_invalidate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WatchdogSettings {
    pub max_restart_attempts: u32,
    pub restart_cooldown_ms: u64,
    pub settle_ms: u64,
    pub pid_cache_ms: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        WatchdogSettings {
            max_restart_attempts: 3,
            restart_cooldown_ms: 5_000,
            settle_ms: 2_000,
            pid_cache_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReliabilitySettings {
    pub monitor_interval_ms: u64,
    pub auto_recovery: bool,
    pub critical_alert_threshold: u32,
    pub recovery_settle_ms: u64,
}

impl Default for ReliabilitySettings {
    fn default() -> Self {
        ReliabilitySettings {
            monitor_interval_ms: 60_000,
            auto_recovery: true,
            critical_alert_threshold: 3,
            recovery_settle_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LockSettings {
    pub name: String,
    pub timeout_secs: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            name: "usagebar".into(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSettings {
    pub prefix: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        StoreSettings {
            prefix: "@usagebar_".into(),
        }
    }
}


/// Contents of `config.yaml`. Every section is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub token_limit: u64,
    pub thresholds: Thresholds,
    pub display: DisplayConfig,
    pub colors: ColorPalette,
    pub refresh: RefreshSettings,
    pub freshness: FreshnessSettings,
    pub watchdog: WatchdogSettings,
    pub reliability: ReliabilitySettings,
    pub lock: LockSettings,
    pub store: StoreSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            token_limit: 140_000,
            thresholds: Thresholds::default(),
            display: DisplayConfig::default(),
            colors: ColorPalette::default(),
            refresh: RefreshSettings::default(),
            freshness: FreshnessSettings::default(),
            watchdog: WatchdogSettings::default(),
            reliability: ReliabilitySettings::default(),
            lock: LockSettings::default(),
            store: StoreSettings::default(),
        }
    }
}

/// The subset of settings that changes rendered output. Fingerprinted by the
/// cache; anything outside it can change without forcing a recompute.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OutputSettings<'a> {
    pub token_limit: u64,
    pub thresholds: &'a Thresholds,
    pub display: &'a DisplayConfig,
    pub colors: &'a ColorPalette,
}

impl Settings {
    /// Load settings from a YAML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Settings> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(e) => return Err(Error::Io(e)),
        };
        Settings::parse(&content)
    }

    /// Parse and validate settings from YAML text.
    pub fn parse(content: &str) -> Result<Settings> {
        if content.trim().is_empty() {
            return Ok(Settings::default());
        }
        let settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("cannot parse config: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.freshness.fresh_secs >= self.freshness.stale_secs {
            return Err(Error::Config(format!(
                "freshness.fresh_secs ({}) must be below freshness.stale_secs ({})",
                self.freshness.fresh_secs, self.freshness.stale_secs
            )));
        }
        if self.thresholds.warning_percent >= self.thresholds.danger_percent {
            return Err(Error::Config(format!(
                "thresholds.warning_percent ({}) must be below thresholds.danger_percent ({})",
                self.thresholds.warning_percent, self.thresholds.danger_percent
            )));
        }
        if self.refresh.retry_attempts == 0 {
            return Err(Error::Config("refresh.retry_attempts must be at least 1".into()));
        }
        if !self.store.prefix.starts_with('@') || self.store.prefix.len() < 2 {
            return Err(Error::Config(format!(
                "store.prefix must be a tmux user option prefix like '@usagebar_', got '{}'",
                self.store.prefix
            )));
        }
        Ok(())
    }

    pub fn output(&self) -> OutputSettings<'_> {
        OutputSettings {
            token_limit: self.token_limit,
            thresholds: &self.thresholds,
            display: &self.display,
            colors: &self.colors,
        }
    }
}
