//! Display formatting: numbers to status-line strings.
//!
//! Everything here is pure: a value plus a style selector in, a string out.
//! `render` assembles the full published payload for one snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Local, TimeZone};

use crate::infrastructure::keys;
use crate::types::config::{ColorPalette, CostStyle, Settings, Thresholds, TimeStyle, TokenStyle};
use crate::types::snapshot::UsageSnapshot;


/// Severity of the current usage relative to the configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningLevel {
    Normal,
    Warning,
    Danger,
}

impl WarningLevel {
    pub fn for_percent(percent: f64, thresholds: &Thresholds) -> WarningLevel {
        if percent >= thresholds.danger_percent {
            WarningLevel::Danger
        } else if percent >= thresholds.warning_percent {
            WarningLevel::Warning
        } else {
            WarningLevel::Normal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Normal => "normal",
            WarningLevel::Warning => "warning",
            WarningLevel::Danger => "danger",
        }
    }

    pub fn color<'a>(&self, palette: &'a ColorPalette) -> &'a str {
        match self {
            WarningLevel::Normal => &palette.normal,
            WarningLevel::Warning => &palette.warning,
            WarningLevel::Danger => &palette.danger,
        }
    }
}

/// `999`, `1.2k`, `130.0k`, `1.5M` or `130,000`.
pub fn format_tokens(tokens: u64, style: TokenStyle) -> String {
    match style {
        TokenStyle::Full => group_thousands(tokens),
        TokenStyle::Compact => {
            if tokens >= 1_000_000 {
                format!("{:.1}M", tokens as f64 / 1_000_000.0)
            } else if tokens >= 1_000 {
                format!("{:.1}k", tokens as f64 / 1_000.0)
            } else {
                tokens.to_string()
            }
        }
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

pub fn format_cost(usd: f64, style: CostStyle) -> String {
    let usd = if usd.is_finite() { usd.max(0.0) } else { 0.0 };
    match style {
        CostStyle::Currency => format!("${:.2}", usd),
        CostStyle::Plain => format!("{:.2}", usd),
    }
}

/// Format a duration given in minutes. Negative or non-finite input is zero.
pub fn format_minutes(minutes: f64, style: TimeStyle) -> String {
    let total = if minutes.is_finite() && minutes > 0.0 {
        minutes.round() as u64
    } else {
        0
    };
    let (h, m) = (total / 60, total % 60);
    match style {
        TimeStyle::Compact => {
            if h > 0 {
                format!("{}h {}m", h, m)
            } else {
                format!("{}m", m)
            }
        }
        TimeStyle::Verbose => {
            let plural = |n: u64, unit: &str| {
                if n == 1 {
                    format!("1 {}", unit)
                } else {
                    format!("{} {}s", n, unit)
                }
            };
            if h > 0 {
                format!("{} {}", plural(h, "hour"), plural(m, "minute"))
            } else {
                plural(m, "minute")
            }
        }
        TimeStyle::Clock => format!("{}:{:02}", h, m),
    }
}

pub fn format_percent(percent: f64) -> String {
    format!("{:.1}%", percent)
}

pub fn usage_percent(tokens: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    tokens as f64 / limit as f64 * 100.0
}

/// `1.3k/min`
pub fn format_burn_rate(tokens_per_minute: f64) -> String {
    let rate = if tokens_per_minute.is_finite() {
        tokens_per_minute.max(0.0).round() as u64
    } else {
        0
    };
    format!("{}/min", format_tokens(rate, TokenStyle::Compact))
}

/// Local `HH:MM` of an RFC 3339 timestamp, or `None` if it does not parse.
pub fn format_clock_time(rfc3339: &str) -> Option<String> {
    DateTime::parse_from_rfc3339(rfc3339)
        .ok()
        .map(|t| t.with_timezone(&Local).format("%H:%M").to_string())
}

/// Local `HH:MM` of an epoch-seconds timestamp.
pub fn format_epoch_clock(epoch_secs: u64) -> String {
    match Local.timestamp_opt(epoch_secs as i64, 0).single() {
        Some(t) => t.format("%H:%M").to_string(),
        None => "never".to_string(),
    }
}

/// Human age: `45s`, `12m`, `3h 5m`.
pub fn format_age(age_secs: u64) -> String {
    if age_secs < 60 {
        format!("{}s", age_secs)
    } else if age_secs < 3600 {
        format!("{}m", age_secs / 60)
    } else {
        format!("{}h {}m", age_secs / 3600, (age_secs % 3600) / 60)
    }
}

/// Build the payload published for one snapshot, keyed by short name.
pub fn render(snapshot: &UsageSnapshot, settings: &Settings) -> BTreeMap<String, String> {
    let display = &settings.display;
    let mut out = BTreeMap::new();
    let mut put = |k: &str, v: String| {
        out.insert(k.to_string(), v);
    };

    let limit = snapshot.effective_limit(settings.token_limit);
    put(keys::TOKENS, format_tokens(snapshot.total_tokens, display.token_style));
    put(keys::TOKENS_RAW, snapshot.total_tokens.to_string());
    put(keys::LIMIT, format_tokens(limit, display.token_style));
    put(keys::COST, format_cost(snapshot.cost_usd, display.cost_style));

    if !snapshot.is_active {
        put(keys::STATUS, "inactive".into());
        put(keys::PERCENT, format_percent(0.0));
        put(keys::REMAINING, "--".into());
        put(keys::BURN_RATE, "--".into());
        put(keys::WARNING_LEVEL, WarningLevel::Normal.as_str().into());
        put(keys::COLOR, settings.colors.inactive.clone());
        return out;
    }

    let percent = usage_percent(snapshot.total_tokens, limit);
    let level = WarningLevel::for_percent(percent, &settings.thresholds);
    put(keys::STATUS, "active".into());
    put(keys::PERCENT, format_percent(percent));
    put(
        keys::REMAINING,
        snapshot
            .remaining_minutes()
            .map(|m| format_minutes(m, display.time_style))
            .unwrap_or_else(|| "--".into()),
    );
    put(
        keys::BURN_RATE,
        snapshot
            .tokens_per_minute()
            .map(format_burn_rate)
            .unwrap_or_else(|| "--".into()),
    );
    put(keys::WARNING_LEVEL, level.as_str().into());
    put(keys::COLOR, level.color(&settings.colors).to_string());

    if let Some(start) = snapshot.start_time.as_deref().and_then(format_clock_time) {
        put(keys::SESSION_START, start);
    }
    if let Some(end) = snapshot.end_time.as_deref().and_then(format_clock_time) {
        put(keys::SESSION_END, end);
    }
    if let Some(counts) = &snapshot.token_counts {
        put(keys::INPUT_TOKENS, format_tokens(counts.input_tokens, display.token_style));
        put(keys::OUTPUT_TOKENS, format_tokens(counts.output_tokens, display.token_style));
    }
    out
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::snapshot::{Projection, TokenCounts};

    fn active(tokens: u64, remaining: f64) -> UsageSnapshot {
        UsageSnapshot {
            is_active: true,
            total_tokens: tokens,
            cost_usd: 9.87,
            projection: Some(Projection {
                remaining_minutes: remaining,
                ..Default::default()
            }),
            ..UsageSnapshot::unavailable()
        }
    }

    #[test]
    fn tokens_compact() {
        assert_eq!(format_tokens(999, TokenStyle::Compact), "999");
        assert_eq!(format_tokens(1_234, TokenStyle::Compact), "1.2k");
        assert_eq!(format_tokens(130_000, TokenStyle::Compact), "130.0k");
        assert_eq!(format_tokens(1_500_000, TokenStyle::Compact), "1.5M");
    }

    #[test]
    fn tokens_full() {
        assert_eq!(format_tokens(0, TokenStyle::Full), "0");
        assert_eq!(format_tokens(999, TokenStyle::Full), "999");
        assert_eq!(format_tokens(130_000, TokenStyle::Full), "130,000");
        assert_eq!(format_tokens(1_234_567, TokenStyle::Full), "1,234,567");
    }

    #[test]
    fn cost_styles() {
        assert_eq!(format_cost(1.234, CostStyle::Currency), "$1.23");
        assert_eq!(format_cost(1.235, CostStyle::Plain).len(), 4);
        assert_eq!(format_cost(-3.0, CostStyle::Currency), "$0.00");
        assert_eq!(format_cost(f64::NAN, CostStyle::Currency), "$0.00");
    }

    #[test]
    fn minutes_styles() {
        assert_eq!(format_minutes(85.0, TimeStyle::Compact), "1h 25m");
        assert_eq!(format_minutes(25.0, TimeStyle::Compact), "25m");
        assert_eq!(format_minutes(85.0, TimeStyle::Verbose), "1 hour 25 minutes");
        assert_eq!(format_minutes(121.0, TimeStyle::Verbose), "2 hours 1 minute");
        assert_eq!(format_minutes(85.0, TimeStyle::Clock), "1:25");
        assert_eq!(format_minutes(-5.0, TimeStyle::Compact), "0m");
    }

    #[test]
    fn warning_levels_inclusive_at_threshold() {
        let t = Thresholds::default();
        assert_eq!(WarningLevel::for_percent(69.9, &t), WarningLevel::Normal);
        assert_eq!(WarningLevel::for_percent(70.0, &t), WarningLevel::Warning);
        assert_eq!(WarningLevel::for_percent(90.0, &t), WarningLevel::Danger);
        assert_eq!(WarningLevel::for_percent(92.9, &t), WarningLevel::Danger);
    }

    #[test]
    fn percent_and_zero_limit() {
        assert_eq!(format_percent(usage_percent(130_000, 140_000)), "92.9%");
        assert_eq!(usage_percent(5, 0), 0.0);
    }

    #[test]
    fn ages() {
        assert_eq!(format_age(45), "45s");
        assert_eq!(format_age(720), "12m");
        assert_eq!(format_age(3 * 3600 + 300), "3h 5m");
    }

    #[test]
    fn burn_rate() {
        assert_eq!(format_burn_rate(1250.5), "1.3k/min");
        assert_eq!(format_burn_rate(12.0), "12/min");
    }

    #[test]
    fn clock_time_rejects_garbage() {
        assert!(format_clock_time("yesterday").is_none());
        let t = format_clock_time("2026-10-19T09:00:00.000Z").unwrap();
        assert_eq!(t.len(), 5);
        assert_eq!(&t[2..3], ":");
    }

    #[test]
    fn render_danger_scenario() {
        let payload = render(&active(130_000, 25.0), &Settings::default());
        assert_eq!(payload[keys::STATUS], "active");
        assert_eq!(payload[keys::PERCENT], "92.9%");
        assert_eq!(payload[keys::WARNING_LEVEL], "danger");
        assert_eq!(payload[keys::COLOR], "red");
        assert_eq!(payload[keys::REMAINING], "25m");
        assert_eq!(payload[keys::TOKENS], "130.0k");
        assert_eq!(payload[keys::LIMIT], "140.0k");
        assert_eq!(payload[keys::COST], "$9.87");
        assert_eq!(payload[keys::BURN_RATE], "--");
        assert!(!payload.contains_key(keys::SESSION_START));
    }

    #[test]
    fn render_inactive() {
        let payload = render(&UsageSnapshot::unavailable(), &Settings::default());
        assert_eq!(payload[keys::STATUS], "inactive");
        assert_eq!(payload[keys::WARNING_LEVEL], "normal");
        assert_eq!(payload[keys::COLOR], "colour244");
        assert_eq!(payload[keys::REMAINING], "--");
    }

    #[test]
    fn render_optional_breakdown() {
        let mut snap = active(10_000, 100.0);
        snap.token_counts = Some(TokenCounts {
            input_tokens: 1_000,
            output_tokens: 9_000,
            ..Default::default()
        });
        snap.start_time = Some("2026-10-19T09:00:00Z".into());
        let payload = render(&snap, &Settings::default());
        assert_eq!(payload[keys::INPUT_TOKENS], "1.0k");
        assert_eq!(payload[keys::OUTPUT_TOKENS], "9.0k");
        assert!(payload.contains_key(keys::SESSION_START));
        assert_eq!(payload[keys::WARNING_LEVEL], "normal");
        assert_eq!(payload[keys::COLOR], "green");
    }
}
