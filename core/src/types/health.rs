use serde::{Deserialize, Serialize};


/// Age class of the published data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

impl Freshness {
    /// Classify an age against the two thresholds. Each boundary belongs to
    /// the fresher class.
    pub fn classify(age_secs: u64, fresh_secs: u64, stale_secs: u64) -> Freshness {
        if age_secs <= fresh_secs {
            Freshness::Fresh
        } else if age_secs <= stale_secs {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Freshness::Fresh => "fresh",
            Freshness::Stale => "stale",
            Freshness::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FreshnessSample {
    /// Epoch seconds of the last stamp, if any was ever written.
    pub last_stamped_at: Option<u64>,
    /// `u64::MAX` when nothing was ever stamped.
    pub age_secs: u64,
    pub classification: Freshness,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DaemonHealth {
    pub daemon_pid: Option<u32>,
    pub is_alive: bool,
    pub issues: Vec<String>,
    pub recovery_actions: Vec<String>,
}


/// Fused assessment of worker liveness and data freshness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityVerdict {
    High,
    Medium,
    Low,
    Critical,
}

impl ReliabilityVerdict {
    pub fn from_signals(daemon_alive: bool, freshness: Freshness) -> ReliabilityVerdict {
        let expired = freshness == Freshness::Expired;
        match (daemon_alive, expired) {
            (false, true) => ReliabilityVerdict::Critical,
            (false, false) | (true, true) => ReliabilityVerdict::Low,
            (true, false) if freshness == Freshness::Stale => ReliabilityVerdict::Medium,
            (true, false) => ReliabilityVerdict::High,
        }
    }

    /// High and Medium need no intervention.
    pub fn is_acceptable(&self) -> bool {
        matches!(self, ReliabilityVerdict::High | ReliabilityVerdict::Medium)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReliabilityReport {
    pub verdict: ReliabilityVerdict,
    pub daemon_health: DaemonHealth,
    /// Absent when the freshness stamp could not be read.
    pub freshness: Option<FreshnessSample>,
    pub recommendations: Vec<String>,
    pub critical_issues: Vec<String>,
    pub generated_at_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub actions_performed: Vec<String>,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn freshness_boundaries_belong_to_fresher_class() {
        assert_eq!(Freshness::classify(0, 30, 300), Freshness::Fresh);
        assert_eq!(Freshness::classify(30, 30, 300), Freshness::Fresh);
        assert_eq!(Freshness::classify(31, 30, 300), Freshness::Stale);
        assert_eq!(Freshness::classify(300, 30, 300), Freshness::Stale);
        assert_eq!(Freshness::classify(301, 30, 300), Freshness::Expired);
    }

    #[test]
    fn verdict_table() {
        use Freshness::*;
        use ReliabilityVerdict::*;
        assert_eq!(ReliabilityVerdict::from_signals(true, Fresh), High);
        assert_eq!(ReliabilityVerdict::from_signals(true, Stale), Medium);
        assert_eq!(ReliabilityVerdict::from_signals(true, Expired), Low);
        assert_eq!(ReliabilityVerdict::from_signals(false, Fresh), Low);
        assert_eq!(ReliabilityVerdict::from_signals(false, Stale), Low);
        assert_eq!(ReliabilityVerdict::from_signals(false, Expired), Critical);
    }

    #[test]
    fn acceptable_verdicts() {
        assert!(ReliabilityVerdict::High.is_acceptable());
        assert!(ReliabilityVerdict::Medium.is_acceptable());
        assert!(!ReliabilityVerdict::Low.is_acceptable());
        assert!(!ReliabilityVerdict::Critical.is_acceptable());
    }

    #[test]
    fn verdict_serializes_snake_case() {
        let json = serde_json::to_string(&ReliabilityVerdict::Critical).unwrap();
        assert_eq!(json, "\"critical\"");
        let json = serde_json::to_string(&Freshness::Stale).unwrap();
        assert_eq!(json, "\"stale\"");
    }
}
