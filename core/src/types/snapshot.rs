use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};


#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BurnRate {
    #[serde(default)]
    pub tokens_per_minute: f64,
    #[serde(default)]
    pub cost_per_hour: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Projection {
    #[serde(default)]
    pub remaining_minutes: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenLimitStatus {
    pub limit: u64,
    #[serde(default)]
    pub projected_usage: Option<u64>,
    #[serde(default)]
    pub percent_used: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}


/// One usage block as reported by the upstream metrics command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub is_active: bool,
    pub total_tokens: u64,
    #[serde(rename = "costUSD")]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_rate: Option<BurnRate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub projection: Option<Projection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_counts: Option<TokenCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_limit_status: Option<TokenLimitStatus>,
}

#[derive(Debug, Deserialize)]
struct BlockList {
    blocks: Vec<UsageSnapshot>,
}

impl UsageSnapshot {
    /// Safe default published when the upstream source cannot be reached.
    pub fn unavailable() -> Self {
        UsageSnapshot {
            is_active: false,
            total_tokens: 0,
            cost_usd: 0.0,
            start_time: None,
            end_time: None,
            burn_rate: None,
            projection: None,
            token_counts: None,
            token_limit_status: None,
        }
    }

    /// Parse upstream output: either a bare block object or `{"blocks": [...]}`.
    ///
    /// From a block list the first active block wins, then the first block;
    /// an empty list is an inactive snapshot.
    pub fn parse(output: &str) -> Result<UsageSnapshot> {
        let value: serde_json::Value = serde_json::from_str(output.trim())
            .map_err(|e| Error::Malformed(format!("not JSON: {}", e)))?;

        if value.get("blocks").is_some() {
            let list: BlockList = serde_json::from_value(value)
                .map_err(|e| Error::Malformed(format!("bad block list: {}", e)))?;
            let mut blocks = list.blocks;
            let idx = blocks.iter().position(|b| b.is_active).unwrap_or(0);
            if blocks.is_empty() {
                return Ok(UsageSnapshot::unavailable());
            }
            return Ok(blocks.swap_remove(idx));
        }

        serde_json::from_value(value).map_err(|e| Error::Malformed(format!("bad block: {}", e)))
    }

    /// Projected minutes left in the block, if known.
    pub fn remaining_minutes(&self) -> Option<f64> {
        self.projection.as_ref().map(|p| p.remaining_minutes)
    }

    pub fn tokens_per_minute(&self) -> Option<f64> {
        self.burn_rate.as_ref().map(|b| b.tokens_per_minute)
    }

    /// Limit reported upstream, falling back to the configured one.
    pub fn effective_limit(&self, configured: u64) -> u64 {
        match &self.token_limit_status {
            Some(status) if status.limit > 0 => status.limit,
            _ => configured,
        }
    }
}
