//! Rule definition domain types.
//!
//! Rules are declarative YAML documents (one per rule) interpreted by the
//! evaluation engine. The closed set of rule types is fixed here; parameter
//! maps stay schemaless and are read through typed accessors with defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::signal::SignalLevel;

/// The closed set of rule predicates the engine can evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleType {
    #[serde(rename = "SUM_LT_1")]
    SumLt1,
    SpikeDetect,
    EndgameSweep,
    SynonymMisprice,
    DutchBookDetect,
    CrossMarketMisprice,
    TrendBreakout,
}

impl RuleType {
    /// Rules that operate across synonym groups rather than single markets.
    pub fn is_cross_market(self) -> bool {
        matches!(self, Self::SynonymMisprice | Self::CrossMarketMisprice)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SumLt1 => "SUM_LT_1",
            Self::SpikeDetect => "SPIKE_DETECT",
            Self::EndgameSweep => "ENDGAME_SWEEP",
            Self::SynonymMisprice => "SYNONYM_MISPRICE",
            Self::DutchBookDetect => "DUTCH_BOOK_DETECT",
            Self::CrossMarketMisprice => "CROSS_MARKET_MISPRICE",
            Self::TrendBreakout => "TREND_BREAKOUT",
        }
    }
}

impl std::fmt::Display for RuleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUM_LT_1" => Ok(Self::SumLt1),
            "SPIKE_DETECT" => Ok(Self::SpikeDetect),
            "ENDGAME_SWEEP" => Ok(Self::EndgameSweep),
            "SYNONYM_MISPRICE" => Ok(Self::SynonymMisprice),
            "DUTCH_BOOK_DETECT" => Ok(Self::DutchBookDetect),
            "CROSS_MARKET_MISPRICE" => Ok(Self::CrossMarketMisprice),
            "TREND_BREAKOUT" => Ok(Self::TrendBreakout),
            other => Err(format!("unknown rule type: {other}")),
        }
    }
}

/// Score composition section of a rule document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSpec {
    /// Starting score before weighted metrics are applied.
    #[serde(default = "default_score_base")]
    pub base: f64,
    /// Metric-name → weight pairs applied to the predicate's metrics.
    #[serde(default)]
    pub weights: HashMap<String, f64>,
}

fn default_score_base() -> f64 {
    50.0
}

impl Default for ScoreSpec {
    fn default() -> Self {
        Self {
            base: default_score_base(),
            weights: HashMap::new(),
        }
    }
}

/// Output section: severity level and score recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleOutputs {
    #[serde(default = "default_level")]
    pub level: SignalLevel,
    #[serde(default)]
    pub score: ScoreSpec,
}

fn default_level() -> SignalLevel {
    SignalLevel::P2
}

impl Default for RuleOutputs {
    fn default() -> Self {
        Self {
            level: default_level(),
            score: ScoreSpec::default(),
        }
    }
}

/// Emission dedupe section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDedupe {
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    300
}

impl Default for RuleDedupe {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// A declarative rule document as authored in `configs/rules/*.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub outputs: RuleOutputs,
    #[serde(default)]
    pub dedupe: RuleDedupe,
}

fn default_enabled() -> bool {
    true
}

impl RuleDoc {
    /// Numeric parameter with a fallback default.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }

    /// Integer-ish parameter with a fallback default.
    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.params
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    /// String-list parameter; empty when absent or malformed.
    pub fn param_str_list(&self, key: &str) -> Vec<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A rule document persisted in `rule_def`, with its assigned id and version.
#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub rule_id: i64,
    pub doc: RuleDoc,
    /// Monotonically increasing; bumped whenever the raw source changes.
    pub version: i64,
}
