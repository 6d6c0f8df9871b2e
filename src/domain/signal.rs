//! Signal domain types.
//!
//! A `Signal` is the rule engine's output: a ranked, structured record of a
//! detected opportunity. Payloads are tagged per rule type with a known
//! schema for each tag, plus an untagged fallback bag so consumers can
//! round-trip payload shapes this build does not know about.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Signal severity. `P1` is the highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SignalLevel {
    P1,
    P2,
    P3,
}

impl SignalLevel {
    /// Only P1/P2 signals are actionable by the intent pipeline.
    pub fn is_actionable(self) -> bool {
        matches!(self, Self::P1 | Self::P2)
    }
}

impl std::fmt::Display for SignalLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::P3 => write!(f, "P3"),
        }
    }
}

impl std::str::FromStr for SignalLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P1" => Ok(Self::P1),
            "P2" => Ok(Self::P2),
            "P3" => Ok(Self::P3),
            other => Err(format!("unknown signal level: {other}")),
        }
    }
}

/// Trade direction for a plan leg or an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Convert a tick price into the decimal space used for fund arithmetic.
///
/// Prices are quoted to 4 decimals upstream; 6 keeps headroom for mids.
pub fn price_dec(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or_default().round_dp(6)
}

/// One leg of a suggested trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub market_id: String,
    pub option_id: String,
    pub label: String,
    pub side: Side,
    pub qty: Decimal,
    /// Book price the plan was built against.
    pub reference_price: Decimal,
    /// Reference price shifted by the policy's slippage budget.
    pub limit_price: Decimal,
}

/// A rule-specific trade plan embedded in the signal payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradePlan {
    /// Planner tag, e.g. `dutch_book_basket` or `momentum_follow`.
    pub action: String,
    /// Operator-facing one-line rationale.
    pub rationale: String,
    pub legs: Vec<TradeLeg>,
    pub estimated_edge_bps: Option<f64>,
    pub confidence: Option<f64>,
}

/// Top-of-book state of one option at emission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEntry {
    pub option_id: String,
    pub label: String,
    pub price: f64,
    pub best_bid: f64,
    pub best_ask: f64,
    pub liquidity: f64,
    pub ts: Option<DateTime<Utc>>,
}

/// Known, schema-pinned payload per rule type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type")]
pub enum RulePayload {
    #[serde(rename = "SUM_LT_1")]
    SumLtOne {
        sum: f64,
        gap: f64,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "SPIKE_DETECT")]
    Spike {
        option_id: String,
        delta: f64,
        window_secs: u64,
        samples: usize,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "ENDGAME_SWEEP")]
    Endgame {
        option_id: String,
        price: f64,
        z_score: f64,
        hours_to_end: f64,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "SYNONYM_MISPRICE")]
    SynonymMisprice {
        label: String,
        gap: f64,
        /// Lower-priced member of the pair.
        leader_market_id: String,
        /// Higher-priced member of the pair.
        laggard_market_id: String,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "DUTCH_BOOK_DETECT")]
    DutchBook {
        sum: f64,
        basket: Vec<String>,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "CROSS_MARKET_MISPRICE")]
    CrossMarket {
        label: String,
        gap: f64,
        buy_market_id: String,
        sell_market_id: String,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
    #[serde(rename = "TREND_BREAKOUT")]
    TrendBreakout {
        option_id: String,
        deviation: f64,
        window_mean: f64,
        last_price: f64,
        window_secs: u64,
        book_snapshot: Vec<BookEntry>,
        suggested_trade: TradePlan,
    },
}

/// Signal payload: a known tagged shape, or a raw bag from a newer emitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalPayload {
    Known(RulePayload),
    Other(serde_json::Value),
}

impl SignalPayload {
    /// Rule type tag, when the shape is known or the bag carries one.
    pub fn rule_type(&self) -> Option<&str> {
        match self {
            Self::Known(payload) => Some(match payload {
                RulePayload::SumLtOne { .. } => "SUM_LT_1",
                RulePayload::Spike { .. } => "SPIKE_DETECT",
                RulePayload::Endgame { .. } => "ENDGAME_SWEEP",
                RulePayload::SynonymMisprice { .. } => "SYNONYM_MISPRICE",
                RulePayload::DutchBook { .. } => "DUTCH_BOOK_DETECT",
                RulePayload::CrossMarket { .. } => "CROSS_MARKET_MISPRICE",
                RulePayload::TrendBreakout { .. } => "TREND_BREAKOUT",
            }),
            Self::Other(value) => value.get("rule_type").and_then(|v| v.as_str()),
        }
    }

    /// The embedded trade plan, when present.
    pub fn suggested_trade(&self) -> Option<TradePlan> {
        match self {
            Self::Known(payload) => Some(match payload {
                RulePayload::SumLtOne { suggested_trade, .. }
                | RulePayload::Spike { suggested_trade, .. }
                | RulePayload::Endgame { suggested_trade, .. }
                | RulePayload::SynonymMisprice { suggested_trade, .. }
                | RulePayload::DutchBook { suggested_trade, .. }
                | RulePayload::CrossMarket { suggested_trade, .. }
                | RulePayload::TrendBreakout { suggested_trade, .. } => suggested_trade.clone(),
            }),
            Self::Other(value) => value
                .get("suggested_trade")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok()),
        }
    }

    /// The book snapshot captured at emission time, when present.
    pub fn book_snapshot(&self) -> Vec<BookEntry> {
        match self {
            Self::Known(payload) => match payload {
                RulePayload::SumLtOne { book_snapshot, .. }
                | RulePayload::Spike { book_snapshot, .. }
                | RulePayload::Endgame { book_snapshot, .. }
                | RulePayload::SynonymMisprice { book_snapshot, .. }
                | RulePayload::DutchBook { book_snapshot, .. }
                | RulePayload::CrossMarket { book_snapshot, .. }
                | RulePayload::TrendBreakout { book_snapshot, .. } => book_snapshot.clone(),
            },
            Self::Other(value) => value
                .get("book_snapshot")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default(),
        }
    }
}

/// A signal as stored, keyed by its generated id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: i64,
    pub market_id: String,
    pub option_id: Option<String>,
    pub rule_id: i64,
    pub level: SignalLevel,
    /// Declarative base+weights composite in [0, 100] (back-compat rank).
    pub score: f64,
    /// Normalized opportunity magnitude in [0, 1]; the primary rank key.
    pub edge_score: f64,
    pub reason: String,
    pub payload: SignalPayload,
    pub created_at: DateTime<Utc>,
}

/// A signal before insertion (ids and timestamps are store-assigned).
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub market_id: String,
    pub option_id: Option<String>,
    pub rule_id: i64,
    pub level: SignalLevel,
    pub score: f64,
    pub edge_score: f64,
    pub reason: String,
    pub payload: SignalPayload,
}

/// Clamp a raw edge magnitude into the normalized [0, 1] band.
pub fn clamp_edge(raw: f64) -> f64 {
    raw.clamp(0.0, 1.0)
}
