//! Core market-data domain types.
//!
//! Markets, their purchasable options, and time-stamped price ticks.
//! These types are the foundation of the hexagonal architecture's inner
//! ring: adapters translate venue payloads into them, and everything
//! downstream (rules, planners, risk) only ever sees these shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trading status of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketStatus {
    /// Accepting trades.
    Open,
    /// In its final window before resolution.
    Closing,
    /// Resolved or delisted.
    Closed,
}

impl MarketStatus {
    /// Parse the lowercase wire form, defaulting unknown values to `Open`.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "closing" => Self::Closing,
            "closed" => Self::Closed,
            _ => Self::Open,
        }
    }
}

impl std::fmt::Display for MarketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closing => write!(f, "closing"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// A prediction market tracked by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    /// Opaque upstream identifier.
    pub market_id: String,
    /// Human-readable question or title.
    pub title: String,
    /// Current trading status.
    pub status: MarketStatus,
    /// When trading opened, if known.
    pub starts_at: Option<DateTime<Utc>>,
    /// Scheduled resolution time, if known.
    pub ends_at: Option<DateTime<Utc>>,
    /// Venue-provided category tags.
    pub tags: Vec<String>,
    /// Reserved 384-dim title embedding (future synonym matching).
    pub embedding: Option<Vec<f32>>,
}

impl Market {
    /// Hours until scheduled close, floored at zero. `None` when open-ended.
    pub fn hours_to_end(&self, now: DateTime<Utc>) -> Option<f64> {
        self.ends_at
            .map(|ends| ((ends - now).num_seconds() as f64 / 3600.0).max(0.0))
    }
}

/// A purchasable outcome within a market.
///
/// For real venues the `option_id` equals the upstream CLOB token id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOption {
    pub option_id: String,
    pub market_id: String,
    /// Human label, e.g. "Yes" or a candidate name.
    pub label: String,
}

/// A time-stamped top-of-book observation for one option.
///
/// Append-only; the composite identity is `(ts, market_id, option_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub ts: DateTime<Utc>,
    pub market_id: String,
    pub option_id: String,
    pub price: f64,
    pub volume: Option<f64>,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub liquidity: Option<f64>,
}

impl Tick {
    /// The tuple the ingestion dedup rule compares.
    pub fn price_tuple(&self) -> (f64, f64, f64) {
        (
            self.price,
            self.best_bid.unwrap_or(0.0),
            self.best_ask.unwrap_or(0.0),
        )
    }

    /// Mid-price from top of book, falling back to the last price.
    pub fn mid(&self) -> f64 {
        match (self.best_bid, self.best_ask) {
            (Some(bid), Some(ask)) => (bid + ask) / 2.0,
            _ => self.price,
        }
    }
}
