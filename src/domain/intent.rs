//! Order-intent domain types and the intent state machine.
//!
//! An intent is an operator-initiated proposal to trade, distinct from an
//! executed order. Its status is authoritative over fund-like quantities,
//! so the legal transition set is encoded here and enforced at every
//! boundary that mutates it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::signal::{Side, SignalLevel, TradePlan};

/// Lifecycle status of an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    /// Synthesized from a signal, awaiting operator confirmation.
    Suggested,
    /// Confirmed and handed to the execution path.
    Sent,
    /// Executed (synthetic fill in mock mode, acknowledgement in live).
    Filled,
    /// Risk gauntlet rejected the confirmation.
    Rejected,
    /// TTL elapsed before confirmation.
    Expired,
}

impl IntentStatus {
    /// Terminal intents are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Rejected | Self::Expired)
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Legal paths: `suggested → sent → filled`, `suggested → rejected`,
    /// `suggested → expired`. Everything else is an invariant violation.
    pub fn can_transition_to(self, next: IntentStatus) -> bool {
        matches!(
            (self, next),
            (Self::Suggested, Self::Sent)
                | (Self::Suggested, Self::Rejected)
                | (Self::Suggested, Self::Expired)
                | (Self::Sent, Self::Filled)
        )
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Suggested => write!(f, "suggested"),
            Self::Sent => write!(f, "sent"),
            Self::Filled => write!(f, "filled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for IntentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "suggested" => Ok(Self::Suggested),
            "sent" => Ok(Self::Sent),
            "filled" => Ok(Self::Filled),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown intent status: {other}")),
        }
    }
}

/// Execution mode of the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Operator confirms every intent (default).
    SemiAuto,
    /// Intents are suggested only; confirmation is disabled.
    Manual,
    /// Reserved for unattended confirmation.
    Auto,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SemiAuto => write!(f, "semi_auto"),
            Self::Manual => write!(f, "manual"),
            Self::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "semi_auto" => Ok(Self::SemiAuto),
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Per-run risk parameters applied by the confirmation gauntlet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    pub policy_id: i64,
    pub name: String,
    pub mode: ExecutionMode,
    pub max_notional_per_order: Decimal,
    pub max_concurrent_orders: i64,
    pub max_daily_notional: Decimal,
    pub slippage_bps: u32,
    pub enabled: bool,
}

/// Outcome of the risk gauntlet, recorded under `detail.checks`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskReport {
    pub approved: bool,
    pub reasons: Vec<String>,
}

/// Structured intent detail: the plan plus the signal context it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDetail {
    pub plan: TradePlan,
    pub signal_level: SignalLevel,
    pub rule_type: Option<String>,
    pub edge_score: Option<f64>,
    /// Signal payload as it was at suggestion time.
    pub payload_snapshot: serde_json::Value,
    /// Populated by `confirm_intent`.
    #[serde(default)]
    pub checks: Option<RiskReport>,
}

/// An operator-facing order intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub intent_id: i64,
    pub signal_id: i64,
    pub market_id: String,
    pub option_id: Option<String>,
    pub side: Side,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub ttl_secs: i64,
    pub status: IntentStatus,
    pub policy_id: i64,
    pub detail: IntentDetail,
    /// Recorded on synthetic fills (equals the leg reference price).
    pub fill_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrderIntent {
    /// Whether the intent's TTL has elapsed.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.created_at + chrono::Duration::seconds(self.ttl_secs)
    }

    /// Committed notional of this intent: qty × limit (or reference) price.
    pub fn notional(&self) -> Decimal {
        let price = self
            .limit_price
            .or_else(|| self.detail.plan.legs.first().map(|l| l.reference_price))
            .unwrap_or_default();
        self.qty * price
    }
}
