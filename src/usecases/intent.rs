//! Intent Pipeline - Suggest → Confirm State Machine
//!
//! The operator-facing path: `create_intent` reads a signal and persists a
//! `suggested` intent carrying a synthesized trade plan; `confirm_intent`
//! runs the risk gauntlet and drives the legal transitions. Terminal
//! intents are immutable; confirming one is a no-op that returns the
//! terminal state. Transitions are serialized by a compare-and-set on
//! `status`, so racing confirms observe exactly one winner.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::store::{NewIntent, SqliteStore};
use crate::domain::intent::{IntentDetail, IntentStatus, OrderIntent, RiskReport};
use crate::domain::signal::{Side, SignalLevel};

use super::breaker::CircuitBreakerTable;
use super::planner::{self, PlanOverrides};
use super::risk;

/// Typed failures on the intent operations.
///
/// Capacity rejections are NOT errors: they come back as an intent in the
/// terminal `rejected` state with structured reasons.
#[derive(Debug, Error)]
pub enum IntentError {
    #[error("signal {0} not found")]
    SignalNotFound(i64),

    #[error("signal {signal_id} expired {age_secs}s ago")]
    SignalExpired { signal_id: i64, age_secs: i64 },

    #[error("signal level {0} is not actionable")]
    LevelTooLow(SignalLevel),

    #[error("market {0} has no stored depth")]
    NoMarketDepth(String),

    #[error("intent {0} not found")]
    IntentNotFound(i64),

    #[error("no enabled execution policy")]
    NoPolicy,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// An operator request to synthesize an intent from a signal.
#[derive(Debug, Clone, Default)]
pub struct IntentRequest {
    pub signal_id: i64,
    pub side: Option<Side>,
    pub qty: Option<Decimal>,
    pub limit_price: Option<Decimal>,
    pub ttl_secs: Option<i64>,
}

/// The suggest/confirm pipeline.
pub struct IntentPipeline {
    store: Arc<SqliteStore>,
    breakers: Arc<CircuitBreakerTable>,
    metrics: Arc<MetricsRegistry>,
    /// Synthetic auto-fill on confirmation (mock data source).
    mock_fill: bool,
    default_ttl_secs: i64,
    /// Signals older than this cannot seed new intents.
    signal_max_age_secs: i64,
}

impl IntentPipeline {
    pub fn new(
        store: Arc<SqliteStore>,
        breakers: Arc<CircuitBreakerTable>,
        metrics: Arc<MetricsRegistry>,
        mock_fill: bool,
        default_ttl_secs: i64,
    ) -> Self {
        Self {
            store,
            breakers,
            metrics,
            mock_fill,
            default_ttl_secs,
            signal_max_age_secs: 60,
        }
    }

    /// Synthesize and persist a `suggested` intent from a signal.
    ///
    /// Every call creates a fresh intent: intents are per-request, not
    /// per-signal.
    pub async fn create_intent(&self, request: IntentRequest) -> Result<OrderIntent, IntentError> {
        let signal = self
            .store
            .get_signal(request.signal_id)
            .await?
            .ok_or(IntentError::SignalNotFound(request.signal_id))?;

        let age_secs = (Utc::now() - signal.created_at).num_seconds();
        if age_secs > self.signal_max_age_secs {
            return Err(IntentError::SignalExpired {
                signal_id: signal.signal_id,
                age_secs,
            });
        }
        if !signal.level.is_actionable() {
            return Err(IntentError::LevelTooLow(signal.level));
        }

        let latest = self.store.latest_ticks_by_market(&signal.market_id).await?;
        if latest.is_empty() {
            return Err(IntentError::NoMarketDepth(signal.market_id.clone()));
        }
        let policy = self
            .store
            .active_policy()
            .await?
            .ok_or(IntentError::NoPolicy)?;

        let overrides = PlanOverrides {
            side: request.side,
            qty: request.qty,
            limit_price: request.limit_price,
        };
        let plan = planner::build_plan(&signal, &latest, &policy, &overrides);
        let primary = plan.legs.first().cloned();

        let detail = IntentDetail {
            plan,
            signal_level: signal.level,
            rule_type: signal.payload.rule_type().map(str::to_owned),
            edge_score: Some(signal.edge_score),
            payload_snapshot: serde_json::to_value(&signal.payload)
                .map_err(anyhow::Error::from)?,
            checks: None,
        };

        let intent = self
            .store
            .create_intent(&NewIntent {
                signal_id: signal.signal_id,
                market_id: signal.market_id.clone(),
                option_id: primary.as_ref().map(|leg| leg.option_id.clone()),
                side: primary.as_ref().map(|leg| leg.side).unwrap_or(Side::Buy),
                qty: primary.as_ref().map(|leg| leg.qty).unwrap_or(Decimal::ONE),
                limit_price: primary.as_ref().map(|leg| leg.limit_price),
                ttl_secs: request.ttl_secs.unwrap_or(self.default_ttl_secs),
                policy_id: policy.policy_id,
                detail,
            })
            .await?;

        self.metrics
            .order_intents_total
            .with_label_values(&["suggested"])
            .inc();
        self.store
            .insert_audit(
                "intent_pipeline",
                "intent_suggested",
                Some(&intent.intent_id.to_string()),
                None,
                serde_json::json!({
                    "signal_id": signal.signal_id,
                    "market_id": intent.market_id,
                }),
            )
            .await?;
        info!(
            intent_id = intent.intent_id,
            signal_id = signal.signal_id,
            market_id = %intent.market_id,
            "Intent suggested"
        );
        Ok(intent)
    }

    /// Confirm a suggested intent through the risk gauntlet.
    pub async fn confirm_intent(&self, intent_id: i64) -> Result<OrderIntent, IntentError> {
        let intent = self
            .store
            .get_intent(intent_id)
            .await?
            .ok_or(IntentError::IntentNotFound(intent_id))?;

        // Terminal intents are immutable; return them unchanged.
        if intent.status.is_terminal() {
            return Ok(intent);
        }
        // An in-flight `sent` intent has nothing left to confirm.
        if intent.status == IntentStatus::Sent {
            return Ok(intent);
        }

        // TTL gate.
        if intent.is_expired_at(Utc::now()) {
            return self
                .finish(&intent, IntentStatus::Expired, None, None, "intent_expired")
                .await;
        }

        let policy = match self.store.get_policy(intent.policy_id).await? {
            Some(policy) => policy,
            None => self
                .store
                .active_policy()
                .await?
                .ok_or(IntentError::NoPolicy)?,
        };
        let rule_id = self
            .store
            .get_signal(intent.signal_id)
            .await?
            .map(|signal| signal.rule_id);

        let report =
            risk::run_gauntlet(&self.store, &self.breakers, &intent, &policy, rule_id).await?;
        let mut detail = intent.detail.clone();
        detail.checks = Some(report.clone());

        if !report.approved {
            return self
                .finish(
                    &intent,
                    IntentStatus::Rejected,
                    Some(&detail),
                    None,
                    "intent_rejected",
                )
                .await;
        }

        // Approved: suggested → sent, then a synthetic fill in mock mode.
        let sent = self
            .finish(&intent, IntentStatus::Sent, Some(&detail), None, "intent_sent")
            .await?;
        if sent.status != IntentStatus::Sent {
            // Lost the CAS race; the stored state is authoritative.
            return Ok(sent);
        }

        if self.mock_fill {
            let fill_price = sent
                .detail
                .plan
                .legs
                .first()
                .map(|leg| leg.reference_price)
                .or(sent.limit_price);
            return self
                .finish(&sent, IntentStatus::Filled, None, fill_price, "intent_filled")
                .await;
        }
        Ok(sent)
    }

    /// Apply one CAS transition, then audit and count it. A lost race
    /// returns the stored state untouched.
    async fn finish(
        &self,
        intent: &OrderIntent,
        to: IntentStatus,
        detail: Option<&IntentDetail>,
        fill_price: Option<Decimal>,
        action: &str,
    ) -> Result<OrderIntent, IntentError> {
        let won = self
            .store
            .transition_intent(intent.intent_id, intent.status, to, detail, fill_price)
            .await?;

        let stored = self
            .store
            .get_intent(intent.intent_id)
            .await?
            .ok_or(IntentError::IntentNotFound(intent.intent_id))?;
        if !won {
            return Ok(stored);
        }

        let status_label = to.to_string();
        self.metrics
            .order_intents_total
            .with_label_values(&[status_label.as_str()])
            .inc();
        let reasons = detail
            .and_then(|d| d.checks.as_ref())
            .map(|checks: &RiskReport| checks.reasons.clone())
            .unwrap_or_default();
        self.store
            .insert_audit(
                "intent_pipeline",
                action,
                Some(&intent.intent_id.to_string()),
                None,
                serde_json::json!({
                    "market_id": intent.market_id,
                    "from": intent.status.to_string(),
                    "to": to.to_string(),
                    "reasons": reasons,
                }),
            )
            .await?;
        info!(
            intent_id = intent.intent_id,
            from = %intent.status,
            to = %to,
            "Intent transition"
        );
        Ok(stored)
    }
}
