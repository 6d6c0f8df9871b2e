//! The risk gauntlet.
//!
//! Confirmation-time checks run in a fixed order, accumulating every
//! failing reason rather than stopping at the first: notional cap,
//! per-market concurrency cap, daily cap, per-leg slippage guardrail, and
//! the rule-market circuit breaker. All notional comparisons are decimal;
//! binary floats never touch fund arithmetic.

use std::time::Instant;

use anyhow::Result;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::adapters::store::SqliteStore;
use crate::domain::intent::{ExecutionPolicy, OrderIntent, RiskReport};
use crate::domain::signal::{price_dec, Side, TradeLeg};

use super::breaker::CircuitBreakerTable;

pub const REASON_NOTIONAL: &str = "notional_cap_exceeded";
pub const REASON_CONCURRENCY: &str = "concurrency_cap_exceeded";
pub const REASON_DAILY: &str = "daily_cap_exceeded";
pub const REASON_SLIPPAGE: &str = "slippage_exceeded";
pub const REASON_STALE_BOOK: &str = "stale_book";
pub const REASON_BREAKER: &str = "breaker_open";

/// Total committed notional of a plan: Σ qty × reference price.
pub fn plan_notional(legs: &[TradeLeg]) -> Decimal {
    legs.iter()
        .map(|leg| leg.qty * leg.reference_price)
        .sum()
}

/// Run every check in order and return the accumulated report.
pub async fn run_gauntlet(
    store: &SqliteStore,
    breakers: &CircuitBreakerTable,
    intent: &OrderIntent,
    policy: &ExecutionPolicy,
    rule_id: Option<i64>,
) -> Result<RiskReport> {
    let mut reasons = Vec::new();
    let legs = &intent.detail.plan.legs;
    let notional = if legs.is_empty() {
        intent.notional()
    } else {
        plan_notional(legs)
    };

    // a. Per-order notional cap.
    if notional > policy.max_notional_per_order {
        reasons.push(REASON_NOTIONAL.to_string());
    }

    // b. Per-market concurrency cap (this intent counts as open).
    let open = store.open_intents_count(&intent.market_id).await?;
    if open > policy.max_concurrent_orders {
        reasons.push(REASON_CONCURRENCY.to_string());
    }

    // c. Daily cap over filled notional.
    let daily = store.daily_filled_notional().await?;
    if daily + notional > policy.max_daily_notional {
        reasons.push(REASON_DAILY.to_string());
    }

    // d. Per-leg slippage guardrail against the current book.
    let slippage_limit = Decimal::from(policy.slippage_bps);
    let check_legs: Vec<TradeLeg> = if legs.is_empty() {
        intent_leg_fallback(intent)
    } else {
        legs.clone()
    };
    for leg in &check_legs {
        let latest = store.latest_ticks_by_market(&leg.market_id).await?;
        let Some(tick) = latest.get(&leg.option_id) else {
            push_unique(&mut reasons, REASON_STALE_BOOK);
            continue;
        };
        let best = match leg.side {
            Side::Buy => tick.best_ask,
            Side::Sell => tick.best_bid,
        };
        let Some(best) = best.filter(|b| *b > 0.0) else {
            push_unique(&mut reasons, REASON_STALE_BOOK);
            continue;
        };
        let best = price_dec(best);
        let drift_bps = ((leg.limit_price - best).abs() / best) * dec!(10000);
        if drift_bps > slippage_limit {
            push_unique(&mut reasons, REASON_SLIPPAGE);
        }
    }

    // e. Rule-market circuit breaker.
    if let Some(rule_id) = rule_id {
        if breakers.is_open(rule_id, &intent.market_id, Instant::now()) {
            reasons.push(REASON_BREAKER.to_string());
        }
    }

    Ok(RiskReport {
        approved: reasons.is_empty(),
        reasons,
    })
}

/// A plan-less intent is checked through its own row fields.
fn intent_leg_fallback(intent: &OrderIntent) -> Vec<TradeLeg> {
    let Some(option_id) = intent.option_id.clone() else {
        return Vec::new();
    };
    let limit = intent.limit_price.unwrap_or_default();
    vec![TradeLeg {
        market_id: intent.market_id.clone(),
        option_id,
        label: String::new(),
        side: intent.side,
        qty: intent.qty,
        reference_price: limit,
        limit_price: limit,
    }]
}

fn push_unique(reasons: &mut Vec<String>, reason: &str) {
    if !reasons.iter().any(|r| r == reason) {
        reasons.push(reason.to_string());
    }
}
