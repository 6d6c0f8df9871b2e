//! Rule-type-specific trade planners.
//!
//! `create_intent` turns a signal into a concrete plan: start from the
//! plan the rule embedded at emission time, refresh reference prices from
//! the current book, and re-clamp every limit inside the policy's
//! slippage budget so confirmation is not rejected by its own guardrail.
//! Rule types with special execution shapes override the generic path.

use std::collections::HashMap;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::intent::ExecutionPolicy;
use crate::domain::market::Tick;
use crate::domain::signal::{price_dec, Side, Signal, TradeLeg, TradePlan};

/// Operator-supplied overrides for the primary leg.
#[derive(Debug, Clone, Default)]
pub struct PlanOverrides {
    pub side: Option<Side>,
    pub qty: Option<Decimal>,
    pub limit_price: Option<Decimal>,
}

/// Build the executable plan for a signal.
pub fn build_plan(
    signal: &Signal,
    latest: &HashMap<String, Tick>,
    policy: &ExecutionPolicy,
    overrides: &PlanOverrides,
) -> TradePlan {
    let rule_type = signal.payload.rule_type().map(str::to_owned);
    let mut plan = signal
        .payload
        .suggested_trade()
        .filter(|plan| !plan.legs.is_empty())
        .unwrap_or_else(|| fallback_plan(signal, latest));

    apply_overrides(&mut plan, overrides);

    match rule_type.as_deref() {
        Some("ENDGAME_SWEEP") => clamp_endgame(&mut plan, latest, policy),
        _ => clamp_generic(&mut plan, latest, policy),
    }
    plan
}

/// Signals without an embedded plan get a single leg on the top-priced
/// option: buy for P1, sell otherwise.
fn fallback_plan(signal: &Signal, latest: &HashMap<String, Tick>) -> TradePlan {
    let top = latest
        .iter()
        .max_by(|a, b| {
            a.1.price
                .partial_cmp(&b.1.price)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(option_id, tick)| (option_id.clone(), tick.price));

    let legs = match top {
        Some((option_id, price)) => {
            let side = if signal.level == crate::domain::signal::SignalLevel::P1 {
                Side::Buy
            } else {
                Side::Sell
            };
            let reference = price_dec(price);
            vec![TradeLeg {
                market_id: signal.market_id.clone(),
                option_id: option_id.clone(),
                label: option_id,
                side,
                qty: Decimal::ONE,
                reference_price: reference,
                limit_price: reference,
            }]
        }
        None => Vec::new(),
    };

    TradePlan {
        action: "manual_review".to_string(),
        rationale: signal.reason.clone(),
        legs,
        estimated_edge_bps: Some(signal.edge_score * 10_000.0),
        confidence: None,
    }
}

fn apply_overrides(plan: &mut TradePlan, overrides: &PlanOverrides) {
    let Some(primary) = plan.legs.first_mut() else {
        return;
    };
    if let Some(side) = overrides.side {
        primary.side = side;
    }
    if let Some(qty) = overrides.qty {
        primary.qty = qty;
    }
    if let Some(limit) = overrides.limit_price {
        primary.limit_price = limit;
    }
}

/// Refresh references from the live book and clamp limits inside the
/// slippage budget, side-aware.
fn clamp_generic(plan: &mut TradePlan, latest: &HashMap<String, Tick>, policy: &ExecutionPolicy) {
    let slip = Decimal::from(policy.slippage_bps) / dec!(10000);
    for leg in &mut plan.legs {
        if let Some(tick) = latest.get(&leg.option_id) {
            leg.reference_price = price_dec(tick.price);
        }
        let reference = leg.reference_price;
        if reference <= Decimal::ZERO {
            continue;
        }
        let ceiling = (reference * (Decimal::ONE + slip)).round_dp(6);
        let floor = (reference * (Decimal::ONE - slip)).round_dp(6);
        leg.limit_price = match leg.side {
            Side::Buy => leg.limit_price.min(ceiling).min(dec!(0.999)),
            Side::Sell => leg.limit_price.max(floor).max(dec!(0.001)),
        };
        if leg.limit_price <= Decimal::ZERO {
            leg.limit_price = reference;
        }
    }
}

/// Endgame sweeps execute as a single buy leg capped below certainty.
fn clamp_endgame(plan: &mut TradePlan, latest: &HashMap<String, Tick>, policy: &ExecutionPolicy) {
    plan.legs.truncate(1);
    if let Some(leg) = plan.legs.first_mut() {
        leg.side = Side::Buy;
        if let Some(tick) = latest.get(&leg.option_id) {
            leg.reference_price = price_dec(tick.price);
        }
        leg.limit_price = leg.reference_price.min(dec!(0.99));
    }
    clamp_generic(plan, latest, policy);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::intent::ExecutionMode;
    use crate::domain::signal::{BookEntry, RulePayload, SignalLevel, SignalPayload};
    use chrono::Utc;

    fn policy() -> ExecutionPolicy {
        ExecutionPolicy {
            policy_id: 1,
            name: "default".into(),
            mode: ExecutionMode::SemiAuto,
            max_notional_per_order: dec!(200),
            max_concurrent_orders: 2,
            max_daily_notional: dec!(1000),
            slippage_bps: 80,
            enabled: true,
        }
    }

    fn tick(option: &str, price: f64) -> (String, Tick) {
        (
            option.to_string(),
            Tick {
                ts: Utc::now(),
                market_id: "m1".into(),
                option_id: option.into(),
                price,
                volume: None,
                best_bid: Some(price - 0.01),
                best_ask: Some(price + 0.01),
                liquidity: Some(400.0),
            },
        )
    }

    fn plan_with_leg(side: Side, reference: Decimal, limit: Decimal) -> TradePlan {
        TradePlan {
            action: "momentum_follow".into(),
            rationale: "test".into(),
            legs: vec![TradeLeg {
                market_id: "m1".into(),
                option_id: "o1".into(),
                label: "Yes".into(),
                side,
                qty: Decimal::ONE,
                reference_price: reference,
                limit_price: limit,
            }],
            estimated_edge_bps: None,
            confidence: None,
        }
    }

    fn signal_with(payload: SignalPayload, level: SignalLevel) -> Signal {
        Signal {
            signal_id: 1,
            market_id: "m1".into(),
            option_id: Some("o1".into()),
            rule_id: 1,
            level,
            score: 70.0,
            edge_score: 0.05,
            reason: "test".into(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn generic_clamp_respects_slippage_budget() {
        let payload = SignalPayload::Known(RulePayload::Spike {
            option_id: "o1".into(),
            delta: 0.05,
            window_secs: 10,
            samples: 4,
            book_snapshot: Vec::<BookEntry>::new(),
            suggested_trade: plan_with_leg(Side::Buy, dec!(0.50), dec!(0.60)),
        });
        let signal = signal_with(payload, SignalLevel::P2);
        let latest: HashMap<String, Tick> = [tick("o1", 0.50)].into_iter().collect();

        let plan = build_plan(&signal, &latest, &policy(), &PlanOverrides::default());
        // 0.60 is clamped to 0.50 · 1.008 = 0.504.
        assert_eq!(plan.legs[0].limit_price, dec!(0.504));
    }

    #[test]
    fn endgame_forces_single_capped_buy_leg() {
        let mut base = plan_with_leg(Side::Sell, dec!(0.995), dec!(0.995));
        base.legs.push(base.legs[0].clone());
        let payload = SignalPayload::Known(RulePayload::Endgame {
            option_id: "o1".into(),
            price: 0.995,
            z_score: 2.0,
            hours_to_end: 0.4,
            book_snapshot: Vec::<BookEntry>::new(),
            suggested_trade: base,
        });
        let signal = signal_with(payload, SignalLevel::P1);
        let latest: HashMap<String, Tick> = [tick("o1", 0.995)].into_iter().collect();

        let plan = build_plan(&signal, &latest, &policy(), &PlanOverrides::default());
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].side, Side::Buy);
        assert!(plan.legs[0].limit_price <= dec!(0.99));
    }

    #[test]
    fn missing_plan_falls_back_to_top_option() {
        let signal = signal_with(
            SignalPayload::Other(serde_json::json!({"rule_type": "LEGACY"})),
            SignalLevel::P1,
        );
        let latest: HashMap<String, Tick> =
            [tick("o1", 0.40), tick("o2", 0.60)].into_iter().collect();

        let plan = build_plan(&signal, &latest, &policy(), &PlanOverrides::default());
        assert_eq!(plan.action, "manual_review");
        assert_eq!(plan.legs.len(), 1);
        assert_eq!(plan.legs[0].option_id, "o2");
        assert_eq!(plan.legs[0].side, Side::Buy);
    }

    #[test]
    fn overrides_take_precedence_on_primary_leg() {
        let payload = SignalPayload::Known(RulePayload::Spike {
            option_id: "o1".into(),
            delta: 0.05,
            window_secs: 10,
            samples: 4,
            book_snapshot: Vec::<BookEntry>::new(),
            suggested_trade: plan_with_leg(Side::Buy, dec!(0.50), dec!(0.50)),
        });
        let signal = signal_with(payload, SignalLevel::P2);
        let latest: HashMap<String, Tick> = [tick("o1", 0.50)].into_iter().collect();

        let overrides = PlanOverrides {
            side: Some(Side::Sell),
            qty: Some(dec!(25)),
            limit_price: None,
        };
        let plan = build_plan(&signal, &latest, &policy(), &overrides);
        assert_eq!(plan.legs[0].side, Side::Sell);
        assert_eq!(plan.legs[0].qty, dec!(25));
    }
}
