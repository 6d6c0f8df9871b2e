//! Rule predicates.
//!
//! Pure functions from a per-market tick view (or a synonym-group slice of
//! views) to an optional firing. No I/O happens here; the engine builds
//! the views, runs the predicate, and handles everything downstream of a
//! firing (cooldowns, breakers, persistence, alerts).

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::domain::market::{Market, MarketOption, Tick};
use crate::domain::rule::RuleDoc;
use crate::domain::signal::{
    clamp_edge, price_dec, BookEntry, RulePayload, Side, SignalLevel, TradeLeg, TradePlan,
};

/// Everything the engine knows about one market at evaluation time.
pub struct MarketView {
    pub market: Market,
    pub options: Vec<MarketOption>,
    /// Latest tick per option id.
    pub latest: HashMap<String, Tick>,
    /// Rolling window, newest first.
    pub window: Vec<Tick>,
}

/// Evaluation-time context shared by every predicate.
pub struct EvalContext {
    pub now: DateTime<Utc>,
    /// Policy slippage budget used to pre-clamp plan limit prices.
    pub slippage_bps: u32,
}

/// A predicate that decided to fire.
pub struct Firing {
    pub market_id: String,
    pub option_id: Option<String>,
    /// Set when the rule computes its own severity (SUM_LT_1).
    pub level_override: Option<SignalLevel>,
    pub edge_score: f64,
    pub reason: String,
    /// Metric inputs for the declarative score.
    pub metrics: HashMap<&'static str, f64>,
    /// Gap folded into the daily KPI average.
    pub gap: Option<f64>,
    pub estimated_edge_bps: Option<f64>,
    pub payload: RulePayload,
}

impl MarketView {
    fn label_of(&self, option_id: &str) -> String {
        self.options
            .iter()
            .find(|opt| opt.option_id == option_id)
            .map(|opt| opt.label.clone())
            .unwrap_or_else(|| option_id.to_string())
    }

    /// Option ticks within the window, oldest first.
    fn option_window(&self, option_id: &str, window_secs: u64, now: DateTime<Utc>) -> Vec<&Tick> {
        let cutoff = now - Duration::seconds(window_secs as i64);
        let mut ticks: Vec<&Tick> = self
            .window
            .iter()
            .filter(|t| t.option_id == option_id && t.ts >= cutoff)
            .collect();
        ticks.reverse();
        ticks
    }

    /// Top-of-book snapshot of every option, sorted by label.
    pub fn book_snapshot(&self) -> Vec<BookEntry> {
        let mut snapshot: Vec<BookEntry> = self
            .latest
            .iter()
            .map(|(option_id, tick)| BookEntry {
                option_id: option_id.clone(),
                label: self.label_of(option_id),
                price: tick.price,
                best_bid: tick.best_bid.unwrap_or(0.0),
                best_ask: tick.best_ask.unwrap_or(0.0),
                liquidity: tick.liquidity.unwrap_or(0.0),
                ts: Some(tick.ts),
            })
            .collect();
        snapshot.sort_by(|a, b| a.label.cmp(&b.label));
        snapshot
    }

    /// Best-liquidity entry per lowercased label, for cross-market joins.
    /// Placeholder option ids of the form `<market_id>-<idx>` are skipped.
    fn labelled(&self) -> HashMap<String, LabelledOption> {
        let mut entries: HashMap<String, LabelledOption> = HashMap::new();
        for (option_id, tick) in &self.latest {
            if is_placeholder_option(&self.market.market_id, option_id) {
                continue;
            }
            let label = self.label_of(option_id);
            let entry = LabelledOption {
                market_id: self.market.market_id.clone(),
                market_title: self.market.title.clone(),
                option_id: option_id.clone(),
                label: label.clone(),
                price: tick.price,
                liquidity: tick.liquidity.unwrap_or(0.0),
            };
            entries
                .entry(label.to_lowercase())
                .and_modify(|existing| {
                    if entry.liquidity > existing.liquidity {
                        *existing = entry.clone();
                    }
                })
                .or_insert(entry);
        }
        entries
    }
}

/// One option aligned by label across a synonym group.
#[derive(Debug, Clone)]
struct LabelledOption {
    market_id: String,
    market_title: String,
    option_id: String,
    label: String,
    price: f64,
    liquidity: f64,
}

fn is_placeholder_option(market_id: &str, option_id: &str) -> bool {
    option_id
        .strip_prefix(market_id)
        .and_then(|rest| rest.strip_prefix('-'))
        .map(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false)
}

/// Build one plan leg, pre-clamping the limit by the slippage budget.
fn trade_leg(
    market_id: &str,
    option_id: &str,
    label: &str,
    side: Side,
    reference_price: f64,
    slippage_bps: u32,
) -> TradeLeg {
    let reference = price_dec(reference_price);
    let slip = Decimal::from(slippage_bps) / dec!(10000);
    let limit = match side {
        Side::Buy => (reference * (Decimal::ONE + slip)).min(dec!(0.999)),
        Side::Sell => (reference * (Decimal::ONE - slip)).max(dec!(0.001)),
    };
    TradeLeg {
        market_id: market_id.to_string(),
        option_id: option_id.to_string(),
        label: label.to_string(),
        side,
        qty: Decimal::ONE,
        reference_price: reference,
        limit_price: limit.round_dp(6),
    }
}

fn plan(
    action: &str,
    rationale: String,
    legs: Vec<TradeLeg>,
    estimated_edge_bps: Option<f64>,
) -> TradePlan {
    TradePlan {
        action: action.to_string(),
        rationale,
        legs,
        estimated_edge_bps,
        confidence: None,
    }
}

// ── SUM_LT_1 ────────────────────────────────────────────────

/// Within-market book arithmetic: Σ last prices across the outcome set
/// below `1 - min_gap` is a riskless basket.
pub fn sum_lt_one(doc: &RuleDoc, view: &MarketView, ctx: &EvalContext) -> Option<Firing> {
    let min_gap = doc.param_f64("min_gap", 0.01);
    if view.latest.len() < 2 {
        return None;
    }
    // An option without a tick would understate the sum.
    if !view.options.is_empty() && view.latest.len() < view.options.len() {
        return None;
    }

    let sum: f64 = view.latest.values().map(|t| t.price).sum();
    if sum >= 1.0 - min_gap {
        return None;
    }
    let gap = 1.0 - sum;
    let level = if gap > 0.03 {
        SignalLevel::P1
    } else {
        SignalLevel::P2
    };

    let legs: Vec<TradeLeg> = view
        .latest
        .iter()
        .map(|(option_id, tick)| {
            trade_leg(
                &view.market.market_id,
                option_id,
                &view.label_of(option_id),
                Side::Buy,
                tick.price,
                ctx.slippage_bps,
            )
        })
        .collect();
    let leg_count = legs.len();
    let suggested_trade = plan(
        "sum_basket",
        format!(
            "Buy all {leg_count} outcomes at sum={sum:.3} for {:.2}% edge",
            gap * 100.0
        ),
        legs,
        Some(gap * 10_000.0),
    );

    Some(Firing {
        market_id: view.market.market_id.clone(),
        option_id: None,
        level_override: Some(level),
        edge_score: clamp_edge(gap),
        reason: format!("sum={sum:.3} below 1 by {:.2}%", gap * 100.0),
        metrics: HashMap::from([("gap", gap * 100.0), ("legs", leg_count as f64)]),
        gap: Some(gap),
        estimated_edge_bps: Some(gap * 10_000.0),
        payload: RulePayload::SumLtOne {
            sum,
            gap,
            book_snapshot: view.book_snapshot(),
            suggested_trade,
        },
    })
}

// ── SPIKE_DETECT ────────────────────────────────────────────

/// Absolute price move within a sliding window, gated on liquidity.
/// Among qualifying options the largest |Δ| wins.
pub fn spike(doc: &RuleDoc, view: &MarketView, ctx: &EvalContext) -> Option<Firing> {
    let window_secs = doc.param_u64("window_secs", 10);
    let threshold = doc.param_f64("threshold", 0.03);
    let min_liquidity = doc.param_f64("min_liquidity", 0.0);

    let mut best: Option<(String, f64, usize)> = None;
    for option_id in view.latest.keys() {
        let ticks = view.option_window(option_id, window_secs, ctx.now);
        if ticks.len() < 2 {
            continue;
        }
        let open = ticks.first().map(|t| t.price).unwrap_or(0.0);
        let last = ticks.last().map(|t| t.price).unwrap_or(0.0);
        let delta = last - open;
        let liquidity = view
            .latest
            .get(option_id)
            .and_then(|t| t.liquidity)
            .unwrap_or(0.0);
        if delta.abs() > threshold && liquidity >= min_liquidity {
            let better = best
                .as_ref()
                .map(|(_, d, _)| delta.abs() > d.abs())
                .unwrap_or(true);
            if better {
                best = Some((option_id.clone(), delta, ticks.len()));
            }
        }
    }

    let (option_id, delta, samples) = best?;
    let label = view.label_of(&option_id);
    let latest = view.latest.get(&option_id)?;
    let direction = if delta > 0.0 { "up" } else { "down" };
    let side = if delta > 0.0 { Side::Buy } else { Side::Sell };
    let action = if delta > 0.0 {
        "momentum_follow"
    } else {
        "mean_revert"
    };

    let suggested_trade = plan(
        action,
        format!(
            "{label} moved {:+.2}pts over {window_secs}s ({direction})",
            delta * 100.0
        ),
        vec![trade_leg(
            &view.market.market_id,
            &option_id,
            &label,
            side,
            latest.price,
            ctx.slippage_bps,
        )],
        Some(delta.abs() * 10_000.0),
    );

    Some(Firing {
        market_id: view.market.market_id.clone(),
        option_id: Some(option_id.clone()),
        level_override: None,
        edge_score: clamp_edge(delta.abs()),
        reason: format!("{label} {direction} {:.2}pts/{window_secs}s", delta.abs() * 100.0),
        metrics: HashMap::from([
            ("velocity", delta.abs() * 100.0),
            ("liquidity", latest.liquidity.unwrap_or(0.0) / 10.0),
        ]),
        gap: Some(delta.abs()),
        estimated_edge_bps: Some(delta.abs() * 10_000.0),
        payload: RulePayload::Spike {
            option_id,
            delta,
            window_secs,
            samples,
            book_snapshot: view.book_snapshot(),
            suggested_trade,
        },
    })
}

// ── ENDGAME_SWEEP ───────────────────────────────────────────

/// Near-expiry markets where a high-priced option sees a volume surge:
/// price ≥ `price_hi` and volume z-score ≥ `z_hi`.
pub fn endgame(doc: &RuleDoc, view: &MarketView, ctx: &EvalContext) -> Option<Firing> {
    let ends_within_hours = doc.param_f64("ends_within_hours", 24.0);
    let price_hi = doc.param_f64("price_hi", 0.95);
    let z_hi = doc.param_f64("z_hi", 1.0);
    let min_sigma = doc.param_f64("min_sigma", 1.0);
    let min_liquidity = doc.param_f64("min_liquidity", 0.0);
    let window_secs = doc.param_u64("window_secs", 120);

    let hours_to_end = view.market.hours_to_end(ctx.now)?;
    if hours_to_end > ends_within_hours {
        return None;
    }

    for (option_id, latest) in &view.latest {
        if latest.price < price_hi || latest.liquidity.unwrap_or(0.0) < min_liquidity {
            continue;
        }
        let ticks = view.option_window(option_id, window_secs, ctx.now);
        let volumes: Vec<f64> = ticks.iter().filter_map(|t| t.volume).collect();
        if volumes.len() < 3 {
            continue;
        }
        let last_vol = *volumes.last().unwrap_or(&0.0);
        let mean = volumes.iter().sum::<f64>() / volumes.len() as f64;
        let variance = volumes
            .iter()
            .map(|v| (v - mean).powi(2))
            .sum::<f64>()
            / (volumes.len() - 1) as f64;
        let sigma = variance.sqrt().max(min_sigma);
        let z = (last_vol - mean) / sigma;
        if z < z_hi {
            continue;
        }

        let label = view.label_of(option_id);
        let edge = clamp_edge((latest.price - price_hi) + 0.1 * z);
        let suggested_trade = plan(
            "endgame_sweep",
            format!(
                "Buy {label} at {:.2} with {hours_to_end:.1}h to expiry (z={z:.2})",
                latest.price
            ),
            vec![trade_leg(
                &view.market.market_id,
                option_id,
                &label,
                Side::Buy,
                latest.price,
                ctx.slippage_bps,
            )],
            Some((latest.price - price_hi).max(0.0) * 10_000.0),
        );

        return Some(Firing {
            market_id: view.market.market_id.clone(),
            option_id: Some(option_id.clone()),
            level_override: None,
            edge_score: edge,
            reason: format!(
                "{label} at {:.2} with {hours_to_end:.1}h left, volume z={z:.2}",
                latest.price
            ),
            metrics: HashMap::from([
                ("vol_surge", z * 10.0),
                ("liquidity", latest.liquidity.unwrap_or(0.0) / 10.0),
                ("time_to_end", (ends_within_hours - hours_to_end).max(0.0)),
            ]),
            gap: Some((latest.price - price_hi).max(0.0)),
            estimated_edge_bps: Some((latest.price - price_hi).max(0.0) * 10_000.0),
            payload: RulePayload::Endgame {
                option_id: option_id.clone(),
                price: latest.price,
                z_score: z,
                hours_to_end,
                book_snapshot: view.book_snapshot(),
                suggested_trade,
            },
        });
    }
    None
}

// ── TREND_BREAKOUT ──────────────────────────────────────────

/// Deviation of the last price from its rolling mean, relative to the
/// mean floored at ε.
pub fn trend_breakout(doc: &RuleDoc, view: &MarketView, ctx: &EvalContext) -> Option<Firing> {
    let window_secs = doc.param_u64("window_secs", 120);
    let threshold = doc.param_f64("threshold", 0.05);
    let epsilon = doc.param_f64("epsilon", 0.01);

    let mut best: Option<(String, f64, f64, f64)> = None;
    for option_id in view.latest.keys() {
        let ticks = view.option_window(option_id, window_secs, ctx.now);
        if ticks.len() < 3 {
            continue;
        }
        let mean = ticks.iter().map(|t| t.price).sum::<f64>() / ticks.len() as f64;
        let last = ticks.last().map(|t| t.price).unwrap_or(0.0);
        let deviation = (last - mean).abs() / mean.max(epsilon);
        if deviation > threshold {
            let better = best
                .as_ref()
                .map(|(_, d, _, _)| deviation > *d)
                .unwrap_or(true);
            if better {
                best = Some((option_id.clone(), deviation, mean, last));
            }
        }
    }

    let (option_id, deviation, window_mean, last_price) = best?;
    let label = view.label_of(&option_id);
    let side = if last_price > window_mean {
        Side::Buy
    } else {
        Side::Sell
    };
    let suggested_trade = plan(
        "breakout_follow",
        format!(
            "{label} broke {:.1}% away from its {window_secs}s mean {window_mean:.3}",
            deviation * 100.0
        ),
        vec![trade_leg(
            &view.market.market_id,
            &option_id,
            &label,
            side,
            last_price,
            ctx.slippage_bps,
        )],
        Some(deviation * 10_000.0),
    );

    Some(Firing {
        market_id: view.market.market_id.clone(),
        option_id: Some(option_id.clone()),
        level_override: None,
        edge_score: clamp_edge(deviation),
        reason: format!(
            "{label} deviates {:.2}% from rolling mean {window_mean:.3}",
            deviation * 100.0
        ),
        metrics: HashMap::from([("deviation", deviation * 100.0)]),
        gap: Some(deviation),
        estimated_edge_bps: Some(deviation * 10_000.0),
        payload: RulePayload::TrendBreakout {
            option_id,
            deviation,
            window_mean,
            last_price,
            window_secs,
            book_snapshot: view.book_snapshot(),
            suggested_trade,
        },
    })
}

// ── DUTCH_BOOK_DETECT ───────────────────────────────────────

/// Basket sum check: a declared basket (params) or the full outcome set
/// of the market, priced below `sum_threshold`.
pub fn dutch_book(doc: &RuleDoc, view: &MarketView, ctx: &EvalContext) -> Option<Firing> {
    let sum_threshold = doc.param_f64("sum_threshold", 0.995);
    let min_liquidity = doc.param_f64("min_liquidity", 0.0);
    let declared = doc.param_str_list("basket");

    let basket: Vec<(&String, &Tick)> = if declared.is_empty() {
        view.latest.iter().collect()
    } else {
        view.latest
            .iter()
            .filter(|(option_id, _)| declared.iter().any(|d| d == *option_id))
            .collect()
    };
    if basket.len() < 2 {
        return None;
    }
    if !declared.is_empty() && basket.len() < declared.len() {
        return None;
    }

    let sum: f64 = basket.iter().map(|(_, t)| t.price).sum();
    let floor_liquidity = basket
        .iter()
        .map(|(_, t)| t.liquidity.unwrap_or(0.0))
        .fold(f64::INFINITY, f64::min);
    if sum >= sum_threshold || floor_liquidity < min_liquidity {
        return None;
    }

    let edge = clamp_edge(1.0 - sum);
    let basket_ids: Vec<String> = basket.iter().map(|(id, _)| (*id).clone()).collect();
    let legs: Vec<TradeLeg> = basket
        .iter()
        .map(|(option_id, tick)| {
            trade_leg(
                &view.market.market_id,
                option_id,
                &view.label_of(option_id),
                Side::Buy,
                tick.price,
                ctx.slippage_bps,
            )
        })
        .collect();
    let suggested_trade = plan(
        "dutch_book_basket",
        format!(
            "Allocate across {} legs to capture {:.2}% Dutch edge",
            legs.len(),
            edge * 100.0
        ),
        legs,
        Some((1.0 - sum) * 10_000.0),
    );

    Some(Firing {
        market_id: view.market.market_id.clone(),
        option_id: None,
        level_override: None,
        edge_score: edge,
        reason: format!("Dutch edge {:.2}% (sum={sum:.3})", edge * 100.0),
        metrics: HashMap::from([
            ("edge", edge * 100.0),
            ("liquidity", floor_liquidity / 10.0),
        ]),
        gap: Some(1.0 - sum),
        estimated_edge_bps: Some((1.0 - sum) * 10_000.0),
        payload: RulePayload::DutchBook {
            sum,
            basket: basket_ids,
            book_snapshot: view.book_snapshot(),
            suggested_trade,
        },
    })
}

// ── Synonym-group rules ─────────────────────────────────────

/// SYNONYM_MISPRICE: the widest label-aligned price gap inside a group.
/// The leader is the lower-priced member; the plan takes the cheap side.
pub fn synonym_misprice(
    doc: &RuleDoc,
    group: &[&MarketView],
    ctx: &EvalContext,
) -> Option<(String, Firing)> {
    let threshold = doc.param_f64("threshold", 0.025);
    let best = widest_label_gap(group, 0.0)?;
    if best.gap <= threshold {
        return None;
    }

    let (leader, laggard) = (&best.low, &best.high);
    let label = leader.label.clone();
    let suggested_trade = plan(
        "synonym_rebalance",
        format!(
            "Buy {label} on {} ({:.3}) against {} ({:.3}), gap {:.2}%",
            leader.market_title,
            leader.price,
            laggard.market_title,
            laggard.price,
            best.gap * 100.0
        ),
        vec![trade_leg(
            &leader.market_id,
            &leader.option_id,
            &label,
            Side::Buy,
            leader.price,
            ctx.slippage_bps,
        )],
        Some(best.gap * 10_000.0),
    );

    let laggard_view = group
        .iter()
        .find(|v| v.market.market_id == laggard.market_id)?;
    let firing = Firing {
        market_id: laggard.market_id.clone(),
        option_id: Some(laggard.option_id.clone()),
        level_override: None,
        edge_score: clamp_edge(best.gap),
        reason: format!(
            "{label} priced {:.3} vs {:.3} across synonymous markets",
            laggard.price, leader.price
        ),
        metrics: HashMap::from([
            ("gap", best.gap * 100.0),
            ("liquidity", best.floor_liquidity / 10.0),
        ]),
        gap: Some(best.gap),
        estimated_edge_bps: Some(best.gap * 10_000.0),
        payload: RulePayload::SynonymMisprice {
            label,
            gap: best.gap,
            leader_market_id: leader.market_id.clone(),
            laggard_market_id: laggard.market_id.clone(),
            book_snapshot: laggard_view.book_snapshot(),
            suggested_trade,
        },
    };
    Some((laggard.market_id.clone(), firing))
}

/// CROSS_MARKET_MISPRICE: label-identical options priced apart beyond the
/// threshold, emitted with a two-leg plan (buy cheap, sell rich).
pub fn cross_market_misprice(
    doc: &RuleDoc,
    group: &[&MarketView],
    ctx: &EvalContext,
) -> Option<(String, Firing)> {
    let threshold = doc.param_f64("threshold", 0.05);
    let min_liquidity = doc.param_f64("min_liquidity", 0.0);
    let best = widest_label_gap(group, min_liquidity)?;
    if best.gap <= threshold {
        return None;
    }

    let (buy, sell) = (&best.low, &best.high);
    let label = buy.label.clone();
    let suggested_trade = plan(
        "cross_market_pair",
        format!(
            "Buy {} ({}) {label} and sell {} ({}) {label}, gap {:.2}%",
            buy.market_title,
            buy.market_id,
            sell.market_title,
            sell.market_id,
            best.gap * 100.0
        ),
        vec![
            trade_leg(
                &buy.market_id,
                &buy.option_id,
                &label,
                Side::Buy,
                buy.price,
                ctx.slippage_bps,
            ),
            trade_leg(
                &sell.market_id,
                &sell.option_id,
                &label,
                Side::Sell,
                sell.price,
                ctx.slippage_bps,
            ),
        ],
        Some(best.gap * 10_000.0),
    );

    let buy_view = group
        .iter()
        .find(|v| v.market.market_id == buy.market_id)?;
    let firing = Firing {
        market_id: buy.market_id.clone(),
        option_id: Some(buy.option_id.clone()),
        level_override: None,
        edge_score: clamp_edge(best.gap),
        reason: format!(
            "{label} misprice {:.2}% ({} vs {})",
            best.gap * 100.0,
            buy.market_title,
            sell.market_title
        ),
        metrics: HashMap::from([
            ("gap", best.gap * 100.0),
            ("liquidity", best.floor_liquidity / 10.0),
        ]),
        gap: Some(best.gap),
        estimated_edge_bps: Some(best.gap * 10_000.0),
        payload: RulePayload::CrossMarket {
            label,
            gap: best.gap,
            buy_market_id: buy.market_id.clone(),
            sell_market_id: sell.market_id.clone(),
            book_snapshot: buy_view.book_snapshot(),
            suggested_trade,
        },
    };
    Some((buy.market_id.clone(), firing))
}

struct LabelGap {
    gap: f64,
    /// Lower-priced side.
    low: LabelledOption,
    /// Higher-priced side.
    high: LabelledOption,
    floor_liquidity: f64,
}

/// The widest |p_i - p_j| over label-aligned options across the group.
fn widest_label_gap(group: &[&MarketView], min_liquidity: f64) -> Option<LabelGap> {
    let labelled: Vec<HashMap<String, LabelledOption>> =
        group.iter().map(|view| view.labelled()).collect();

    let mut best: Option<LabelGap> = None;
    for i in 0..labelled.len() {
        for j in (i + 1)..labelled.len() {
            for (label_key, a) in &labelled[i] {
                let Some(b) = labelled[j].get(label_key) else {
                    continue;
                };
                let floor_liquidity = a.liquidity.min(b.liquidity);
                if floor_liquidity < min_liquidity {
                    continue;
                }
                let gap = (a.price - b.price).abs();
                let (low, high) = if a.price <= b.price {
                    (a.clone(), b.clone())
                } else {
                    (b.clone(), a.clone())
                };
                if best.as_ref().map(|c| gap > c.gap).unwrap_or(true) {
                    best = Some(LabelGap {
                        gap,
                        low,
                        high,
                        floor_liquidity,
                    });
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::MarketStatus;

    fn doc(yaml: &str) -> RuleDoc {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn ctx() -> EvalContext {
        EvalContext {
            now: Utc::now(),
            slippage_bps: 80,
        }
    }

    fn market(id: &str, ends_in_hours: Option<i64>) -> Market {
        Market {
            market_id: id.into(),
            title: format!("Market {id}"),
            status: MarketStatus::Open,
            starts_at: None,
            ends_at: ends_in_hours.map(|h| Utc::now() + Duration::hours(h)),
            tags: vec![],
            embedding: None,
        }
    }

    fn tick(option: &str, price: f64, age_secs: i64) -> Tick {
        Tick {
            ts: Utc::now() - Duration::seconds(age_secs),
            market_id: "m1".into(),
            option_id: option.into(),
            price,
            volume: Some(100.0),
            best_bid: Some(price - 0.01),
            best_ask: Some(price + 0.01),
            liquidity: Some(400.0),
        }
    }

    fn view(market_id: &str, options: &[(&str, &str)], latest: Vec<Tick>, window: Vec<Tick>) -> MarketView {
        MarketView {
            market: market(market_id, Some(48)),
            options: options
                .iter()
                .map(|(id, label)| MarketOption {
                    option_id: id.to_string(),
                    market_id: market_id.to_string(),
                    label: label.to_string(),
                })
                .collect(),
            latest: latest
                .into_iter()
                .map(|t| (t.option_id.clone(), t))
                .collect(),
            window,
        }
    }

    #[test]
    fn sum_lt_one_fires_p1_on_wide_gap() {
        let rule = doc("name: s\ntype: SUM_LT_1\nparams:\n  min_gap: 0.01\n");
        let v = view(
            "m1",
            &[("yes", "Yes"), ("no", "No")],
            vec![tick("yes", 0.48, 1), tick("no", 0.49, 1)],
            vec![],
        );
        let firing = sum_lt_one(&rule, &v, &ctx()).unwrap();
        assert_eq!(firing.level_override, Some(SignalLevel::P1));
        assert!((firing.edge_score - 0.03).abs() < 1e-9);
        assert!(firing.reason.contains("sum=0.970"));
        match firing.payload {
            RulePayload::SumLtOne { sum, ref suggested_trade, .. } => {
                assert!((sum - 0.97).abs() < 1e-9);
                assert_eq!(suggested_trade.legs.len(), 2);
                assert!(suggested_trade.legs.iter().all(|l| l.side == Side::Buy));
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn sum_lt_one_silent_when_sum_healthy() {
        let rule = doc("name: s\ntype: SUM_LT_1\n");
        let v = view(
            "m1",
            &[("yes", "Yes"), ("no", "No")],
            vec![tick("yes", 0.52, 1), tick("no", 0.49, 1)],
            vec![],
        );
        assert!(sum_lt_one(&rule, &v, &ctx()).is_none());
    }

    #[test]
    fn sum_lt_one_requires_full_coverage() {
        let rule = doc("name: s\ntype: SUM_LT_1\n");
        // Three declared outcomes, only two ticked: the sum is not trusted.
        let v = view(
            "m1",
            &[("a", "A"), ("b", "B"), ("c", "C")],
            vec![tick("a", 0.30, 1), tick("b", 0.30, 1)],
            vec![],
        );
        assert!(sum_lt_one(&rule, &v, &ctx()).is_none());
    }

    #[test]
    fn spike_picks_largest_move_and_respects_liquidity() {
        let rule = doc(
            "name: s\ntype: SPIKE_DETECT\nparams:\n  window_secs: 30\n  threshold: 0.03\n  min_liquidity: 100\n",
        );
        let window = vec![
            tick("a", 0.55, 2),
            tick("b", 0.48, 2),
            tick("a", 0.50, 20),
            tick("b", 0.40, 20),
        ];
        let v = view(
            "m1",
            &[("a", "A"), ("b", "B")],
            vec![tick("a", 0.55, 2), tick("b", 0.48, 2)],
            window,
        );
        let firing = spike(&rule, &v, &ctx()).unwrap();
        assert_eq!(firing.option_id.as_deref(), Some("b"));
        assert!((firing.edge_score - 0.08).abs() < 1e-9);
    }

    #[test]
    fn spike_silent_below_threshold() {
        let rule = doc("name: s\ntype: SPIKE_DETECT\nparams:\n  window_secs: 30\n  threshold: 0.1\n");
        let window = vec![tick("a", 0.55, 2), tick("a", 0.50, 20)];
        let v = view("m1", &[("a", "A")], vec![tick("a", 0.55, 2)], window);
        assert!(spike(&rule, &v, &ctx()).is_none());
    }

    #[test]
    fn endgame_requires_proximity_price_and_surge() {
        let rule = doc(
            "name: e\ntype: ENDGAME_SWEEP\nparams:\n  ends_within_hours: 1\n  price_hi: 0.9\n  z_hi: 1.0\n  window_secs: 300\n",
        );
        let mut surge = tick("sweep", 0.95, 2);
        surge.volume = Some(900.0);
        let window = vec![
            surge.clone(),
            {
                let mut t = tick("sweep", 0.94, 60);
                t.volume = Some(100.0);
                t
            },
            {
                let mut t = tick("sweep", 0.93, 120);
                t.volume = Some(110.0);
                t
            },
            {
                let mut t = tick("sweep", 0.92, 180);
                t.volume = Some(90.0);
                t
            },
        ];

        // Market ends too far out: no firing.
        let mut v = view("m1", &[("sweep", "Sweep")], vec![surge.clone()], window.clone());
        v.market.ends_at = Some(Utc::now() + Duration::hours(10));
        assert!(endgame(&rule, &v, &ctx()).is_none());

        // Within the endgame window: fires with a positive z.
        v.market.ends_at = Some(Utc::now() + Duration::minutes(30));
        let firing = endgame(&rule, &v, &ctx()).unwrap();
        match firing.payload {
            RulePayload::Endgame { z_score, price, .. } => {
                assert!(z_score >= 1.0);
                assert!(price >= 0.9);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn trend_breakout_measures_relative_deviation() {
        let rule = doc(
            "name: t\ntype: TREND_BREAKOUT\nparams:\n  window_secs: 300\n  threshold: 0.1\n",
        );
        let window = vec![
            tick("a", 0.80, 2),
            tick("a", 0.50, 60),
            tick("a", 0.50, 120),
            tick("a", 0.50, 180),
        ];
        let v = view("m1", &[("a", "A")], vec![tick("a", 0.80, 2)], window);
        let firing = trend_breakout(&rule, &v, &ctx()).unwrap();
        // mean = 0.575, deviation = 0.225/0.575 ≈ 0.391
        assert!((firing.edge_score - 0.225 / 0.575).abs() < 1e-9);
        match firing.payload {
            RulePayload::TrendBreakout { ref suggested_trade, .. } => {
                assert_eq!(suggested_trade.legs[0].side, Side::Buy);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn dutch_book_fires_on_cheap_basket() {
        let rule = doc("name: d\ntype: DUTCH_BOOK_DETECT\nparams:\n  sum_threshold: 0.995\n");
        let v = view(
            "m1",
            &[("a", "Hike"), ("b", "Hold"), ("c", "Cut")],
            vec![tick("a", 0.30, 1), tick("b", 0.30, 1), tick("c", 0.30, 1)],
            vec![],
        );
        let firing = dutch_book(&rule, &v, &ctx()).unwrap();
        assert!((firing.edge_score - 0.1).abs() < 1e-9);
        match firing.payload {
            RulePayload::DutchBook { ref basket, ref suggested_trade, .. } => {
                assert_eq!(basket.len(), 3);
                assert_eq!(suggested_trade.legs.len(), 3);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn dutch_book_declared_basket_must_be_fully_ticked() {
        let rule = doc(
            "name: d\ntype: DUTCH_BOOK_DETECT\nparams:\n  basket: [\"a\", \"b\", \"missing\"]\n",
        );
        let v = view(
            "m1",
            &[("a", "A"), ("b", "B")],
            vec![tick("a", 0.30, 1), tick("b", 0.30, 1)],
            vec![],
        );
        assert!(dutch_book(&rule, &v, &ctx()).is_none());
    }

    fn group_views() -> (MarketView, MarketView) {
        let a = view(
            "m1",
            &[("m1-yes-t", "Yes"), ("m1-no-t", "No")],
            vec![tick("m1-yes-t", 0.50, 1), tick("m1-no-t", 0.48, 1)],
            vec![],
        );
        let mut b = view(
            "m2",
            &[("m2-yes-t", "Yes"), ("m2-no-t", "No")],
            vec![tick("m2-yes-t", 0.58, 1), tick("m2-no-t", 0.40, 1)],
            vec![],
        );
        b.market = market("m2", Some(48));
        (a, b)
    }

    #[test]
    fn cross_market_pairs_by_identical_label() {
        let rule = doc("name: x\ntype: CROSS_MARKET_MISPRICE\nparams:\n  threshold: 0.05\n");
        let (a, b) = group_views();
        let (attributed, firing) =
            cross_market_misprice(&rule, &[&a, &b], &ctx()).unwrap();
        // Largest gap is Yes: |0.50 - 0.58| = 0.08; buy side is m1.
        assert_eq!(attributed, "m1");
        match firing.payload {
            RulePayload::CrossMarket { ref label, gap, ref suggested_trade, .. } => {
                assert_eq!(label, "Yes");
                assert!((gap - 0.08).abs() < 1e-9);
                assert_eq!(suggested_trade.legs.len(), 2);
                assert_eq!(suggested_trade.legs[0].side, Side::Buy);
                assert_eq!(suggested_trade.legs[1].side, Side::Sell);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn synonym_misprice_tags_leader_and_laggard() {
        let rule = doc("name: y\ntype: SYNONYM_MISPRICE\nparams:\n  threshold: 0.025\n");
        let (a, b) = group_views();
        let (attributed, firing) = synonym_misprice(&rule, &[&a, &b], &ctx()).unwrap();
        assert_eq!(attributed, "m2");
        match firing.payload {
            RulePayload::SynonymMisprice {
                ref leader_market_id,
                ref laggard_market_id,
                ..
            } => {
                // Leader holds the lower price.
                assert_eq!(leader_market_id, "m1");
                assert_eq!(laggard_market_id, "m2");
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn group_rules_silent_below_threshold() {
        let rule = doc("name: x\ntype: CROSS_MARKET_MISPRICE\nparams:\n  threshold: 0.2\n");
        let (a, b) = group_views();
        assert!(cross_market_misprice(&rule, &[&a, &b], &ctx()).is_none());
    }

    #[test]
    fn placeholder_options_are_excluded_from_label_joins() {
        assert!(is_placeholder_option("m1", "m1-0"));
        assert!(is_placeholder_option("m1", "m1-12"));
        assert!(!is_placeholder_option("m1", "m1-yes"));
        assert!(!is_placeholder_option("m1", "tok-123"));
    }

    #[test]
    fn trade_leg_clamps_limit_by_slippage() {
        let leg = trade_leg("m1", "o1", "Yes", Side::Buy, 0.50, 80);
        assert_eq!(leg.reference_price, price_dec(0.50));
        assert_eq!(leg.limit_price, price_dec(0.504));

        let leg = trade_leg("m1", "o1", "Yes", Side::Sell, 0.50, 80);
        assert_eq!(leg.limit_price, price_dec(0.496));
    }
}
