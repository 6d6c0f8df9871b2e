//! Synthetic Venue - Deterministic Offline Data Source
//!
//! Serves a fixed set of markets with pseudo-random price walks from a
//! seeded RNG, so offline runs and tests are reproducible. The walk
//! deliberately produces the situations the rules hunt for: a pair of
//! synonymous election markets that drift apart, a three-way market whose
//! prices occasionally compress below 1.0 (a Dutch window), and a
//! near-expiry market with price and volume surges.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use crate::domain::market::MarketStatus;
use crate::ports::venue::{
    BookTop, MarketDetail, MarketMeta, MarketPage, OutcomeInfo, VenueError, VenueSource,
};

/// One synthetic market definition.
struct SynthMarket {
    market_id: &'static str,
    title: &'static str,
    labels: &'static [&'static str],
    ends_in_minutes: i64,
    tags: &'static [&'static str],
}

const MARKETS: &[SynthMarket] = &[
    SynthMarket {
        market_id: "synth-election",
        title: "Will candidate A win the election?",
        labels: &["Yes", "No"],
        ends_in_minutes: 5 * 60,
        tags: &["politics"],
    },
    SynthMarket {
        market_id: "synth-election-alt",
        title: "Candidate A wins the election",
        labels: &["Yes", "No"],
        ends_in_minutes: 6 * 60,
        tags: &["politics"],
    },
    SynthMarket {
        market_id: "synth-fed",
        title: "Will the Fed raise rates in December?",
        labels: &["Hike", "Hold", "Cut"],
        ends_in_minutes: 2 * 24 * 60,
        tags: &["rates"],
    },
    SynthMarket {
        market_id: "synth-endgame",
        title: "Will Team X sweep the finals?",
        labels: &["Sweep", "No sweep"],
        ends_in_minutes: 25,
        tags: &["sports"],
    },
];

/// Mutable walk state for one option.
struct OptionState {
    price: f64,
    liquidity: f64,
    /// Volume attached to the next snapshot; surged by endgame events.
    volume: f64,
}

struct SynthState {
    rng: StdRng,
    options: HashMap<String, OptionState>,
}

/// Deterministic synthetic venue.
pub struct SyntheticVenue {
    created_at: DateTime<Utc>,
    state: Mutex<SynthState>,
}

impl SyntheticVenue {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut options = HashMap::new();
        for market in MARKETS {
            for label in market.labels {
                let price = rng.gen_range(0.3..0.7);
                let liquidity = rng.gen_range(200.0..800.0);
                options.insert(
                    option_id(market.market_id, label),
                    OptionState {
                        price,
                        liquidity,
                        volume: 0.0,
                    },
                );
            }
        }
        Self {
            created_at: Utc::now(),
            state: Mutex::new(SynthState { rng, options }),
        }
    }

    fn find(market_id: &str) -> Option<&'static SynthMarket> {
        MARKETS.iter().find(|m| m.market_id == market_id)
    }

    fn meta(&self, market: &SynthMarket) -> MarketMeta {
        MarketMeta {
            market_id: market.market_id.to_string(),
            title: market.title.to_string(),
            status: MarketStatus::Open,
            starts_at: Some(self.created_at - ChronoDuration::days(1)),
            ends_at: Some(self.created_at + ChronoDuration::minutes(market.ends_in_minutes)),
            tags: market.tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Advance the walk for one option and return its book.
    fn step(state: &mut SynthState, token: &str) -> BookTop {
        // Market-level events trigger on the first option of their market.
        if token == option_id("synth-fed", "Hike") && state.rng.gen_bool(0.35) {
            let scale = state.rng.gen_range(0.7..0.95);
            for label in ["Hike", "Hold", "Cut"] {
                let key = option_id("synth-fed", label);
                if let Some(opt) = state.options.get_mut(&key) {
                    opt.price = (opt.price * scale).clamp(0.01, 0.99);
                }
            }
        }
        let surged = token == option_id("synth-endgame", "Sweep") && state.rng.gen_bool(0.5);
        if surged {
            if let Some(opt) = state.options.get_mut(token) {
                opt.price = (opt.price + 0.05).max(0.92).min(0.99);
                opt.liquidity = 650.0;
            }
        }

        let drift = {
            let mut delta = state.rng.gen_range(-0.02..0.02);
            if state.rng.gen_bool(0.07) {
                delta += if state.rng.gen_bool(0.5) { -0.08 } else { 0.09 };
            }
            delta
        };
        let base_volume = state.rng.gen_range(50.0..300.0) * (1.0 + state.rng.gen::<f64>());
        let half_spread = state.rng.gen_range(0.005..0.02);
        let liquidity_shift = state.rng.gen_range(-50.0..60.0);

        let opt = state
            .options
            .get_mut(token)
            .expect("unknown synthetic token");
        opt.price = (opt.price + drift).clamp(0.01, 0.99);
        opt.liquidity = (opt.liquidity + liquidity_shift).clamp(150.0, 1200.0);
        opt.volume = if surged { base_volume * 4.0 } else { base_volume };

        let price = (opt.price * 10_000.0).round() / 10_000.0;
        BookTop {
            ts: Utc::now(),
            price: Some(price),
            best_bid: Some(((price - half_spread).max(0.0) * 10_000.0).round() / 10_000.0),
            best_ask: Some(((price + half_spread).min(1.0) * 10_000.0).round() / 10_000.0),
            liquidity: Some((opt.liquidity * 100.0).round() / 100.0),
            volume: Some((opt.volume * 10_000.0).round() / 10_000.0),
        }
    }
}

fn option_id(market_id: &str, label: &str) -> String {
    format!(
        "{market_id}-{}",
        label.to_lowercase().replace(' ', "-")
    )
}

#[async_trait]
impl VenueSource for SyntheticVenue {
    async fn list_markets(
        &self,
        limit: usize,
        _cursor: Option<String>,
    ) -> Result<MarketPage, VenueError> {
        Ok(MarketPage {
            markets: MARKETS.iter().take(limit).map(|m| self.meta(m)).collect(),
            next_cursor: None,
        })
    }

    async fn market_detail(&self, market_id: &str) -> Result<MarketDetail, VenueError> {
        let market = Self::find(market_id)
            .ok_or_else(|| VenueError::Rejected {
                status: 404,
                message: format!("unknown market: {market_id}"),
            })?;

        let state = self.state.lock().await;
        let outcomes = market
            .labels
            .iter()
            .map(|label| {
                let id = option_id(market.market_id, label);
                let price = state.options.get(&id).map(|o| o.price);
                OutcomeInfo {
                    option_id: id.clone(),
                    token_id: Some(id),
                    label: label.to_string(),
                    price,
                }
            })
            .collect();
        let liquidity = market
            .labels
            .iter()
            .filter_map(|label| {
                state
                    .options
                    .get(&option_id(market.market_id, label))
                    .map(|o| o.liquidity)
            })
            .fold(None::<f64>, |acc, l| Some(acc.unwrap_or(0.0) + l));

        Ok(MarketDetail {
            meta: self.meta(market),
            outcomes,
            liquidity,
            volume: Some(500.0),
        })
    }

    async fn order_book(&self, token_id: &str) -> Result<BookTop, VenueError> {
        let mut state = self.state.lock().await;
        if !state.options.contains_key(token_id) {
            return Err(VenueError::Rejected {
                status: 404,
                message: format!("unknown token: {token_id}"),
            });
        }
        Ok(Self::step(&mut state, token_id))
    }

    fn label(&self) -> &'static str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn same_seed_same_walk() {
        let a = SyntheticVenue::new(7);
        let b = SyntheticVenue::new(7);
        let token = option_id("synth-election", "Yes");

        for _ in 0..5 {
            let book_a = a.order_book(&token).await.unwrap();
            let book_b = b.order_book(&token).await.unwrap();
            assert_eq!(book_a.price, book_b.price);
            assert_eq!(book_a.best_bid, book_b.best_bid);
        }
    }

    #[tokio::test]
    async fn lists_fixed_markets_deterministically() {
        let venue = SyntheticVenue::new(1);
        let page = venue.list_markets(100, None).await.unwrap();
        assert_eq!(page.markets.len(), 4);
        assert_eq!(page.markets[0].market_id, "synth-election");
        assert!(page.next_cursor.is_none());

        let detail = venue.market_detail("synth-fed").await.unwrap();
        assert_eq!(detail.outcomes.len(), 3);
        assert_eq!(detail.outcomes[2].label, "Cut");
    }

    #[tokio::test]
    async fn unknown_ids_are_fatal_rejections() {
        let venue = SyntheticVenue::new(1);
        let err = venue.market_detail("nope").await.unwrap_err();
        assert!(!err.is_retriable());
        let err = venue.order_book("nope").await.unwrap_err();
        assert!(!err.is_retriable());
    }

    #[tokio::test]
    async fn prices_stay_in_band() {
        let venue = SyntheticVenue::new(99);
        let token = option_id("synth-endgame", "Sweep");
        for _ in 0..50 {
            let book = venue.order_book(&token).await.unwrap();
            let price = book.price.unwrap();
            assert!((0.0..=1.0).contains(&price));
            assert!(book.best_bid.unwrap() <= book.best_ask.unwrap());
        }
    }
}
