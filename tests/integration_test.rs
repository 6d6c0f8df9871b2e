//! Integration Tests - End-to-end Pipeline Scenarios
//!
//! Drives the real components against an in-memory SQLite store: the rule
//! engine emitting signals from stored ticks, the ingestion dedup path,
//! and the intent pipeline's risk gauntlet and synthetic fills.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal_macros::dec;

use marketpulse::adapters::metrics::MetricsRegistry;
use marketpulse::adapters::store::SqliteStore;
use marketpulse::config::RulesSection;
use marketpulse::domain::intent::IntentStatus;
use marketpulse::domain::market::{Market, MarketOption, MarketStatus, Tick};
use marketpulse::domain::rule::RuleDoc;
use marketpulse::domain::signal::{
    BookEntry, NewSignal, RulePayload, Side, SignalLevel, SignalPayload, TradeLeg, TradePlan,
};
use marketpulse::ports::alert::{AlertOutcome, AlertTransport, NullTransport};
use marketpulse::usecases::{
    BreakerConfig, CircuitBreakerTable, IntentPipeline, IntentRequest, RuleEngine, SynonymMatcher,
};
use mockall::mock;

// ── Fixtures ────────────────────────────────────────────────

async fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory().await.unwrap())
}

fn metrics() -> Arc<MetricsRegistry> {
    Arc::new(MetricsRegistry::new().unwrap())
}

fn breakers() -> Arc<CircuitBreakerTable> {
    Arc::new(CircuitBreakerTable::new(BreakerConfig::default()))
}

fn rules_section(cooldown_check_secs: u64) -> RulesSection {
    RulesSection {
        eval_interval_ms: 50,
        lookback_secs: 300,
        rules_dir: "does-not-exist".into(),
        synonyms_path: "does-not-exist".into(),
        reload_check_secs: cooldown_check_secs,
        breaker_max: 100,
        breaker_window_secs: 60,
        breaker_cooldown_secs: 300,
        breaker_max_cooldown_secs: 3600,
    }
}

fn engine(store: Arc<SqliteStore>) -> RuleEngine {
    RuleEngine::new(
        store,
        Arc::new(NullTransport),
        metrics(),
        breakers(),
        rules_section(3600),
        SynonymMatcher::from_doc(Default::default()),
    )
}

async fn seed_market(store: &SqliteStore, market_id: &str, labels: &[(&str, &str)]) {
    store
        .upsert_market(&Market {
            market_id: market_id.into(),
            title: format!("Market {market_id}"),
            status: MarketStatus::Open,
            starts_at: None,
            ends_at: Some(Utc::now() + ChronoDuration::hours(4)),
            tags: vec![],
            embedding: None,
        })
        .await
        .unwrap();
    let options: Vec<MarketOption> = labels
        .iter()
        .map(|(option_id, label)| MarketOption {
            option_id: option_id.to_string(),
            market_id: market_id.to_string(),
            label: label.to_string(),
        })
        .collect();
    store.upsert_options(&options).await.unwrap();
}

fn tick(market_id: &str, option_id: &str, price: f64, bid: f64, ask: f64) -> Tick {
    Tick {
        ts: Utc::now(),
        market_id: market_id.into(),
        option_id: option_id.into(),
        price,
        volume: Some(100.0),
        best_bid: Some(bid),
        best_ask: Some(ask),
        liquidity: Some(500.0),
    }
}

fn yaml_rule(raw: &str) -> (RuleDoc, String) {
    (serde_yaml::from_str(raw).unwrap(), raw.to_string())
}

/// Persist a rule and one signal carrying a single-leg plan.
async fn seed_signal(
    store: &SqliteStore,
    market_id: &str,
    option_id: &str,
    qty: rust_decimal::Decimal,
    price: rust_decimal::Decimal,
) -> i64 {
    let (doc, raw) = yaml_rule("name: seeded-spike\ntype: SPIKE_DETECT\n");
    let (rule_id, _) = store.upsert_rule_def(&doc, &raw).await.unwrap();

    let leg = TradeLeg {
        market_id: market_id.into(),
        option_id: option_id.into(),
        label: "Yes".into(),
        side: Side::Buy,
        qty,
        reference_price: price,
        limit_price: price,
    };
    let payload = SignalPayload::Known(RulePayload::Spike {
        option_id: option_id.into(),
        delta: 0.06,
        window_secs: 10,
        samples: 5,
        book_snapshot: Vec::<BookEntry>::new(),
        suggested_trade: TradePlan {
            action: "momentum_follow".into(),
            rationale: "seeded".into(),
            legs: vec![leg],
            estimated_edge_bps: Some(600.0),
            confidence: None,
        },
    });
    store
        .insert_signal(&NewSignal {
            market_id: market_id.into(),
            option_id: Some(option_id.into()),
            rule_id,
            level: SignalLevel::P1,
            score: 80.0,
            edge_score: 0.06,
            reason: "seeded spike".into(),
            payload,
        })
        .await
        .unwrap()
}

fn pipeline(store: Arc<SqliteStore>, brk: Arc<CircuitBreakerTable>) -> IntentPipeline {
    IntentPipeline::new(store, brk, metrics(), true, 60)
}

// ── Scenario 1: SUM_LT_1 emission shape ─────────────────────

#[tokio::test]
async fn sum_lt_one_emits_p1_signal_with_expected_shape() {
    let store = memory_store().await;
    seed_market(&store, "m1", &[("tok-yes", "Yes"), ("tok-no", "No")]).await;
    store
        .insert_ticks(&[
            tick("m1", "tok-yes", 0.48, 0.47, 0.49),
            tick("m1", "tok-no", 0.49, 0.48, 0.50),
        ])
        .await
        .unwrap();

    let mut engine = engine(Arc::clone(&store));
    engine
        .install_rules(&[yaml_rule(
            "name: sum-watch\ntype: SUM_LT_1\nparams:\n  min_gap: 0.01\n",
        )])
        .await
        .unwrap();

    let stats = engine.evaluate_once().await.unwrap();
    assert_eq!(stats.emitted, 1);

    let signals = store.list_recent_signals(10).await.unwrap();
    let signal = &signals[0];
    assert_eq!(signal.level, SignalLevel::P1);
    assert!((signal.edge_score - 0.03).abs() < 1e-9);
    assert!(signal.reason.contains("sum=0.970"));
    match &signal.payload {
        SignalPayload::Known(RulePayload::SumLtOne {
            sum,
            suggested_trade,
            book_snapshot,
            ..
        }) => {
            assert!((sum - 0.97).abs() < 1e-9);
            assert_eq!(suggested_trade.legs.len(), 2);
            assert_eq!(book_snapshot.len(), 2);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

// ── Scenario 2: ingestion dedup ─────────────────────────────

mod dedup {
    use super::*;
    use async_trait::async_trait;
    use marketpulse::config::IngestionSection;
    use marketpulse::ports::venue::{
        BookTop, MarketDetail, MarketMeta, MarketPage, OutcomeInfo, VenueError, VenueSource,
    };
    use marketpulse::usecases::IngestionPipeline;

    /// Serves the same book forever.
    struct ConstantVenue;

    #[async_trait]
    impl VenueSource for ConstantVenue {
        async fn list_markets(
            &self,
            _limit: usize,
            _cursor: Option<String>,
        ) -> Result<MarketPage, VenueError> {
            Ok(MarketPage {
                markets: vec![MarketMeta {
                    market_id: "m1".into(),
                    title: "Constant".into(),
                    status: MarketStatus::Open,
                    starts_at: None,
                    ends_at: None,
                    tags: vec![],
                }],
                next_cursor: None,
            })
        }

        async fn market_detail(&self, market_id: &str) -> Result<MarketDetail, VenueError> {
            Ok(MarketDetail {
                meta: MarketMeta {
                    market_id: market_id.into(),
                    title: "Constant".into(),
                    status: MarketStatus::Open,
                    starts_at: None,
                    ends_at: None,
                    tags: vec![],
                },
                outcomes: vec![OutcomeInfo {
                    option_id: "o1".into(),
                    token_id: Some("o1".into()),
                    label: "Yes".into(),
                    price: Some(0.50),
                }],
                liquidity: Some(300.0),
                volume: Some(100.0),
            })
        }

        async fn order_book(&self, _token_id: &str) -> Result<BookTop, VenueError> {
            Ok(BookTop {
                ts: Utc::now(),
                price: Some(0.50),
                best_bid: Some(0.49),
                best_ask: Some(0.51),
                liquidity: Some(300.0),
                volume: None,
            })
        }

        fn label(&self) -> &'static str {
            "constant"
        }
    }

    #[tokio::test]
    async fn identical_books_within_flush_interval_store_one_tick() {
        let store = memory_store().await;
        let config = IngestionSection {
            poll_interval_ms: 50,
            chunk_size: 10,
            max_concurrency: 2,
            min_flush_interval_secs: 30,
            market_refresh_secs: 300,
            market_limit: 10,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            request_timeout_secs: 1,
        };
        let mut ingestion = IngestionPipeline::new(
            Arc::new(ConstantVenue),
            Arc::clone(&store),
            metrics(),
            config,
        );

        // Two cycles ~3s apart in spirit; identical tuples within the
        // flush interval collapse to one stored row.
        let first = ingestion.run_cycle().await.unwrap();
        let second = ingestion.run_cycle().await.unwrap();

        assert_eq!(first.written, 1);
        assert_eq!(second.written, 0);
        assert_eq!(second.deduped, 1);
        assert_eq!(store.tick_count("m1", "o1").await.unwrap(), 1);
    }
}

// ── Scenario 3: cooldown timing ─────────────────────────────

#[tokio::test]
async fn cooldown_spaces_signals_for_a_rule_market_pair() {
    let store = memory_store().await;
    seed_market(&store, "m1", &[("tok-yes", "Yes"), ("tok-no", "No")]).await;
    store
        .insert_ticks(&[
            tick("m1", "tok-yes", 0.48, 0.47, 0.49),
            tick("m1", "tok-no", 0.49, 0.48, 0.50),
        ])
        .await
        .unwrap();

    let mut engine = engine(Arc::clone(&store));
    engine
        .install_rules(&[yaml_rule(
            "name: sum-watch\ntype: SUM_LT_1\nparams:\n  min_gap: 0.01\ndedupe:\n  cooldown_secs: 1\n",
        )])
        .await
        .unwrap();

    // Fires, then holds while the predicate still passes, then fires
    // again once the cooldown elapses.
    assert_eq!(engine.evaluate_once().await.unwrap().emitted, 1);
    assert_eq!(engine.evaluate_once().await.unwrap().emitted, 0);
    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(engine.evaluate_once().await.unwrap().emitted, 1);

    let signals = store.list_recent_signals(10).await.unwrap();
    assert_eq!(signals.len(), 2);
}

// ── Scenario 4: notional rejection and boundary accept ──────

#[tokio::test]
async fn notional_above_cap_rejects_with_reason() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.41, 0.40, 0.41)])
        .await
        .unwrap();
    // 500 × 0.41 = 205.00 > 200.
    let signal_id = seed_signal(&store, "m1", "o1", dec!(500), dec!(0.41)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let intent = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(intent.status, IntentStatus::Suggested);

    let confirmed = pipeline.confirm_intent(intent.intent_id).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Rejected);
    let checks = confirmed.detail.checks.unwrap();
    assert!(!checks.approved);
    assert!(checks
        .reasons
        .contains(&"notional_cap_exceeded".to_string()));
}

#[tokio::test]
async fn notional_at_exactly_the_cap_fills_in_mock_mode() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.40, 0.39, 0.40)])
        .await
        .unwrap();
    // 500 × 0.40 = 200.00, exactly the cap.
    let signal_id = seed_signal(&store, "m1", "o1", dec!(500), dec!(0.40)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let intent = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();

    // Scenario 6 as well: suggested → sent → filled in one call, with
    // the synthetic fill at the leg's reference price.
    let confirmed = pipeline.confirm_intent(intent.intent_id).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Filled);
    assert_eq!(confirmed.fill_price, Some(dec!(0.40)));
    assert!(confirmed.updated_at >= confirmed.created_at);
    assert!(confirmed.detail.checks.unwrap().approved);
}

// ── Scenario 5: slippage rejection after the book moves ─────

#[tokio::test]
async fn stale_limit_price_rejects_on_slippage() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.60, 0.59, 0.60)])
        .await
        .unwrap();
    let signal_id = seed_signal(&store, "m1", "o1", dec!(1), dec!(0.60)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let intent = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();

    // The book collapses to 0.50 before confirmation: the 0.60 limit is
    // now 2000 bps away from the ask, far over the 80 bps budget.
    let mut moved = tick("m1", "o1", 0.50, 0.49, 0.50);
    moved.ts = Utc::now() + ChronoDuration::milliseconds(5);
    store.insert_ticks(&[moved]).await.unwrap();

    let confirmed = pipeline.confirm_intent(intent.intent_id).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Rejected);
    assert!(confirmed
        .detail
        .checks
        .unwrap()
        .reasons
        .contains(&"slippage_exceeded".to_string()));
}

// ── Breaker gate on confirmation ────────────────────────────

#[tokio::test]
async fn open_breaker_rejects_confirmation() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.40, 0.39, 0.40)])
        .await
        .unwrap();
    let signal_id = seed_signal(&store, "m1", "o1", dec!(1), dec!(0.40)).await;
    let signal = store.get_signal(signal_id).await.unwrap().unwrap();

    let brk = Arc::new(CircuitBreakerTable::new(BreakerConfig {
        max_emissions: 1,
        window: Duration::from_secs(60),
        cooldown: Duration::from_secs(300),
        max_cooldown: Duration::from_secs(3600),
    }));
    let now = std::time::Instant::now();
    brk.record_emission(signal.rule_id, "m1", now);
    brk.record_emission(signal.rule_id, "m1", now);
    assert!(brk.is_open(signal.rule_id, "m1", now));

    let pipeline = pipeline(Arc::clone(&store), Arc::clone(&brk));
    let intent = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();
    let confirmed = pipeline.confirm_intent(intent.intent_id).await.unwrap();

    assert_eq!(confirmed.status, IntentStatus::Rejected);
    assert!(confirmed
        .detail
        .checks
        .unwrap()
        .reasons
        .contains(&"breaker_open".to_string()));
}

// ── Idempotence and expiry ──────────────────────────────────

#[tokio::test]
async fn intents_are_per_request_and_terminal_confirm_is_noop() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.40, 0.39, 0.40)])
        .await
        .unwrap();
    let signal_id = seed_signal(&store, "m1", "o1", dec!(1), dec!(0.40)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let first = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();
    let second = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_ne!(first.intent_id, second.intent_id);

    let filled = pipeline.confirm_intent(first.intent_id).await.unwrap();
    assert_eq!(filled.status, IntentStatus::Filled);

    // Confirming a terminal intent returns the terminal state untouched.
    let again = pipeline.confirm_intent(first.intent_id).await.unwrap();
    assert_eq!(again.status, IntentStatus::Filled);
    assert_eq!(again.updated_at, filled.updated_at);
    assert_eq!(again.fill_price, filled.fill_price);
}

#[tokio::test]
async fn expired_ttl_transitions_to_expired() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 2, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.40, 0.39, 0.40)])
        .await
        .unwrap();
    let signal_id = seed_signal(&store, "m1", "o1", dec!(1), dec!(0.40)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let intent = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ttl_secs: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let confirmed = pipeline.confirm_intent(intent.intent_id).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Expired);
}

// ── Concurrency cap across intents in one market ────────────

#[tokio::test]
async fn concurrency_cap_counts_open_intents_in_market() {
    let store = memory_store().await;
    store
        .bootstrap_policy("default", "semi_auto", dec!(200), 1, dec!(1000), 80)
        .await
        .unwrap();
    seed_market(&store, "m1", &[("o1", "Yes")]).await;
    store
        .insert_ticks(&[tick("m1", "o1", 0.40, 0.39, 0.40)])
        .await
        .unwrap();
    let signal_id = seed_signal(&store, "m1", "o1", dec!(1), dec!(0.40)).await;

    let pipeline = pipeline(Arc::clone(&store), breakers());
    let first = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();
    let second = pipeline
        .create_intent(IntentRequest {
            signal_id,
            ..Default::default()
        })
        .await
        .unwrap();

    // Two suggested intents in one market against a cap of one.
    let confirmed = pipeline.confirm_intent(second.intent_id).await.unwrap();
    assert_eq!(confirmed.status, IntentStatus::Rejected);
    assert!(confirmed
        .detail
        .checks
        .unwrap()
        .reasons
        .contains(&"concurrency_cap_exceeded".to_string()));
    // The other intent is untouched.
    let stored = store.get_intent(first.intent_id).await.unwrap().unwrap();
    assert_eq!(stored.status, IntentStatus::Suggested);
}

// ── Alert transport failures never fail the cycle ───────────

mock! {
    pub Transport {}

    #[async_trait::async_trait]
    impl AlertTransport for Transport {
        async fn send(&self, text: &str, dedupe_key: &str, cooldown_secs: u64) -> AlertOutcome;
    }
}

#[tokio::test]
async fn failing_alert_transport_only_bumps_a_counter() {
    let store = memory_store().await;
    seed_market(&store, "m1", &[("tok-yes", "Yes"), ("tok-no", "No")]).await;
    store
        .insert_ticks(&[
            tick("m1", "tok-yes", 0.48, 0.47, 0.49),
            tick("m1", "tok-no", 0.49, 0.48, 0.50),
        ])
        .await
        .unwrap();

    let mut transport = MockTransport::new();
    transport
        .expect_send()
        .times(1)
        .returning(|_, _, _| AlertOutcome::Failed);

    let shared_metrics = metrics();
    let mut engine = RuleEngine::new(
        Arc::clone(&store),
        Arc::new(transport),
        Arc::clone(&shared_metrics),
        breakers(),
        rules_section(3600),
        SynonymMatcher::from_doc(Default::default()),
    );
    engine
        .install_rules(&[yaml_rule(
            "name: sum-watch\ntype: SUM_LT_1\nparams:\n  min_gap: 0.01\n",
        )])
        .await
        .unwrap();

    // The cycle completes, the signal persists, and only the failure
    // counter moves.
    let stats = engine.evaluate_once().await.unwrap();
    assert_eq!(stats.emitted, 1);
    assert_eq!(store.list_recent_signals(10).await.unwrap().len(), 1);
    assert_eq!(shared_metrics.alert_failures_total.get(), 1);
}

// ── Cross-market rules over synonym groups ──────────────────

#[tokio::test]
async fn cross_market_misprice_fires_across_synonymous_markets() {
    let store = memory_store().await;
    seed_market(&store, "ma", &[("tok-a-yes", "Yes"), ("tok-a-no", "No")]).await;
    seed_market(&store, "mb", &[("tok-b-yes", "Yes"), ("tok-b-no", "No")]).await;
    store
        .insert_ticks(&[
            tick("ma", "tok-a-yes", 0.50, 0.49, 0.51),
            tick("ma", "tok-a-no", 0.50, 0.49, 0.51),
            tick("mb", "tok-b-yes", 0.58, 0.57, 0.59),
            tick("mb", "tok-b-no", 0.46, 0.45, 0.47),
        ])
        .await
        .unwrap();

    let synonyms: marketpulse::usecases::synonyms::SynonymsDoc = serde_yaml::from_str(
        "groups:\n  - name: pair\n    keywords: [\"market m\"]\n    group_min_size: 2\n",
    )
    .unwrap();
    let mut engine = RuleEngine::new(
        Arc::clone(&store),
        Arc::new(NullTransport),
        metrics(),
        breakers(),
        rules_section(3600),
        SynonymMatcher::from_doc(synonyms),
    );
    engine
        .install_rules(&[yaml_rule(
            "name: cross\ntype: CROSS_MARKET_MISPRICE\nparams:\n  threshold: 0.05\n",
        )])
        .await
        .unwrap();

    let stats = engine.evaluate_once().await.unwrap();
    assert_eq!(stats.emitted, 1);

    let signals = store.list_recent_signals(10).await.unwrap();
    match &signals[0].payload {
        SignalPayload::Known(RulePayload::CrossMarket {
            label,
            gap,
            buy_market_id,
            sell_market_id,
            suggested_trade,
            ..
        }) => {
            assert_eq!(label, "Yes");
            assert!((gap - 0.08).abs() < 1e-9);
            assert_eq!(buy_market_id, "ma");
            assert_eq!(sell_market_id, "mb");
            assert_eq!(suggested_trade.legs.len(), 2);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // The groups were materialized into the store.
    let groups = store.list_synonym_groups().await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].members.len(), 2);
}
