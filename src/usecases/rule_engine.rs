//! Rule Engine - Declarative Evaluation Scheduler
//!
//! Loads rule documents, schedules evaluation cycles over fresh ticks,
//! gates emissions through cooldowns and circuit breakers, and makes the
//! emission path atomic per signal: persist, fold KPIs, audit, count,
//! then alert (an alert failure only bumps a counter).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::store::SqliteStore;
use crate::config::RulesSection;
use crate::domain::market::MarketStatus;
use crate::domain::rule::{RuleDefinition, RuleDoc, RuleType};
use crate::domain::signal::{NewSignal, SignalPayload};
use crate::ports::alert::{AlertOutcome, AlertTransport};

use super::breaker::CircuitBreakerTable;
use super::predicates::{self, EvalContext, Firing, MarketView};
use super::scoring::compute_score;
use super::synonyms::SynonymMatcher;

/// Alert payloads are capped at 4 KB.
const ALERT_MAX_BYTES: usize = 4096;

/// Counters from one evaluation cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvalStats {
    pub markets: usize,
    pub fired: usize,
    pub emitted: usize,
    pub cooled: usize,
    pub breaker_skipped: usize,
}

/// The rule evaluation loop.
pub struct RuleEngine {
    store: Arc<SqliteStore>,
    alerts: Arc<dyn AlertTransport>,
    metrics: Arc<MetricsRegistry>,
    breakers: Arc<CircuitBreakerTable>,
    config: RulesSection,
    synonyms: SynonymMatcher,
    rules: Vec<RuleDefinition>,
    /// Last emission per (rule_id, market_id).
    cooldowns: HashMap<(i64, String), DateTime<Utc>>,
    rules_hash: Option<u64>,
    last_reload_check: Option<Instant>,
}

impl RuleEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        alerts: Arc<dyn AlertTransport>,
        metrics: Arc<MetricsRegistry>,
        breakers: Arc<CircuitBreakerTable>,
        config: RulesSection,
        synonyms: SynonymMatcher,
    ) -> Self {
        Self {
            store,
            alerts,
            metrics,
            breakers,
            config,
            synonyms,
            rules: Vec::new(),
            cooldowns: HashMap::new(),
            rules_hash: None,
            last_reload_check: None,
        }
    }

    /// Load every rule document from the rules directory, persisting each
    /// with a version that bumps on source change. Disabled documents are
    /// persisted but not evaluated.
    pub async fn load_rules(&mut self) -> Result<()> {
        let dir = PathBuf::from(&self.config.rules_dir);
        let mut docs = Vec::new();
        if dir.exists() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
                .with_context(|| format!("Failed to read rules dir: {}", dir.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| {
                    path.extension()
                        .map(|ext| ext == "yaml" || ext == "yml")
                        .unwrap_or(false)
                })
                .collect();
            paths.sort();

            for path in paths {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read rule: {}", path.display()))?;
                match serde_yaml::from_str::<RuleDoc>(&raw) {
                    Ok(doc) => docs.push((doc, raw)),
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "Skipping malformed rule document");
                    }
                }
            }
        }
        self.rules_hash = Self::hash_dir(&dir);
        self.install_rules(&docs).await
    }

    /// Persist the documents and activate the enabled ones.
    pub async fn install_rules(&mut self, docs: &[(RuleDoc, String)]) -> Result<()> {
        self.rules.clear();
        for (doc, raw) in docs {
            let (rule_id, version) = self.store.upsert_rule_def(doc, raw).await?;
            if !doc.enabled {
                continue;
            }
            self.rules.push(RuleDefinition {
                rule_id,
                doc: doc.clone(),
                version,
            });
        }
        self.store
            .insert_audit(
                "rule_engine",
                "rules_loaded",
                None,
                None,
                serde_json::json!({ "count": self.rules.len() }),
            )
            .await?;
        info!(count = self.rules.len(), "Rules loaded");
        Ok(())
    }

    /// Run until shutdown, one evaluation cycle per `eval_interval_ms`.
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        if self.rules.is_empty() {
            self.load_rules().await?;
        }
        let interval = Duration::from_millis(self.config.eval_interval_ms);
        info!(
            rules = self.rules.len(),
            interval_ms = self.config.eval_interval_ms,
            "Rule engine started"
        );

        loop {
            let started = Instant::now();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = self.evaluate_once() => {
                    if let Err(err) = result {
                        warn!(error = %err, "Evaluation cycle failed");
                    }
                }
            }

            let wait = interval.saturating_sub(started.elapsed());
            if !wait.is_zero() {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(wait) => {}
                }
            }
        }

        info!("Rule engine stopped");
        Ok(())
    }

    /// One evaluation cycle over every in-scope market.
    pub async fn evaluate_once(&mut self) -> Result<EvalStats> {
        let started = Instant::now();
        self.maybe_reload().await?;

        let mut stats = EvalStats::default();
        let now = Utc::now();
        let ctx = EvalContext {
            now,
            slippage_bps: self.slippage_bps().await,
        };
        let correlation = uuid::Uuid::new_v4().to_string();

        let markets = self
            .store
            .list_markets(Some(MarketStatus::Open), 100)
            .await?;
        stats.markets = markets.len();

        // Snapshot every market once per cycle.
        let mut views: HashMap<String, MarketView> = HashMap::new();
        for market in markets {
            let latest = self.store.latest_ticks_by_market(&market.market_id).await?;
            if latest.is_empty() {
                continue;
            }
            let window = self
                .store
                .recent_ticks(&market.market_id, self.config.lookback_secs, 500)
                .await?;
            let options = self.store.list_options(&market.market_id).await?;
            views.insert(
                market.market_id.clone(),
                MarketView {
                    market,
                    options,
                    latest,
                    window,
                },
            );
        }

        // Per-market rules, gated before the predicate runs.
        let mut pending: Vec<(usize, String, Firing)> = Vec::new();
        for (rule_idx, rule) in self.rules.iter().enumerate() {
            if rule.doc.rule_type.is_cross_market() {
                continue;
            }
            for (market_id, view) in &views {
                if self.on_cooldown(rule, market_id, now) {
                    stats.cooled += 1;
                    continue;
                }
                if self.breaker_open(rule, market_id) {
                    stats.breaker_skipped += 1;
                    continue;
                }
                let firing = match rule.doc.rule_type {
                    RuleType::SumLt1 => predicates::sum_lt_one(&rule.doc, view, &ctx),
                    RuleType::SpikeDetect => predicates::spike(&rule.doc, view, &ctx),
                    RuleType::EndgameSweep => predicates::endgame(&rule.doc, view, &ctx),
                    RuleType::DutchBookDetect => predicates::dutch_book(&rule.doc, view, &ctx),
                    RuleType::TrendBreakout => predicates::trend_breakout(&rule.doc, view, &ctx),
                    RuleType::SynonymMisprice | RuleType::CrossMarketMisprice => None,
                };
                if let Some(firing) = firing {
                    pending.push((rule_idx, market_id.clone(), firing));
                }
            }
        }

        // Synonym-group rules, gated after attribution is known.
        let group_rules: Vec<usize> = self
            .rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.doc.rule_type.is_cross_market())
            .map(|(idx, _)| idx)
            .collect();
        if !group_rules.is_empty() {
            let tracked: Vec<_> = views.values().map(|v| v.market.clone()).collect();
            let groups = self.synonyms.sync(&self.store, &tracked).await?;
            for rule_idx in group_rules {
                let rule = &self.rules[rule_idx];
                for group in &groups {
                    let members: Vec<&MarketView> = group
                        .members
                        .iter()
                        .filter_map(|id| views.get(id))
                        .collect();
                    if members.len() < 2 {
                        continue;
                    }
                    let hit = match rule.doc.rule_type {
                        RuleType::SynonymMisprice => {
                            predicates::synonym_misprice(&rule.doc, &members, &ctx)
                        }
                        RuleType::CrossMarketMisprice => {
                            predicates::cross_market_misprice(&rule.doc, &members, &ctx)
                        }
                        _ => None,
                    };
                    if let Some((market_id, firing)) = hit {
                        if self.on_cooldown(rule, &market_id, now) {
                            stats.cooled += 1;
                            continue;
                        }
                        if self.breaker_open(rule, &market_id) {
                            stats.breaker_skipped += 1;
                            continue;
                        }
                        pending.push((rule_idx, market_id, firing));
                    }
                }
            }
        }

        stats.fired = pending.len();
        for (rule_idx, market_id, firing) in pending {
            let title = views
                .get(&market_id)
                .map(|v| v.market.title.clone())
                .unwrap_or_else(|| market_id.clone());
            self.emit(rule_idx, &market_id, &title, firing, &correlation, now)
                .await?;
            stats.emitted += 1;
        }

        self.metrics
            .rule_eval_ms
            .with_label_values(&["core"])
            .observe(started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            markets = stats.markets,
            emitted = stats.emitted,
            cooled = stats.cooled,
            "Evaluation cycle complete"
        );
        Ok(stats)
    }

    fn on_cooldown(&self, rule: &RuleDefinition, market_id: &str, now: DateTime<Utc>) -> bool {
        let key = (rule.rule_id, market_id.to_string());
        self.cooldowns
            .get(&key)
            .map(|last| {
                (now - *last).num_seconds() < rule.doc.dedupe.cooldown_secs as i64
            })
            .unwrap_or(false)
    }

    fn breaker_open(&self, rule: &RuleDefinition, market_id: &str) -> bool {
        let open = self
            .breakers
            .is_open(rule.rule_id, market_id, Instant::now());
        if open {
            self.metrics
                .breaker_skips_total
                .with_label_values(&[rule.doc.rule_type.as_str()])
                .inc();
        }
        open
    }

    /// The emission path: signal, KPI, audit, counter, then alert.
    async fn emit(
        &mut self,
        rule_idx: usize,
        market_id: &str,
        market_title: &str,
        firing: Firing,
        correlation: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let rule = &self.rules[rule_idx];
        let level = firing.level_override.unwrap_or(rule.doc.outputs.level);
        let score = compute_score(&rule.doc.outputs.score, &firing.metrics);
        let rule_type = rule.doc.rule_type.as_str();

        let signal = NewSignal {
            market_id: market_id.to_string(),
            option_id: firing.option_id.clone(),
            rule_id: rule.rule_id,
            level,
            score,
            edge_score: firing.edge_score,
            reason: firing.reason.clone(),
            payload: SignalPayload::Known(firing.payload),
        };
        let signal_id = self.store.insert_signal(&signal).await?;

        self.store
            .record_kpi(rule_type, level, firing.gap, firing.estimated_edge_bps)
            .await?;
        self.store
            .insert_audit(
                "rule_engine",
                "signal_emitted",
                Some(&signal_id.to_string()),
                Some(correlation),
                serde_json::json!({ "rule": rule.doc.name, "market_id": market_id }),
            )
            .await?;
        self.metrics
            .signals_total
            .with_label_values(&[rule_type])
            .inc();

        self.cooldowns
            .insert((rule.rule_id, market_id.to_string()), now);
        self.breakers
            .record_emission(rule.rule_id, market_id, Instant::now());

        // Alerting is best-effort; a transport failure never fails the cycle.
        let text = format_alert(&rule.doc.name, market_title, level.to_string(), &signal);
        let dedupe_key = format!("{}:{market_id}", rule.rule_id);
        let outcome = self
            .alerts
            .send(&text, &dedupe_key, rule.doc.dedupe.cooldown_secs)
            .await;
        if outcome == AlertOutcome::Failed {
            self.metrics.alert_failures_total.inc();
        }

        info!(
            signal_id,
            rule = %rule.doc.name,
            market_id,
            level = %level,
            edge_score = firing.edge_score,
            transport = outcome.transport_tag(),
            "Signal emitted"
        );
        Ok(())
    }

    /// Re-hash the rules directory on the configured cadence; reload when
    /// the contents changed.
    async fn maybe_reload(&mut self) -> Result<()> {
        let due = self
            .last_reload_check
            .map(|at| at.elapsed() >= Duration::from_secs(self.config.reload_check_secs))
            .unwrap_or(false);
        if !due {
            if self.last_reload_check.is_none() {
                self.last_reload_check = Some(Instant::now());
            }
            return Ok(());
        }
        self.last_reload_check = Some(Instant::now());

        let new_hash = Self::hash_dir(Path::new(&self.config.rules_dir));
        if new_hash != self.rules_hash {
            info!("Rule documents changed, reloading");
            self.load_rules().await?;
        }
        Ok(())
    }

    fn hash_dir(dir: &Path) -> Option<u64> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        let mut hasher = DefaultHasher::new();
        for path in paths {
            path.hash(&mut hasher);
            if let Ok(content) = std::fs::read_to_string(&path) {
                content.hash(&mut hasher);
            }
        }
        Some(hasher.finish())
    }

    /// Slippage budget from the active policy, used to pre-clamp plan
    /// limit prices at emission time.
    async fn slippage_bps(&self) -> u32 {
        self.store
            .active_policy()
            .await
            .ok()
            .flatten()
            .map(|policy| policy.slippage_bps)
            .unwrap_or(80)
    }
}

/// Render the operator alert, capped at 4 KB on a char boundary.
fn format_alert(rule_name: &str, market_title: &str, level: String, signal: &NewSignal) -> String {
    let mut lines = vec![
        format!("*{rule_name}*"),
        format!("Market: {market_title}"),
        format!(
            "Level: {level}  Edge: {:.3}  Score: {:.1}",
            signal.edge_score, signal.score
        ),
        format!("Insight: {}", signal.reason),
    ];
    if let Some(plan) = signal.payload.suggested_trade() {
        if !plan.legs.is_empty() {
            let legs: Vec<String> = plan
                .legs
                .iter()
                .take(3)
                .map(|leg| {
                    format!(
                        "{} {}:{}",
                        leg.side.to_string().to_uppercase(),
                        leg.label,
                        leg.reference_price
                    )
                })
                .collect();
            lines.push(format!("Trade {}: {}", plan.action, legs.join(" | ")));
        }
        lines.push(format!("Plan: {}", plan.rationale));
    }
    let book = signal.payload.book_snapshot();
    if !book.is_empty() {
        let entries: Vec<String> = book
            .iter()
            .take(3)
            .map(|entry| format!("{}:{:.3}", entry.label, entry.price))
            .collect();
        lines.push(format!("Book: {}", entries.join(", ")));
    }

    let mut text = lines.join("\n");
    while text.len() > ALERT_MAX_BYTES {
        text.pop();
    }
    text
}
