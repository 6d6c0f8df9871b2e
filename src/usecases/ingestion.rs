//! Ingestion Pipeline - Bounded-Concurrency Venue Poller
//!
//! Drives the venue client on a fixed cadence: refresh the tracked market
//! list, fan detail/book fetches out over chunked markets with bounded
//! parallelism, dedup against a last-value cache, and land fresh ticks in
//! the store with freshness telemetry. Cycles never overlap; an overlong
//! cycle simply starts the next one immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::adapters::metrics::MetricsRegistry;
use crate::adapters::store::SqliteStore;
use crate::config::IngestionSection;
use crate::domain::market::{Market, MarketOption, Tick};
use crate::ports::venue::{VenueError, VenueSource};

/// Last written value per `(market_id, option_id)`, for dedup and the
/// per-key timestamp monotonicity guarantee.
struct LastValue {
    price_tuple: (f64, f64, f64),
    tick_ts: DateTime<Utc>,
    written_at: Instant,
}

/// Counters from one ingestion cycle.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleStats {
    pub polled: usize,
    pub written: usize,
    pub deduped: usize,
    pub regressed: usize,
    pub failed_chunks: usize,
}

/// The ingestion loop.
pub struct IngestionPipeline {
    venue: Arc<dyn VenueSource>,
    store: Arc<SqliteStore>,
    metrics: Arc<MetricsRegistry>,
    config: IngestionSection,
    last_values: HashMap<(String, String), LastValue>,
    tracked: Vec<String>,
    last_refresh: Option<Instant>,
}

impl IngestionPipeline {
    pub fn new(
        venue: Arc<dyn VenueSource>,
        store: Arc<SqliteStore>,
        metrics: Arc<MetricsRegistry>,
        config: IngestionSection,
    ) -> Self {
        Self {
            venue,
            store,
            metrics,
            config,
            last_values: HashMap::new(),
            tracked: Vec::new(),
            last_refresh: None,
        }
    }

    /// Run until shutdown. Each iteration performs one cycle, then sleeps
    /// whatever remains of `poll_interval_ms` (zero when the cycle ran
    /// long - no overlap, no queueing).
    pub async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        info!(
            source = self.venue.label(),
            interval_ms = self.config.poll_interval_ms,
            "Ingestion pipeline started"
        );

        loop {
            let started = Instant::now();
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                result = self.run_cycle() => {
                    if let Err(err) = result {
                        warn!(error = %err, "Ingestion cycle failed");
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

        info!("Ingestion pipeline stopped");
        Ok(())
    }

    /// One full polling cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleStats> {
        let started = Instant::now();
        let source = self.venue.label();
        let mut stats = CycleStats::default();

        self.refresh_markets_if_stale().await?;
        if self.tracked.is_empty() {
            return Ok(stats);
        }

        // Chunk the markets and poll up to max_concurrency chunks at once.
        let chunks: Vec<Vec<String>> = self
            .tracked
            .chunks(self.config.chunk_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let venue = Arc::clone(&self.venue);
            let metrics = Arc::clone(&self.metrics);
            let semaphore = Arc::clone(&semaphore);
            let config = self.config.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                Some(poll_chunk_with_backoff(venue, metrics, &config, &chunk).await)
            }));
        }

        let mut candidates: Vec<Tick> = Vec::new();
        let mut options: Vec<MarketOption> = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(Some(Ok(chunk_result))) => {
                    candidates.extend(chunk_result.ticks);
                    options.extend(chunk_result.options);
                }
                Ok(Some(Err(err))) => {
                    stats.failed_chunks += 1;
                    self.metrics
                        .ingest_errors_total
                        .with_label_values(&[source])
                        .inc();
                    warn!(error = %err, "Chunk poll exhausted retries");
                }
                Ok(None) => {}
                Err(err) => {
                    stats.failed_chunks += 1;
                    warn!(error = %err, "Chunk task panicked");
                }
            }
        }
        stats.polled = candidates.len();

        if !options.is_empty() {
            self.store.upsert_options(&options).await?;
        }

        let fresh = self.filter_ticks(candidates, &mut stats);
        if !fresh.is_empty() {
            stats.written = self.store.insert_ticks(&fresh).await?;
            if let Some(max_ts) = fresh.iter().map(|t| t.ts).max() {
                self.metrics
                    .ingest_last_tick_timestamp
                    .with_label_values(&[source])
                    .set(max_ts.timestamp() as f64);
            }
        }
        if stats.deduped + stats.regressed > 0 {
            self.metrics
                .ticks_deduped_total
                .with_label_values(&[source])
                .inc_by((stats.deduped + stats.regressed) as u64);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics
            .ingest_latency_ms
            .with_label_values(&[source])
            .observe(elapsed_ms);
        debug!(
            polled = stats.polled,
            written = stats.written,
            deduped = stats.deduped,
            "Ingestion cycle complete"
        );
        Ok(stats)
    }

    /// Re-list tracked markets when the refresh TTL has lapsed.
    async fn refresh_markets_if_stale(&mut self) -> Result<()> {
        let stale = self
            .last_refresh
            .map(|at| at.elapsed() >= Duration::from_secs(self.config.market_refresh_secs))
            .unwrap_or(true);
        if !stale {
            return Ok(());
        }

        let mut tracked = Vec::new();
        let mut cursor = None;
        loop {
            let remaining = self.config.market_limit.saturating_sub(tracked.len());
            if remaining == 0 {
                break;
            }
            let page = match self
                .venue
                .list_markets(remaining.min(100), cursor.clone())
                .await
            {
                Ok(page) => page,
                Err(err) if err.is_retriable() => {
                    // A failed refresh keeps the previous tracking set.
                    warn!(error = %err, "Market list refresh failed, keeping previous set");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };

            for meta in &page.markets {
                let market = Market {
                    market_id: meta.market_id.clone(),
                    title: meta.title.clone(),
                    status: meta.status,
                    starts_at: meta.starts_at,
                    ends_at: meta.ends_at,
                    tags: meta.tags.clone(),
                    embedding: None,
                };
                self.store.upsert_market(&market).await?;
                tracked.push(meta.market_id.clone());
            }

            cursor = page.next_cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(count = tracked.len(), "Tracked market list refreshed");
        self.tracked = tracked;
        self.last_refresh = Some(Instant::now());
        Ok(())
    }

    /// Apply the ordering guarantee and the last-value dedup rule.
    fn filter_ticks(&mut self, candidates: Vec<Tick>, stats: &mut CycleStats) -> Vec<Tick> {
        let min_flush = Duration::from_secs(self.config.min_flush_interval_secs);
        let now = Instant::now();
        let mut fresh = Vec::with_capacity(candidates.len());

        for tick in candidates {
            let key = (tick.market_id.clone(), tick.option_id.clone());
            match self.last_values.get(&key) {
                Some(last) if tick.ts < last.tick_ts => {
                    // Late-arriving response would violate ts monotonicity.
                    stats.regressed += 1;
                    continue;
                }
                Some(last)
                    if last.price_tuple == tick.price_tuple()
                        && now.duration_since(last.written_at) < min_flush =>
                {
                    stats.deduped += 1;
                    continue;
                }
                _ => {}
            }
            self.last_values.insert(
                key,
                LastValue {
                    price_tuple: tick.price_tuple(),
                    tick_ts: tick.ts,
                    written_at: now,
                },
            );
            fresh.push(tick);
        }
        fresh
    }
}

struct ChunkResult {
    ticks: Vec<Tick>,
    options: Vec<MarketOption>,
}

/// Poll one chunk, retrying retriable failures with jittered exponential
/// backoff up to `max_retries`.
async fn poll_chunk_with_backoff(
    venue: Arc<dyn VenueSource>,
    metrics: Arc<MetricsRegistry>,
    config: &IngestionSection,
    market_ids: &[String],
) -> Result<ChunkResult, VenueError> {
    let mut attempt = 0u32;
    loop {
        match poll_chunk(&venue, &metrics, market_ids).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retriable() && attempt < config.max_retries => {
                let base = Duration::from_millis(config.backoff_base_ms)
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(Duration::from_millis(config.backoff_max_ms));
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = base.mul_f64(jitter).min(Duration::from_millis(config.backoff_max_ms));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Chunk poll backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Fetch detail and books for every market in the chunk.
///
/// Fatal per-record failures (schema violations, unknown tokens) skip the
/// record and bump a counter; they never fail the chunk.
async fn poll_chunk(
    venue: &Arc<dyn VenueSource>,
    metrics: &Arc<MetricsRegistry>,
    market_ids: &[String],
) -> Result<ChunkResult, VenueError> {
    let source = venue.label();
    let mut ticks = Vec::new();
    let mut options = Vec::new();

    for market_id in market_ids {
        let detail = match venue.market_detail(market_id).await {
            Ok(detail) => detail,
            Err(err) if err.is_retriable() => return Err(err),
            Err(err) => {
                metrics
                    .schema_errors_total
                    .with_label_values(&[source])
                    .inc();
                debug!(market_id, error = %err, "Skipping market on fatal detail error");
                continue;
            }
        };

        for outcome in &detail.outcomes {
            options.push(MarketOption {
                option_id: outcome.option_id.clone(),
                market_id: market_id.clone(),
                label: outcome.label.clone(),
            });

            let Some(token_id) = outcome.token_id.as_deref() else {
                continue;
            };
            let book = match venue.order_book(token_id).await {
                Ok(book) => book,
                Err(err) if err.is_retriable() => return Err(err),
                Err(err) => {
                    metrics
                        .schema_errors_total
                        .with_label_values(&[source])
                        .inc();
                    debug!(token_id, error = %err, "Skipping book on fatal error");
                    continue;
                }
            };

            let Some(price) = book.price.or(outcome.price) else {
                continue;
            };
            ticks.push(Tick {
                ts: book.ts,
                market_id: market_id.clone(),
                option_id: outcome.option_id.clone(),
                price,
                volume: book.volume.or(detail.volume),
                best_bid: book.best_bid.or(Some(price)),
                best_ask: book.best_ask.or(Some(price)),
                liquidity: book.liquidity.or(detail.liquidity),
            });
        }
    }

    Ok(ChunkResult { ticks, options })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::venue::SyntheticVenue;
    use crate::ports::venue::{BookTop, MarketDetail, MarketMeta, MarketPage, OutcomeInfo};
    use crate::domain::market::MarketStatus;
    use async_trait::async_trait;

    fn test_config() -> IngestionSection {
        IngestionSection {
            poll_interval_ms: 100,
            chunk_size: 2,
            max_concurrency: 2,
            min_flush_interval_secs: 30,
            market_refresh_secs: 300,
            market_limit: 10,
            max_retries: 1,
            backoff_base_ms: 1,
            backoff_max_ms: 5,
            request_timeout_secs: 1,
        }
    }

    async fn pipeline_with_synthetic() -> IngestionPipeline {
        let venue = Arc::new(SyntheticVenue::new(11));
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        IngestionPipeline::new(venue, store, metrics, test_config())
    }

    #[tokio::test]
    async fn cycle_lands_ticks_and_markets() {
        let mut pipeline = pipeline_with_synthetic().await;
        let stats = pipeline.run_cycle().await.unwrap();
        assert!(stats.written > 0);
        assert_eq!(stats.failed_chunks, 0);

        let markets = pipeline.store.list_markets(None, 10).await.unwrap();
        assert_eq!(markets.len(), 4);
        let options = pipeline.store.list_options("synth-fed").await.unwrap();
        assert_eq!(options.len(), 3);
        assert!(pipeline.store.latest_tick_ts().await.unwrap().is_some());
    }

    /// Venue double that always serves the same book.
    struct FrozenVenue;

    #[async_trait]
    impl VenueSource for FrozenVenue {
        async fn list_markets(
            &self,
            _limit: usize,
            _cursor: Option<String>,
        ) -> Result<MarketPage, VenueError> {
            Ok(MarketPage {
                markets: vec![MarketMeta {
                    market_id: "m1".into(),
                    title: "Frozen".into(),
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
                    title: "Frozen".into(),
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
            "frozen"
        }
    }

    #[tokio::test]
    async fn unchanged_book_within_flush_interval_is_deduped() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let metrics = Arc::new(MetricsRegistry::new().unwrap());
        let mut pipeline = IngestionPipeline::new(
            Arc::new(FrozenVenue),
            store,
            metrics,
            test_config(),
        );

        let first = pipeline.run_cycle().await.unwrap();
        assert_eq!(first.written, 1);

        let second = pipeline.run_cycle().await.unwrap();
        assert_eq!(second.written, 0);
        assert_eq!(second.deduped, 1);
        assert_eq!(pipeline.store.tick_count("m1", "o1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn regressed_timestamps_are_dropped() {
        let mut pipeline = pipeline_with_synthetic().await;
        let now = Utc::now();
        let newer = Tick {
            ts: now,
            market_id: "m".into(),
            option_id: "o".into(),
            price: 0.5,
            volume: None,
            best_bid: Some(0.49),
            best_ask: Some(0.51),
            liquidity: None,
        };
        let older = Tick {
            ts: now - chrono::Duration::seconds(5),
            price: 0.6,
            ..newer.clone()
        };

        let mut stats = CycleStats::default();
        let fresh = pipeline.filter_ticks(vec![newer, older], &mut stats);
        assert_eq!(fresh.len(), 1);
        assert_eq!(stats.regressed, 1);
    }
}
