//! Polymarket Venue Client - Rate-limited REST adapter
//!
//! Pulls market metadata from the Gamma API and order books from the CLOB
//! API, with bounded concurrency, exponential backoff on retriable
//! failures, and short-TTL response caches. Gamma encodes several list
//! fields (`outcomes`, `outcomePrices`, `clobTokenIds`) as JSON strings;
//! decoding is defensive and a malformed record surfaces as a schema error
//! for that record only.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::domain::market::MarketStatus;
use crate::ports::venue::{
    BookTop, MarketDetail, MarketMeta, MarketPage, OutcomeInfo, VenueError, VenueSource,
};

use super::cache::TtlCache;

const DEFAULT_GAMMA_URL: &str = "https://gamma-api.polymarket.com";
const DEFAULT_CLOB_URL: &str = "https://clob.polymarket.com";

/// Detail responses change slowly; books are near-real-time.
const DETAIL_TTL: Duration = Duration::from_secs(120);
const BOOK_TTL: Duration = Duration::from_secs(5);

/// Configuration for the venue client.
#[derive(Debug, Clone)]
pub struct VenueConfig {
    pub gamma_url: String,
    pub clob_url: String,
    /// Per-request deadline.
    pub timeout: Duration,
    /// Maximum concurrent outbound requests.
    pub max_concurrent: usize,
    /// Retries on retriable errors before surfacing the typed failure.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub backoff_base: Duration,
    /// Backoff ceiling.
    pub backoff_max: Duration,
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            gamma_url: DEFAULT_GAMMA_URL.to_string(),
            clob_url: DEFAULT_CLOB_URL.to_string(),
            timeout: Duration::from_secs(10),
            max_concurrent: 10,
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }
}

/// REST client for the live venue.
pub struct PolymarketVenue {
    http: Client,
    config: VenueConfig,
    semaphore: Arc<Semaphore>,
    detail_cache: TtlCache<String, MarketDetail>,
    book_cache: TtlCache<String, BookTop>,
    /// Outbound request counter (`requests_total{endpoint}`), when wired.
    requests: Option<prometheus::IntCounterVec>,
}

impl PolymarketVenue {
    pub fn new(config: VenueConfig) -> Result<Self, VenueError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(|e| VenueError::Transport(e.to_string()))?;

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));

        Ok(Self {
            http,
            config,
            semaphore,
            detail_cache: TtlCache::new(DETAIL_TTL),
            book_cache: TtlCache::new(BOOK_TTL),
            requests: None,
        })
    }

    /// Wire the `requests_total{endpoint}` counter.
    pub fn with_request_counter(mut self, counter: prometheus::IntCounterVec) -> Self {
        self.requests = Some(counter);
        self
    }

    /// Execute a GET with concurrency limiting, classification, and
    /// backoff-with-jitter retries on retriable failures.
    async fn get_json<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &'static str,
        url: &str,
    ) -> Result<T, VenueError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| VenueError::Transport("request limiter closed".into()))?;

        let mut attempt = 0u32;
        loop {
            if let Some(requests) = &self.requests {
                requests.with_label_values(&[endpoint]).inc();
            }

            let outcome = self.attempt_get(url).await;
            match outcome {
                Ok(response) => {
                    return response
                        .json::<T>()
                        .await
                        .map_err(|e| VenueError::Schema(e.to_string()));
                }
                Err(err) if err.is_retriable() && attempt < self.config.max_retries => {
                    let delay = self.backoff_delay(attempt, &err);
                    debug!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retriable venue error, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// One request attempt, classified into the venue error taxonomy.
    async fn attempt_get(&self, url: &str) -> Result<reqwest::Response, VenueError> {
        let response = self.http.get(url).send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(|secs| secs * 1000)
                    .unwrap_or(1000);
                Err(VenueError::RateLimited { retry_after_ms })
            }
            status if status.is_server_error() => Err(VenueError::Server {
                status: status.as_u16(),
            }),
            status => {
                let message = response.text().await.unwrap_or_default();
                Err(VenueError::Rejected {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }

    /// `min(max_backoff, base * 2^attempt)` with ±50% jitter; a 429's
    /// retry-after hint takes precedence as the floor.
    fn backoff_delay(&self, attempt: u32, err: &VenueError) -> Duration {
        let base = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.config.backoff_max);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let jittered = base.mul_f64(jitter).min(self.config.backoff_max);
        match err {
            VenueError::RateLimited { retry_after_ms } => {
                jittered.max(Duration::from_millis(*retry_after_ms))
            }
            _ => jittered,
        }
    }
}

#[async_trait]
impl VenueSource for PolymarketVenue {
    async fn list_markets(
        &self,
        limit: usize,
        cursor: Option<String>,
    ) -> Result<MarketPage, VenueError> {
        let offset: usize = cursor
            .as_deref()
            .map(|c| c.parse().map_err(|_| VenueError::Schema(format!("bad cursor: {c}"))))
            .transpose()?
            .unwrap_or(0);

        let url = format!(
            "{}/markets?limit={}&offset={}&closed=false&order=id&ascending=true",
            self.config.gamma_url, limit, offset
        );
        let raw: Vec<GammaMarket> = self.get_json("gamma_markets", &url).await?;
        let page_len = raw.len();

        let markets = raw.into_iter().map(|m| m.into_meta()).collect();
        let next_cursor = if page_len == limit && limit > 0 {
            Some((offset + page_len).to_string())
        } else {
            None
        };

        Ok(MarketPage {
            markets,
            next_cursor,
        })
    }

    async fn market_detail(&self, market_id: &str) -> Result<MarketDetail, VenueError> {
        let key = market_id.to_string();
        if let Some(cached) = self.detail_cache.get(&key).await {
            return Ok(cached);
        }

        let url = format!("{}/markets/{}", self.config.gamma_url, market_id);
        let raw: GammaMarket = self.get_json("gamma_detail", &url).await?;
        let detail = raw.into_detail()?;

        self.detail_cache.insert(key, detail.clone()).await;
        Ok(detail)
    }

    async fn order_book(&self, token_id: &str) -> Result<BookTop, VenueError> {
        let key = token_id.to_string();
        if let Some(cached) = self.book_cache.get(&key).await {
            return Ok(cached);
        }

        let url = format!("{}/book?token_id={}", self.config.clob_url, token_id);
        let raw: BookResponse = self.get_json("clob_book", &url).await?;
        let top = raw.into_top();

        self.book_cache.insert(key, top.clone()).await;
        Ok(top)
    }

    fn label(&self) -> &'static str {
        "polymarket"
    }
}

// ── Wire types ──────────────────────────────────────────────

/// Market record from the Gamma API.
///
/// List-shaped fields arrive either as JSON arrays or as JSON-encoded
/// strings depending on the endpoint; both forms are accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    id: serde_json::Value,
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    closed: Option<bool>,
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    outcomes: Option<serde_json::Value>,
    #[serde(default)]
    outcome_prices: Option<serde_json::Value>,
    #[serde(default)]
    clob_token_ids: Option<serde_json::Value>,
    #[serde(default, alias = "categories")]
    tags: Option<serde_json::Value>,
    #[serde(default, alias = "liquidityClob")]
    liquidity: Option<serde_json::Value>,
    #[serde(default, alias = "volume24hrClob")]
    volume24hr: Option<serde_json::Value>,
}

impl GammaMarket {
    fn market_id(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn into_meta(self) -> MarketMeta {
        let market_id = self.market_id();
        let status = if self.closed.unwrap_or(false) {
            MarketStatus::Closed
        } else {
            MarketStatus::Open
        };
        MarketMeta {
            market_id,
            title: self
                .question
                .or(self.title)
                .unwrap_or_else(|| "untitled".to_string()),
            status,
            starts_at: self.start_date.as_deref().and_then(parse_iso),
            ends_at: self.end_date.as_deref().and_then(parse_iso),
            tags: parse_string_list(self.tags.as_ref()),
        }
    }

    fn into_detail(self) -> Result<MarketDetail, VenueError> {
        let market_id = self.market_id();
        let outcomes = parse_string_list(self.outcomes.as_ref());
        if outcomes.is_empty() {
            return Err(VenueError::Schema(format!(
                "market {market_id}: missing outcomes"
            )));
        }
        let tokens = parse_string_list(self.clob_token_ids.as_ref());
        let prices = parse_float_list(self.outcome_prices.as_ref());
        let liquidity = parse_f64(self.liquidity.as_ref());
        let volume = parse_f64(self.volume24hr.as_ref());

        let outcome_infos = outcomes
            .iter()
            .enumerate()
            .map(|(idx, label)| {
                let token_id = tokens.get(idx).cloned();
                OutcomeInfo {
                    option_id: token_id
                        .clone()
                        .unwrap_or_else(|| format!("{market_id}-{idx}")),
                    token_id,
                    label: label.clone(),
                    price: prices.get(idx).copied(),
                }
            })
            .collect();

        Ok(MarketDetail {
            meta: self.into_meta(),
            outcomes: outcome_infos,
            liquidity,
            volume,
        })
    }
}

/// Order book response from the CLOB API.
#[derive(Debug, Clone, Deserialize)]
struct BookResponse {
    #[serde(default)]
    bids: Vec<BookLevel>,
    #[serde(default)]
    asks: Vec<BookLevel>,
    #[serde(default)]
    timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct BookLevel {
    price: String,
    size: String,
}

impl BookResponse {
    fn into_top(self) -> BookTop {
        let best_bid = self
            .bids
            .iter()
            .filter_map(|l| l.price.parse::<f64>().ok())
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.max(p))));
        let best_ask = self
            .asks
            .iter()
            .filter_map(|l| l.price.parse::<f64>().ok())
            .fold(None::<f64>, |acc, p| Some(acc.map_or(p, |a| a.min(p))));
        let price = match (best_bid, best_ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            (Some(bid), None) => Some(bid),
            (None, Some(ask)) => Some(ask),
            (None, None) => None,
        };
        // Depth at top of book stands in for venue liquidity on the book path.
        let liquidity = {
            let bid_size = self.bids.first().and_then(|l| l.size.parse::<f64>().ok());
            let ask_size = self.asks.first().and_then(|l| l.size.parse::<f64>().ok());
            match (bid_size, ask_size) {
                (None, None) => None,
                (b, a) => Some(b.unwrap_or(0.0) + a.unwrap_or(0.0)),
            }
        };
        let ts = self
            .timestamp
            .as_deref()
            .and_then(|raw| raw.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| {
                warn!("Book snapshot missing timestamp, using wall clock");
                Utc::now()
            });

        BookTop {
            ts,
            price,
            best_bid,
            best_ask,
            liquidity,
            volume: None,
        }
    }
}

// ── Decoding helpers ────────────────────────────────────────

fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Accept `["a","b"]`, `"[\"a\",\"b\"]"`, or a bare string.
fn parse_string_list(raw: Option<&serde_json::Value>) -> Vec<String> {
    match raw {
        None | Some(serde_json::Value::Null) => vec![],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(serde_json::Value::String(s)) => match serde_json::from_str::<Vec<String>>(s) {
            Ok(items) => items,
            Err(_) if !s.is_empty() => vec![s.clone()],
            Err(_) => vec![],
        },
        Some(_) => vec![],
    }
}

fn parse_float_list(raw: Option<&serde_json::Value>) -> Vec<f64> {
    parse_string_list(raw)
        .iter()
        .filter_map(|item| item.parse::<f64>().ok())
        .collect()
}

fn parse_f64(raw: Option<&serde_json::Value>) -> Option<f64> {
    match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}
