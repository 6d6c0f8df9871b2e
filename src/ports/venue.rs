//! Venue Port - Upstream Market Data Interface
//!
//! Defines the trait for pulling market metadata and order books from a
//! prediction-market venue, plus the typed error taxonomy that separates
//! retriable transport failures from fatal rejections.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::market::MarketStatus;

/// Typed venue failure.
///
/// Retriable: timeouts, resets, 5xx, 429. Fatal: other 4xx and schema
/// violations — those are never retried at this layer.
#[derive(Debug, Error)]
pub enum VenueError {
  #[error("transport failure: {0}")]
  Transport(String),

  #[error("rate limited, retry after {retry_after_ms}ms")]
  RateLimited { retry_after_ms: u64 },

  #[error("server error: {status}")]
  Server { status: u16 },

  #[error("request rejected: {status} - {message}")]
  Rejected { status: u16, message: String },

  #[error("schema violation: {0}")]
  Schema(String),
}

impl VenueError {
  /// Whether the caller may retry with backoff.
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      Self::Transport(_) | Self::RateLimited { .. } | Self::Server { .. }
    )
  }
}

impl From<reqwest::Error> for VenueError {
  fn from(err: reqwest::Error) -> Self {
    Self::Transport(err.to_string())
  }
}

/// One page entry from the venue's market listing.
#[derive(Debug, Clone)]
pub struct MarketMeta {
  pub market_id: String,
  pub title: String,
  pub status: MarketStatus,
  pub starts_at: Option<DateTime<Utc>>,
  pub ends_at: Option<DateTime<Utc>>,
  pub tags: Vec<String>,
}

/// A page of market metadata with an opaque continuation cursor.
#[derive(Debug, Clone)]
pub struct MarketPage {
  pub markets: Vec<MarketMeta>,
  /// `None` when this is the last page.
  pub next_cursor: Option<String>,
}

/// One outcome of a market with its upstream token mapping.
#[derive(Debug, Clone)]
pub struct OutcomeInfo {
  /// Stable option identity (the token id on real venues).
  pub option_id: String,
  /// CLOB token id used for order-book fetches, when the venue has one.
  pub token_id: Option<String>,
  pub label: String,
  /// Venue-reported outcome price, when present.
  pub price: Option<f64>,
}

/// Detailed market view mapping labels to token identifiers.
#[derive(Debug, Clone)]
pub struct MarketDetail {
  pub meta: MarketMeta,
  pub outcomes: Vec<OutcomeInfo>,
  pub liquidity: Option<f64>,
  pub volume: Option<f64>,
}

/// Top-of-book snapshot for one token.
#[derive(Debug, Clone)]
pub struct BookTop {
  pub ts: DateTime<Utc>,
  /// Mid/last price derived from the book, when computable.
  pub price: Option<f64>,
  pub best_bid: Option<f64>,
  pub best_ask: Option<f64>,
  pub liquidity: Option<f64>,
  /// Traded volume attributed to this snapshot, when the source reports
  /// one (the live book endpoint does not; ticks then fall back to the
  /// market detail's volume).
  pub volume: Option<f64>,
}

/// Trait for venue market-data sources.
///
/// Implementors are the real REST client and the deterministic synthetic
/// source; the ingestion pipeline only ever sees this trait.
#[async_trait]
pub trait VenueSource: Send + Sync + 'static {
  /// List market metadata in a deterministic order, one page at a time.
  async fn list_markets(
    &self,
    limit: usize,
    cursor: Option<String>,
  ) -> Result<MarketPage, VenueError>;

  /// Fetch the detailed outcome/token mapping for one market.
  async fn market_detail(&self, market_id: &str) -> Result<MarketDetail, VenueError>;

  /// Fetch an order-book snapshot for one token. Cached with a short TTL
  /// by the implementation; a cache hit performs no network call.
  async fn order_book(&self, token_id: &str) -> Result<BookTop, VenueError>;

  /// Short label used for metric/source tagging.
  fn label(&self) -> &'static str;
}
