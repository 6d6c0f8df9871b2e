//! Configuration Module - TOML-based Runtime Configuration
//!
//! Loads and validates configuration from `config.toml` with environment
//! variable overrides for secrets and deployment knobs. All scheduler
//! cadences, risk caps, and transport credentials are externalized here -
//! nothing is hardcoded in the domain layer.

pub mod loader;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::intent::ExecutionMode;

/// Upstream data source selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  /// Deterministic synthetic venue (offline, seeded).
  Mock,
  /// Live Polymarket REST endpoints.
  Real,
}

/// Top-level application configuration.
///
/// Loaded from `config.toml` at startup. All fields are validated before
/// any loop starts; a bad configuration refuses to boot.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
  /// Process identity and mode.
  pub app: AppSection,
  /// Database connection.
  pub database: DatabaseSection,
  /// Ingestion pipeline knobs.
  #[serde(default)]
  pub ingestion: IngestionSection,
  /// Rule engine knobs.
  #[serde(default)]
  pub rules: RulesSection,
  /// Execution policy defaults.
  #[serde(default)]
  pub execution: ExecutionSection,
  /// Alert transport settings.
  #[serde(default)]
  pub alerts: AlertsSection,
  /// Metrics endpoint settings.
  #[serde(default)]
  pub metrics: MetricsSection,
}

/// Process identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
  /// Human-readable process name.
  pub name: String,
  /// Log level (trace, debug, info, warn, error).
  #[serde(default = "default_log_level")]
  pub log_level: String,
  /// Which venue implementation to drive.
  #[serde(default = "default_data_source")]
  pub data_source: DataSource,
  /// Seed for the synthetic venue (reproducible offline runs).
  #[serde(default = "default_seed")]
  pub synthetic_seed: u64,
}

/// Database connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
  /// SQLite DSN; overridden by `DATABASE_URL`.
  pub url: String,
}

/// Ingestion pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestionSection {
  /// Cycle cadence in milliseconds.
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
  /// Markets per polling chunk.
  #[serde(default = "default_chunk_size")]
  pub chunk_size: usize,
  /// Chunks processed in parallel per cycle.
  #[serde(default = "default_max_concurrency")]
  pub max_concurrency: usize,
  /// Heartbeat floor for unchanged ticks (seconds).
  #[serde(default = "default_min_flush_interval_secs")]
  pub min_flush_interval_secs: u64,
  /// How often the tracked market list is refreshed (seconds).
  #[serde(default = "default_market_refresh_secs")]
  pub market_refresh_secs: u64,
  /// Upper bound on tracked markets.
  #[serde(default = "default_market_limit")]
  pub market_limit: usize,
  /// Retries per chunk before the failure is recorded.
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  /// Base backoff delay (milliseconds).
  #[serde(default = "default_backoff_base_ms")]
  pub backoff_base_ms: u64,
  /// Backoff ceiling (milliseconds).
  #[serde(default = "default_backoff_max_ms")]
  pub backoff_max_ms: u64,
  /// Outbound request deadline (seconds).
  #[serde(default = "default_request_timeout_secs")]
  pub request_timeout_secs: u64,
}

impl Default for IngestionSection {
  fn default() -> Self {
    Self {
      poll_interval_ms: default_poll_interval_ms(),
      chunk_size: default_chunk_size(),
      max_concurrency: default_max_concurrency(),
      min_flush_interval_secs: default_min_flush_interval_secs(),
      market_refresh_secs: default_market_refresh_secs(),
      market_limit: default_market_limit(),
      max_retries: default_max_retries(),
      backoff_base_ms: default_backoff_base_ms(),
      backoff_max_ms: default_backoff_max_ms(),
      request_timeout_secs: default_request_timeout_secs(),
    }
  }
}

/// Rule engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RulesSection {
  /// Evaluation cadence in milliseconds.
  #[serde(default = "default_eval_interval_ms")]
  pub eval_interval_ms: u64,
  /// Rolling tick window pulled per market (seconds).
  #[serde(default = "default_lookback_secs")]
  pub lookback_secs: u64,
  /// Directory of rule YAML documents.
  #[serde(default = "default_rules_dir")]
  pub rules_dir: String,
  /// Synonym group document path.
  #[serde(default = "default_synonyms_path")]
  pub synonyms_path: String,
  /// How often the rules directory is re-hashed for changes (seconds).
  #[serde(default = "default_reload_check_secs")]
  pub reload_check_secs: u64,
  /// Emissions allowed per breaker window before tripping.
  #[serde(default = "default_breaker_max")]
  pub breaker_max: usize,
  /// Breaker rate window (seconds).
  #[serde(default = "default_breaker_window_secs")]
  pub breaker_window_secs: u64,
  /// Initial OPEN cooldown (seconds).
  #[serde(default = "default_breaker_cooldown_secs")]
  pub breaker_cooldown_secs: u64,
  /// Ceiling for the doubling cooldown (seconds).
  #[serde(default = "default_breaker_max_cooldown_secs")]
  pub breaker_max_cooldown_secs: u64,
}

impl Default for RulesSection {
  fn default() -> Self {
    Self {
      eval_interval_ms: default_eval_interval_ms(),
      lookback_secs: default_lookback_secs(),
      rules_dir: default_rules_dir(),
      synonyms_path: default_synonyms_path(),
      reload_check_secs: default_reload_check_secs(),
      breaker_max: default_breaker_max(),
      breaker_window_secs: default_breaker_window_secs(),
      breaker_cooldown_secs: default_breaker_cooldown_secs(),
      breaker_max_cooldown_secs: default_breaker_max_cooldown_secs(),
    }
  }
}

/// Execution policy defaults, persisted as the active policy at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionSection {
  #[serde(default = "default_exec_mode")]
  pub mode: ExecutionMode,
  /// Per-order notional cap (decimal string in TOML).
  #[serde(default = "default_max_notional_per_order")]
  pub max_notional_per_order: Decimal,
  #[serde(default = "default_max_concurrent_orders")]
  pub max_concurrent_orders: i64,
  /// Daily notional cap (decimal string in TOML).
  #[serde(default = "default_max_daily_notional")]
  pub max_daily_notional: Decimal,
  /// Slippage guardrail in basis points.
  #[serde(default = "default_slippage_bps")]
  pub slippage_bps: u32,
  /// Default intent TTL (seconds).
  #[serde(default = "default_ttl_secs")]
  pub default_ttl_secs: i64,
}

impl Default for ExecutionSection {
  fn default() -> Self {
    Self {
      mode: default_exec_mode(),
      max_notional_per_order: default_max_notional_per_order(),
      max_concurrent_orders: default_max_concurrent_orders(),
      max_daily_notional: default_max_daily_notional(),
      slippage_bps: default_slippage_bps(),
      default_ttl_secs: default_ttl_secs(),
    }
  }
}

/// Alert transport configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertsSection {
  /// Enable real delivery; otherwise every send is a dry run.
  #[serde(default)]
  pub enabled: bool,
  /// Bot token; overridden by `TELEGRAM_BOT_TOKEN`.
  #[serde(default)]
  pub bot_token: Option<String>,
  /// Chat id; overridden by `TELEGRAM_CHAT_ID`.
  #[serde(default)]
  pub chat_id: Option<String>,
  /// Transport-side dedupe window (seconds).
  #[serde(default = "default_dedupe_ttl_secs")]
  pub dedupe_ttl_secs: u64,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsSection {
  #[serde(default = "default_metrics_enabled")]
  pub enabled: bool,
  #[serde(default = "default_metrics_addr")]
  pub bind_address: String,
}

impl Default for MetricsSection {
  fn default() -> Self {
    Self {
      enabled: default_metrics_enabled(),
      bind_address: default_metrics_addr(),
    }
  }
}

// Default value functions for serde

fn default_log_level() -> String {
  "info".to_string()
}

fn default_data_source() -> DataSource {
  DataSource::Mock
}

fn default_seed() -> u64 {
  42
}

fn default_poll_interval_ms() -> u64 {
  2000
}

fn default_chunk_size() -> usize {
  25
}

fn default_max_concurrency() -> usize {
  3
}

fn default_min_flush_interval_secs() -> u64 {
  15
}

fn default_market_refresh_secs() -> u64 {
  300
}

fn default_market_limit() -> usize {
  200
}

fn default_max_retries() -> u32 {
  3
}

fn default_backoff_base_ms() -> u64 {
  250
}

fn default_backoff_max_ms() -> u64 {
  10_000
}

fn default_request_timeout_secs() -> u64 {
  10
}

fn default_eval_interval_ms() -> u64 {
  2000
}

fn default_lookback_secs() -> u64 {
  300
}

fn default_rules_dir() -> String {
  "configs/rules".to_string()
}

fn default_synonyms_path() -> String {
  "configs/synonyms.yaml".to_string()
}

fn default_reload_check_secs() -> u64 {
  60
}

fn default_breaker_max() -> usize {
  5
}

fn default_breaker_window_secs() -> u64 {
  60
}

fn default_breaker_cooldown_secs() -> u64 {
  300
}

fn default_breaker_max_cooldown_secs() -> u64 {
  3600
}

fn default_exec_mode() -> ExecutionMode {
  ExecutionMode::SemiAuto
}

fn default_max_notional_per_order() -> Decimal {
  Decimal::new(200, 0)
}

fn default_max_concurrent_orders() -> i64 {
  2
}

fn default_max_daily_notional() -> Decimal {
  Decimal::new(1000, 0)
}

fn default_slippage_bps() -> u32 {
  80
}

fn default_ttl_secs() -> i64 {
  60
}

fn default_dedupe_ttl_secs() -> u64 {
  300
}

fn default_metrics_enabled() -> bool {
  true
}

fn default_metrics_addr() -> String {
  "0.0.0.0:9090".to_string()
}
