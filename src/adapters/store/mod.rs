//! SQLite Store - Relational Persistence Adapter
//!
//! One `SqlitePool` shared by every loop. The schema is created
//! idempotently at connect time; all timestamps are stored as integer Unix
//! milliseconds and all fund-like quantities as decimal strings, so nothing
//! round-trips through binary floats on the risk path.

mod execution;
mod markets;
mod signals;
mod ticks;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

pub use execution::NewIntent;
pub use markets::SynonymGroupSpec;
pub use signals::KpiRow;

/// Relational store over SQLite.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect to the given DSN, creating the file and schema as needed.
    pub async fn connect(url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = url
            .parse::<SqliteConnectOptions>()
            .context("Invalid database URL")?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to open database")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        info!(url, "Database ready");
        Ok(store)
    }

    /// Private in-memory database, used by the test suites.
    ///
    /// A single connection keeps every query on the same memory instance.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create tables and indexes if they do not exist.
    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS market (
                market_id   TEXT PRIMARY KEY,
                title       TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'open',
                starts_at   INTEGER,
                ends_at     INTEGER,
                tags_json   TEXT NOT NULL DEFAULT '[]',
                embedding   TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS market_option (
                option_id   TEXT PRIMARY KEY,
                market_id   TEXT NOT NULL REFERENCES market(market_id),
                label       TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tick (
                ts_ms       INTEGER NOT NULL,
                market_id   TEXT NOT NULL,
                option_id   TEXT NOT NULL,
                price       REAL NOT NULL,
                volume      REAL,
                best_bid    REAL,
                best_ask    REAL,
                liquidity   REAL,
                PRIMARY KEY (ts_ms, market_id, option_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_tick_market_ts ON tick(market_id, ts_ms DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS rule_def (
                rule_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                rule_type   TEXT NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                version     INTEGER NOT NULL DEFAULT 1,
                raw_source  TEXT NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS signal (
                signal_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                market_id   TEXT NOT NULL,
                option_id   TEXT,
                rule_id     INTEGER NOT NULL REFERENCES rule_def(rule_id),
                level       TEXT NOT NULL,
                score       REAL NOT NULL,
                edge_score  REAL NOT NULL,
                reason      TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_signal_market ON signal(market_id, created_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_signal_rule ON signal(rule_id, market_id, created_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS synonym_group (
                group_id    INTEGER PRIMARY KEY AUTOINCREMENT,
                method      TEXT NOT NULL,
                title       TEXT NOT NULL UNIQUE,
                updated_at  INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS synonym_group_member (
                group_id    INTEGER NOT NULL REFERENCES synonym_group(group_id),
                market_id   TEXT NOT NULL,
                UNIQUE (group_id, market_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS execution_policy (
                policy_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name        TEXT NOT NULL UNIQUE,
                mode        TEXT NOT NULL,
                max_notional_per_order TEXT NOT NULL,
                max_concurrent_orders  INTEGER NOT NULL,
                max_daily_notional     TEXT NOT NULL,
                slippage_bps INTEGER NOT NULL,
                enabled     INTEGER NOT NULL DEFAULT 1,
                updated_at  INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS order_intent (
                intent_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                signal_id   INTEGER NOT NULL REFERENCES signal(signal_id),
                market_id   TEXT NOT NULL,
                option_id   TEXT,
                side        TEXT NOT NULL,
                qty         TEXT NOT NULL,
                limit_price TEXT,
                ttl_secs    INTEGER NOT NULL,
                status      TEXT NOT NULL DEFAULT 'suggested',
                policy_id   INTEGER NOT NULL REFERENCES execution_policy(policy_id),
                detail_json TEXT NOT NULL,
                fill_price  TEXT,
                created_at  INTEGER NOT NULL,
                updated_at  INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_intent_market_status ON order_intent(market_id, status)",
            r#"
            CREATE TABLE IF NOT EXISTS rule_kpi_daily (
                day         TEXT NOT NULL,
                rule_type   TEXT NOT NULL,
                signals     INTEGER NOT NULL DEFAULT 0,
                p1_signals  INTEGER NOT NULL DEFAULT 0,
                avg_gap     REAL,
                est_edge_bps REAL,
                PRIMARY KEY (day, rule_type)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                audit_id    INTEGER PRIMARY KEY AUTOINCREMENT,
                actor       TEXT NOT NULL,
                action      TEXT NOT NULL,
                target_id   TEXT,
                correlation_id TEXT,
                meta_json   TEXT NOT NULL DEFAULT '{}',
                created_at  INTEGER NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("Failed to apply schema statement")?;
        }
        Ok(())
    }
}

// ── Column codecs ───────────────────────────────────────────

/// Timestamps are persisted as Unix milliseconds.
pub(crate) fn to_ms(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Decimals are persisted as canonical strings.
pub(crate) fn dec_to_str(value: Decimal) -> String {
    value.normalize().to_string()
}

pub(crate) fn dec_from_str(raw: &str) -> Decimal {
    raw.parse().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.ensure_schema().await.unwrap();
        store.ensure_schema().await.unwrap();
    }

    #[test]
    fn timestamp_codec_round_trips() {
        let now = Utc::now();
        let back = from_ms(to_ms(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn decimal_codec_round_trips() {
        let value: Decimal = "205.01".parse().unwrap();
        assert_eq!(dec_from_str(&dec_to_str(value)), value);
    }
}
