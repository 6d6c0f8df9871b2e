//! Tick time-series queries.
//!
//! Ticks are append-only; replays are absorbed by the composite primary
//! key. The hot read paths are latest-per-option and a bounded rolling
//! window, both served by the `(market_id, ts_ms DESC)` index.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;

use crate::domain::market::Tick;

use super::{from_ms, to_ms, SqliteStore};

impl SqliteStore {
    /// Append ticks, silently skipping exact key replays.
    pub async fn insert_ticks(&self, ticks: &[Tick]) -> Result<usize> {
        let mut written = 0usize;
        for tick in ticks {
            let result = sqlx::query(
                r#"
                INSERT INTO tick (ts_ms, market_id, option_id, price, volume, best_bid, best_ask, liquidity)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ON CONFLICT (ts_ms, market_id, option_id) DO NOTHING
                "#,
            )
            .bind(to_ms(tick.ts))
            .bind(&tick.market_id)
            .bind(&tick.option_id)
            .bind(tick.price)
            .bind(tick.volume)
            .bind(tick.best_bid)
            .bind(tick.best_ask)
            .bind(tick.liquidity)
            .execute(self.pool())
            .await
            .context("Failed to insert tick")?;
            written += result.rows_affected() as usize;
        }
        Ok(written)
    }

    /// Latest tick per option for one market.
    pub async fn latest_ticks_by_market(
        &self,
        market_id: &str,
    ) -> Result<HashMap<String, Tick>> {
        let rows = sqlx::query(
            r#"
            SELECT t.ts_ms, t.market_id, t.option_id, t.price, t.volume, t.best_bid, t.best_ask, t.liquidity
            FROM tick t
            JOIN (
                SELECT option_id, MAX(ts_ms) AS max_ts
                FROM tick WHERE market_id = ?1 GROUP BY option_id
            ) latest ON latest.option_id = t.option_id AND latest.max_ts = t.ts_ms
            WHERE t.market_id = ?1
            "#,
        )
        .bind(market_id)
        .fetch_all(self.pool())
        .await
        .context("Failed to load latest ticks")?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let tick = row_to_tick(row);
                (tick.option_id.clone(), tick)
            })
            .collect())
    }

    /// Rolling window of ticks for one market, newest first.
    pub async fn recent_ticks(
        &self,
        market_id: &str,
        lookback_secs: u64,
        limit: i64,
    ) -> Result<Vec<Tick>> {
        let cutoff = to_ms(Utc::now() - Duration::seconds(lookback_secs as i64));
        let rows = sqlx::query(
            r#"
            SELECT ts_ms, market_id, option_id, price, volume, best_bid, best_ask, liquidity
            FROM tick
            WHERE market_id = ?1 AND ts_ms >= ?2
            ORDER BY ts_ms DESC
            LIMIT ?3
            "#,
        )
        .bind(market_id)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("Failed to load recent ticks")?;

        Ok(rows.into_iter().map(row_to_tick).collect())
    }

    /// Count of stored ticks for one `(market_id, option_id)` pair.
    pub async fn tick_count(&self, market_id: &str, option_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(1) AS c FROM tick WHERE market_id = ?1 AND option_id = ?2",
        )
        .bind(market_id)
        .bind(option_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get("c"))
    }

    /// Timestamp of the newest stored tick, across all markets.
    pub async fn latest_tick_ts(&self) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT MAX(ts_ms) AS max_ts FROM tick")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get::<Option<i64>, _>("max_ts").map(from_ms))
    }
}

fn row_to_tick(row: sqlx::sqlite::SqliteRow) -> Tick {
    Tick {
        ts: from_ms(row.get("ts_ms")),
        market_id: row.get("market_id"),
        option_id: row.get("option_id"),
        price: row.get("price"),
        volume: row.get("volume"),
        best_bid: row.get("best_bid"),
        best_ask: row.get("best_ask"),
        liquidity: row.get("liquidity"),
    }
}
