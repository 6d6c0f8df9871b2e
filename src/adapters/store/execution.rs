//! Execution policy and order-intent queries.
//!
//! The intent state transition is a compare-and-set on `status`: the
//! UPDATE re-checks the expected prior state, so concurrent confirms of
//! the same intent observe exactly one winner.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::Row;

use crate::domain::intent::{
    ExecutionPolicy, IntentDetail, IntentStatus, OrderIntent,
};
use crate::domain::signal::Side;

use super::{dec_from_str, dec_to_str, from_ms, to_ms, SqliteStore};

/// Fields for a new `suggested` intent.
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub signal_id: i64,
    pub market_id: String,
    pub option_id: Option<String>,
    pub side: Side,
    pub qty: Decimal,
    pub limit_price: Option<Decimal>,
    pub ttl_secs: i64,
    pub policy_id: i64,
    pub detail: IntentDetail,
}

impl SqliteStore {
    /// Persist the configured defaults as the active policy (idempotent).
    pub async fn bootstrap_policy(
        &self,
        name: &str,
        mode: &str,
        max_notional_per_order: Decimal,
        max_concurrent_orders: i64,
        max_daily_notional: Decimal,
        slippage_bps: u32,
    ) -> Result<i64> {
        let now = to_ms(Utc::now());
        sqlx::query(
            r#"
            INSERT INTO execution_policy
                (name, mode, max_notional_per_order, max_concurrent_orders, max_daily_notional, slippage_bps, enabled, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)
            ON CONFLICT (name) DO UPDATE SET
                mode = excluded.mode,
                max_notional_per_order = excluded.max_notional_per_order,
                max_concurrent_orders = excluded.max_concurrent_orders,
                max_daily_notional = excluded.max_daily_notional,
                slippage_bps = excluded.slippage_bps,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(mode)
        .bind(dec_to_str(max_notional_per_order))
        .bind(max_concurrent_orders)
        .bind(dec_to_str(max_daily_notional))
        .bind(slippage_bps as i64)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to bootstrap policy")?;

        let row = sqlx::query("SELECT policy_id FROM execution_policy WHERE name = ?1")
            .bind(name)
            .fetch_one(self.pool())
            .await?;
        Ok(row.get("policy_id"))
    }

    /// The lowest-id enabled policy, when one exists.
    pub async fn active_policy(&self) -> Result<Option<ExecutionPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT policy_id, name, mode, max_notional_per_order, max_concurrent_orders,
                   max_daily_notional, slippage_bps, enabled
            FROM execution_policy WHERE enabled = 1 ORDER BY policy_id LIMIT 1
            "#,
        )
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_policy).transpose()
    }

    /// Load one policy by id (intents reference their policy explicitly).
    pub async fn get_policy(&self, policy_id: i64) -> Result<Option<ExecutionPolicy>> {
        let row = sqlx::query(
            r#"
            SELECT policy_id, name, mode, max_notional_per_order, max_concurrent_orders,
                   max_daily_notional, slippage_bps, enabled
            FROM execution_policy WHERE policy_id = ?1
            "#,
        )
        .bind(policy_id)
        .fetch_optional(self.pool())
        .await?;

        row.map(row_to_policy).transpose()
    }

    pub async fn create_intent(&self, intent: &NewIntent) -> Result<OrderIntent> {
        let now = to_ms(Utc::now());
        let detail = serde_json::to_string(&intent.detail)?;
        let result = sqlx::query(
            r#"
            INSERT INTO order_intent
                (signal_id, market_id, option_id, side, qty, limit_price, ttl_secs, status, policy_id, detail_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'suggested', ?8, ?9, ?10, ?10)
            "#,
        )
        .bind(intent.signal_id)
        .bind(&intent.market_id)
        .bind(&intent.option_id)
        .bind(intent.side.to_string())
        .bind(dec_to_str(intent.qty))
        .bind(intent.limit_price.map(dec_to_str))
        .bind(intent.ttl_secs)
        .bind(intent.policy_id)
        .bind(detail)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to create intent")?;

        self.get_intent(result.last_insert_rowid())
            .await?
            .context("Created intent not found")
    }

    pub async fn get_intent(&self, intent_id: i64) -> Result<Option<OrderIntent>> {
        let row = sqlx::query(
            r#"
            SELECT intent_id, signal_id, market_id, option_id, side, qty, limit_price,
                   ttl_secs, status, policy_id, detail_json, fill_price, created_at, updated_at
            FROM order_intent WHERE intent_id = ?1
            "#,
        )
        .bind(intent_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to load intent")?;

        row.map(row_to_intent).transpose()
    }

    /// Compare-and-set the intent status.
    ///
    /// Returns `true` when this caller performed the transition; `false`
    /// when the row was no longer in `from` (a concurrent writer won, or
    /// the state was stale). Illegal transitions are rejected outright.
    pub async fn transition_intent(
        &self,
        intent_id: i64,
        from: IntentStatus,
        to: IntentStatus,
        detail: Option<&IntentDetail>,
        fill_price: Option<Decimal>,
    ) -> Result<bool> {
        anyhow::ensure!(
            from.can_transition_to(to),
            "illegal intent transition {from} -> {to}"
        );

        let detail_json = detail.map(serde_json::to_string).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE order_intent
            SET status = ?1,
                detail_json = COALESCE(?2, detail_json),
                fill_price = COALESCE(?3, fill_price),
                updated_at = ?4
            WHERE intent_id = ?5 AND status = ?6
            "#,
        )
        .bind(to.to_string())
        .bind(detail_json)
        .bind(fill_price.map(dec_to_str))
        .bind(to_ms(Utc::now()))
        .bind(intent_id)
        .bind(from.to_string())
        .execute(self.pool())
        .await
        .context("Failed to transition intent")?;

        Ok(result.rows_affected() == 1)
    }

    /// Intents in `{suggested, sent}` for one market.
    pub async fn open_intents_count(&self, market_id: &str) -> Result<i64> {
        let row = sqlx::query(
            "SELECT COUNT(1) AS c FROM order_intent
             WHERE market_id = ?1 AND status IN ('suggested', 'sent')",
        )
        .bind(market_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.get("c"))
    }

    /// Sum of filled notional for the current UTC day, in decimal space.
    pub async fn daily_filled_notional(&self) -> Result<Decimal> {
        let day_start = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|dt| dt.and_utc().timestamp_millis())
            .unwrap_or(0);

        let rows = sqlx::query(
            "SELECT qty, fill_price, limit_price FROM order_intent
             WHERE status = 'filled' AND updated_at >= ?1",
        )
        .bind(day_start)
        .fetch_all(self.pool())
        .await?;

        let mut total = Decimal::ZERO;
        for row in rows {
            let qty = dec_from_str(&row.get::<String, _>("qty"));
            let price = row
                .get::<Option<String>, _>("fill_price")
                .or_else(|| row.get::<Option<String>, _>("limit_price"))
                .map(|raw| dec_from_str(&raw))
                .unwrap_or_default();
            total += qty * price;
        }
        Ok(total)
    }

    pub async fn list_intents(
        &self,
        status: Option<IntentStatus>,
        limit: i64,
    ) -> Result<Vec<OrderIntent>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    r#"
                    SELECT intent_id, signal_id, market_id, option_id, side, qty, limit_price,
                           ttl_secs, status, policy_id, detail_json, fill_price, created_at, updated_at
                    FROM order_intent WHERE status = ?1 ORDER BY created_at DESC LIMIT ?2
                    "#,
                )
                .bind(status.to_string())
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT intent_id, signal_id, market_id, option_id, side, qty, limit_price,
                           ttl_secs, status, policy_id, detail_json, fill_price, created_at, updated_at
                    FROM order_intent ORDER BY created_at DESC LIMIT ?1
                    "#,
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await?
            }
        };

        rows.into_iter().map(row_to_intent).collect()
    }
}

fn row_to_policy(row: sqlx::sqlite::SqliteRow) -> Result<ExecutionPolicy> {
    let mode: String = row.get("mode");
    Ok(ExecutionPolicy {
        policy_id: row.get("policy_id"),
        name: row.get("name"),
        mode: mode.parse().map_err(anyhow::Error::msg)?,
        max_notional_per_order: dec_from_str(&row.get::<String, _>("max_notional_per_order")),
        max_concurrent_orders: row.get("max_concurrent_orders"),
        max_daily_notional: dec_from_str(&row.get::<String, _>("max_daily_notional")),
        slippage_bps: row.get::<i64, _>("slippage_bps") as u32,
        enabled: row.get::<i64, _>("enabled") != 0,
    })
}

fn row_to_intent(row: sqlx::sqlite::SqliteRow) -> Result<OrderIntent> {
    let side: String = row.get("side");
    let status: String = row.get("status");
    let detail_json: String = row.get("detail_json");
    Ok(OrderIntent {
        intent_id: row.get("intent_id"),
        signal_id: row.get("signal_id"),
        market_id: row.get("market_id"),
        option_id: row.get("option_id"),
        side: side.parse().map_err(anyhow::Error::msg)?,
        qty: dec_from_str(&row.get::<String, _>("qty")),
        limit_price: row
            .get::<Option<String>, _>("limit_price")
            .map(|raw| dec_from_str(&raw)),
        ttl_secs: row.get("ttl_secs"),
        status: status.parse().map_err(anyhow::Error::msg)?,
        policy_id: row.get("policy_id"),
        detail: serde_json::from_str(&detail_json).context("Malformed intent detail")?,
        fill_price: row
            .get::<Option<String>, _>("fill_price")
            .map(|raw| dec_from_str(&raw)),
        created_at: from_ms(row.get("created_at")),
        updated_at: from_ms(row.get("updated_at")),
    })
}
