//! Rule definition, signal, KPI, and audit queries.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;

use crate::domain::rule::RuleDoc;
use crate::domain::signal::{NewSignal, Signal, SignalLevel, SignalPayload};

use super::{from_ms, to_ms, SqliteStore};

impl SqliteStore {
    /// Upsert a rule document keyed by its unique name.
    ///
    /// The stored `version` increments whenever the raw source changes;
    /// re-persisting an identical document is a no-op on the version.
    pub async fn upsert_rule_def(&self, doc: &RuleDoc, raw_source: &str) -> Result<(i64, i64)> {
        let now = to_ms(Utc::now());
        let existing = sqlx::query("SELECT rule_id, version, raw_source FROM rule_def WHERE name = ?1")
            .bind(&doc.name)
            .fetch_optional(self.pool())
            .await
            .context("Failed to read rule_def")?;

        match existing {
            Some(row) => {
                let rule_id: i64 = row.get("rule_id");
                let version: i64 = row.get("version");
                let stored_raw: String = row.get("raw_source");
                if stored_raw == raw_source {
                    return Ok((rule_id, version));
                }
                let next = version + 1;
                sqlx::query(
                    r#"
                    UPDATE rule_def
                    SET rule_type = ?1, enabled = ?2, version = ?3, raw_source = ?4, updated_at = ?5
                    WHERE rule_id = ?6
                    "#,
                )
                .bind(doc.rule_type.as_str())
                .bind(doc.enabled as i64)
                .bind(next)
                .bind(raw_source)
                .bind(now)
                .bind(rule_id)
                .execute(self.pool())
                .await?;
                Ok((rule_id, next))
            }
            None => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO rule_def (name, rule_type, enabled, version, raw_source, updated_at)
                    VALUES (?1, ?2, ?3, 1, ?4, ?5)
                    "#,
                )
                .bind(&doc.name)
                .bind(doc.rule_type.as_str())
                .bind(doc.enabled as i64)
                .bind(raw_source)
                .bind(now)
                .execute(self.pool())
                .await?;
                Ok((result.last_insert_rowid(), 1))
            }
        }
    }

    pub async fn insert_signal(&self, signal: &NewSignal) -> Result<i64> {
        let payload = serde_json::to_string(&signal.payload)?;
        let result = sqlx::query(
            r#"
            INSERT INTO signal (market_id, option_id, rule_id, level, score, edge_score, reason, payload_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(&signal.market_id)
        .bind(&signal.option_id)
        .bind(signal.rule_id)
        .bind(signal.level.to_string())
        .bind(signal.score)
        .bind(signal.edge_score)
        .bind(&signal.reason)
        .bind(payload)
        .bind(to_ms(Utc::now()))
        .execute(self.pool())
        .await
        .context("Failed to insert signal")?;
        Ok(result.last_insert_rowid())
    }

    pub async fn get_signal(&self, signal_id: i64) -> Result<Option<Signal>> {
        let row = sqlx::query(
            r#"
            SELECT signal_id, market_id, option_id, rule_id, level, score, edge_score, reason, payload_json, created_at
            FROM signal WHERE signal_id = ?1
            "#,
        )
        .bind(signal_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to load signal")?;

        row.map(row_to_signal).transpose()
    }

    /// Recent signals ordered by the primary rank key, then recency.
    pub async fn list_recent_signals(&self, limit: i64) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT signal_id, market_id, option_id, rule_id, level, score, edge_score, reason, payload_json, created_at
            FROM signal ORDER BY edge_score DESC, created_at DESC LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(row_to_signal).collect()
    }

    /// Signals for one rule-market pair, newest first. Used to audit the
    /// cooldown invariant.
    pub async fn signals_for_pair(&self, rule_id: i64, market_id: &str) -> Result<Vec<Signal>> {
        let rows = sqlx::query(
            r#"
            SELECT signal_id, market_id, option_id, rule_id, level, score, edge_score, reason, payload_json, created_at
            FROM signal WHERE rule_id = ?1 AND market_id = ?2 ORDER BY created_at DESC
            "#,
        )
        .bind(rule_id)
        .bind(market_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter().map(row_to_signal).collect()
    }

    /// Fold one emission into the `(day, rule_type)` KPI row.
    ///
    /// Averages move exponentially with alpha 0.5: `new = (old + x) / 2`.
    pub async fn record_kpi(
        &self,
        rule_type: &str,
        level: SignalLevel,
        gap: Option<f64>,
        est_edge_bps: Option<f64>,
    ) -> Result<()> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        sqlx::query(
            r#"
            INSERT INTO rule_kpi_daily (day, rule_type, signals, p1_signals, avg_gap, est_edge_bps)
            VALUES (?1, ?2, 1, ?3, ?4, ?5)
            ON CONFLICT (day, rule_type) DO UPDATE SET
                signals = rule_kpi_daily.signals + 1,
                p1_signals = rule_kpi_daily.p1_signals + excluded.p1_signals,
                avg_gap = COALESCE((rule_kpi_daily.avg_gap + excluded.avg_gap) / 2,
                                   rule_kpi_daily.avg_gap, excluded.avg_gap),
                est_edge_bps = COALESCE((rule_kpi_daily.est_edge_bps + excluded.est_edge_bps) / 2,
                                        rule_kpi_daily.est_edge_bps, excluded.est_edge_bps)
            "#,
        )
        .bind(day)
        .bind(rule_type)
        .bind(if level == SignalLevel::P1 { 1i64 } else { 0i64 })
        .bind(gap)
        .bind(est_edge_bps)
        .execute(self.pool())
        .await
        .context("Failed to record KPI")?;
        Ok(())
    }

    /// KPI rows for one day, for the reporting surface.
    pub async fn kpis_for_day(&self, day: &str) -> Result<Vec<KpiRow>> {
        let rows = sqlx::query(
            "SELECT day, rule_type, signals, p1_signals, avg_gap, est_edge_bps
             FROM rule_kpi_daily WHERE day = ?1 ORDER BY rule_type",
        )
        .bind(day)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| KpiRow {
                day: row.get("day"),
                rule_type: row.get("rule_type"),
                signals: row.get("signals"),
                p1_signals: row.get("p1_signals"),
                avg_gap: row.get("avg_gap"),
                est_edge_bps: row.get("est_edge_bps"),
            })
            .collect())
    }

    pub async fn insert_audit(
        &self,
        actor: &str,
        action: &str,
        target_id: Option<&str>,
        correlation_id: Option<&str>,
        meta: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (actor, action, target_id, correlation_id, meta_json, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(actor)
        .bind(action)
        .bind(target_id)
        .bind(correlation_id)
        .bind(meta.to_string())
        .bind(to_ms(Utc::now()))
        .execute(self.pool())
        .await
        .context("Failed to insert audit entry")?;
        Ok(())
    }

    /// Audit actions recorded for a target, newest first.
    pub async fn audit_actions_for(&self, target_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT action FROM audit_log WHERE target_id = ?1 ORDER BY audit_id DESC",
        )
        .bind(target_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|row| row.get("action")).collect())
    }
}

/// One `(day, rule_type)` KPI aggregate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KpiRow {
    pub day: String,
    pub rule_type: String,
    pub signals: i64,
    pub p1_signals: i64,
    pub avg_gap: Option<f64>,
    pub est_edge_bps: Option<f64>,
}

fn row_to_signal(row: sqlx::sqlite::SqliteRow) -> Result<Signal> {
    let level: String = row.get("level");
    let payload_json: String = row.get("payload_json");
    let payload: SignalPayload =
        serde_json::from_str(&payload_json).context("Malformed signal payload")?;
    Ok(Signal {
        signal_id: row.get("signal_id"),
        market_id: row.get("market_id"),
        option_id: row.get("option_id"),
        rule_id: row.get("rule_id"),
        level: level.parse().map_err(anyhow::Error::msg)?,
        score: row.get("score"),
        edge_score: row.get("edge_score"),
        reason: row.get("reason"),
        payload,
        created_at: from_ms(row.get("created_at")),
    })
}
