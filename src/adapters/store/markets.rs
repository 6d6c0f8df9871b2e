//! Market, option, and synonym-group queries.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::Row;

use crate::domain::market::{Market, MarketOption, MarketStatus};

use super::{from_ms, to_ms, SqliteStore};

/// A materialized synonym group ready for persistence.
#[derive(Debug, Clone)]
pub struct SynonymGroupSpec {
    pub title: String,
    pub method: String,
    pub members: Vec<String>,
}

impl SqliteStore {
    /// Create the market on first sighting, update metadata afterwards.
    pub async fn upsert_market(&self, market: &Market) -> Result<()> {
        let now = to_ms(Utc::now());
        let tags = serde_json::to_string(&market.tags)?;
        sqlx::query(
            r#"
            INSERT INTO market (market_id, title, status, starts_at, ends_at, tags_json, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
            ON CONFLICT (market_id) DO UPDATE SET
                title = excluded.title,
                status = excluded.status,
                starts_at = excluded.starts_at,
                ends_at = excluded.ends_at,
                tags_json = excluded.tags_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&market.market_id)
        .bind(&market.title)
        .bind(market.status.to_string())
        .bind(market.starts_at.map(to_ms))
        .bind(market.ends_at.map(to_ms))
        .bind(tags)
        .bind(now)
        .execute(self.pool())
        .await
        .context("Failed to upsert market")?;
        Ok(())
    }

    /// Options follow their market; label updates are routine.
    pub async fn upsert_options(&self, options: &[MarketOption]) -> Result<()> {
        for option in options {
            sqlx::query(
                r#"
                INSERT INTO market_option (option_id, market_id, label)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (option_id) DO UPDATE SET label = excluded.label
                "#,
            )
            .bind(&option.option_id)
            .bind(&option.market_id)
            .bind(&option.label)
            .execute(self.pool())
            .await
            .context("Failed to upsert option")?;
        }
        Ok(())
    }

    /// Markets by status, oldest first for stable evaluation order.
    pub async fn list_markets(
        &self,
        status: Option<MarketStatus>,
        limit: i64,
    ) -> Result<Vec<Market>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT market_id, title, status, starts_at, ends_at, tags_json
                     FROM market WHERE status = ?1 ORDER BY market_id LIMIT ?2",
                )
                .bind(status.to_string())
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query(
                    "SELECT market_id, title, status, starts_at, ends_at, tags_json
                     FROM market ORDER BY market_id LIMIT ?1",
                )
                .bind(limit)
                .fetch_all(self.pool())
                .await
            }
        }
        .context("Failed to list markets")?;

        Ok(rows.into_iter().map(row_to_market).collect())
    }

    pub async fn get_market(&self, market_id: &str) -> Result<Option<Market>> {
        let row = sqlx::query(
            "SELECT market_id, title, status, starts_at, ends_at, tags_json
             FROM market WHERE market_id = ?1",
        )
        .bind(market_id)
        .fetch_optional(self.pool())
        .await
        .context("Failed to load market")?;
        Ok(row.map(row_to_market))
    }

    pub async fn list_options(&self, market_id: &str) -> Result<Vec<MarketOption>> {
        let rows = sqlx::query(
            "SELECT option_id, market_id, label FROM market_option
             WHERE market_id = ?1 ORDER BY option_id",
        )
        .bind(market_id)
        .fetch_all(self.pool())
        .await
        .context("Failed to list options")?;

        Ok(rows
            .into_iter()
            .map(|row| MarketOption {
                option_id: row.get("option_id"),
                market_id: row.get("market_id"),
                label: row.get("label"),
            })
            .collect())
    }

    /// Replace the stored groups with the freshly materialized set.
    pub async fn sync_synonym_groups(&self, groups: &[SynonymGroupSpec]) -> Result<()> {
        let now = to_ms(Utc::now());
        for group in groups {
            let existing = sqlx::query("SELECT group_id FROM synonym_group WHERE title = ?1")
                .bind(&group.title)
                .fetch_optional(self.pool())
                .await?;

            let group_id: i64 = match existing {
                Some(row) => {
                    let id: i64 = row.get("group_id");
                    sqlx::query("UPDATE synonym_group SET updated_at = ?1, method = ?2 WHERE group_id = ?3")
                        .bind(now)
                        .bind(&group.method)
                        .bind(id)
                        .execute(self.pool())
                        .await?;
                    id
                }
                None => {
                    let result =
                        sqlx::query("INSERT INTO synonym_group (method, title, updated_at) VALUES (?1, ?2, ?3)")
                            .bind(&group.method)
                            .bind(&group.title)
                            .bind(now)
                            .execute(self.pool())
                            .await?;
                    result.last_insert_rowid()
                }
            };

            sqlx::query("DELETE FROM synonym_group_member WHERE group_id = ?1")
                .bind(group_id)
                .execute(self.pool())
                .await?;
            for market_id in &group.members {
                sqlx::query(
                    "INSERT OR IGNORE INTO synonym_group_member (group_id, market_id) VALUES (?1, ?2)",
                )
                .bind(group_id)
                .bind(market_id)
                .execute(self.pool())
                .await?;
            }
        }
        Ok(())
    }

    /// All stored groups with their members.
    pub async fn list_synonym_groups(&self) -> Result<Vec<SynonymGroupSpec>> {
        let rows = sqlx::query(
            r#"
            SELECT g.title, g.method, m.market_id
            FROM synonym_group g
            JOIN synonym_group_member m ON m.group_id = g.group_id
            ORDER BY g.group_id, m.market_id
            "#,
        )
        .fetch_all(self.pool())
        .await
        .context("Failed to list synonym groups")?;

        let mut groups: Vec<SynonymGroupSpec> = Vec::new();
        for row in rows {
            let title: String = row.get("title");
            let market_id: String = row.get("market_id");
            match groups.last_mut() {
                Some(last) if last.title == title => last.members.push(market_id),
                _ => groups.push(SynonymGroupSpec {
                    title,
                    method: row.get("method"),
                    members: vec![market_id],
                }),
            }
        }
        Ok(groups)
    }
}

fn row_to_market(row: sqlx::sqlite::SqliteRow) -> Market {
    let tags_json: String = row.get("tags_json");
    let status: String = row.get("status");
    Market {
        market_id: row.get("market_id"),
        title: row.get("title"),
        status: MarketStatus::from_wire(&status),
        starts_at: row.get::<Option<i64>, _>("starts_at").map(from_ms),
        ends_at: row.get::<Option<i64>, _>("ends_at").map(from_ms),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        embedding: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, title: &str) -> Market {
        Market {
            market_id: id.to_string(),
            title: title.to_string(),
            status: MarketStatus::Open,
            starts_at: None,
            ends_at: Some(Utc::now()),
            tags: vec!["politics".into()],
            embedding: None,
        }
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_market(&market("m1", "First title")).await.unwrap();
        store.upsert_market(&market("m1", "Renamed")).await.unwrap();

        let markets = store.list_markets(None, 10).await.unwrap();
        assert_eq!(markets.len(), 1);
        assert_eq!(markets[0].title, "Renamed");
        assert_eq!(markets[0].tags, vec!["politics".to_string()]);
    }

    #[tokio::test]
    async fn synonym_groups_sync_replaces_members() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .sync_synonym_groups(&[SynonymGroupSpec {
                title: "election".into(),
                method: "keyword".into(),
                members: vec!["m1".into(), "m2".into()],
            }])
            .await
            .unwrap();
        store
            .sync_synonym_groups(&[SynonymGroupSpec {
                title: "election".into(),
                method: "keyword".into(),
                members: vec!["m2".into(), "m3".into()],
            }])
            .await
            .unwrap();

        let groups = store.list_synonym_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].members, vec!["m2".to_string(), "m3".to_string()]);
    }
}
