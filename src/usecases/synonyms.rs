//! Synonym group materialization.
//!
//! Groups of semantically equivalent markets are declared in a YAML
//! document with two forms: explicit member lists and case-insensitive
//! keyword matches against market titles. Matched groups are persisted to
//! `synonym_group` / `synonym_group_member`; the embedding method is
//! reserved in the data model but not materialized here.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::adapters::store::{SqliteStore, SynonymGroupSpec};
use crate::domain::market::Market;

/// The synonyms document root.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SynonymsDoc {
    #[serde(default)]
    pub groups: Vec<SynonymGroupEntry>,
}

/// One declared group.
#[derive(Debug, Clone, Deserialize)]
pub struct SynonymGroupEntry {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub explicit: Vec<String>,
    #[serde(default = "default_min_size")]
    pub group_min_size: usize,
}

fn default_method() -> String {
    "keyword".to_string()
}

fn default_min_size() -> usize {
    2
}

/// Matches markets into declared synonym groups.
pub struct SynonymMatcher {
    doc: SynonymsDoc,
}

impl SynonymMatcher {
    /// Load the document; a missing file yields an empty matcher.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No synonyms document, groups disabled");
            return Ok(Self {
                doc: SynonymsDoc::default(),
            });
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read synonyms document: {}", path.display()))?;
        let doc: SynonymsDoc =
            serde_yaml::from_str(&raw).context("Failed to parse synonyms document")?;
        Ok(Self { doc })
    }

    /// Build a matcher from an already-parsed document.
    pub fn from_doc(doc: SynonymsDoc) -> Self {
        Self { doc }
    }

    /// Match the tracked markets into groups, dropping undersized ones.
    pub fn build_groups(&self, markets: &[Market]) -> Vec<SynonymGroupSpec> {
        let mut groups = Vec::new();
        for entry in &self.doc.groups {
            let keywords: Vec<String> =
                entry.keywords.iter().map(|k| k.to_lowercase()).collect();
            let mut members: BTreeSet<String> = BTreeSet::new();

            for market in markets {
                let title = market.title.to_lowercase();
                let keyword_hit = keywords.iter().any(|kw| title.contains(kw.as_str()));
                if keyword_hit || entry.explicit.contains(&market.market_id) {
                    members.insert(market.market_id.clone());
                }
            }

            if members.len() < entry.group_min_size {
                continue;
            }
            groups.push(SynonymGroupSpec {
                title: entry.name.clone(),
                method: entry.method.clone(),
                members: members.into_iter().collect(),
            });
        }
        groups
    }

    /// Match and persist, returning the materialized groups.
    pub async fn sync(
        &self,
        store: &SqliteStore,
        markets: &[Market],
    ) -> Result<Vec<SynonymGroupSpec>> {
        let groups = self.build_groups(markets);
        store.sync_synonym_groups(&groups).await?;
        for group in &groups {
            info!(
                group = %group.title,
                size = group.members.len(),
                "Synonym group updated"
            );
        }
        Ok(groups)
    }
}
