//! Telegram Notifier - Operator Alert Transport
//!
//! Delivers signal summaries to a Telegram chat. Disabled or unconfigured
//! transports degrade to dry runs: the payload is logged and tagged, and
//! the evaluation cycle proceeds. A transport-side dedupe window keeps
//! repeated emissions of the same signal source from flooding the chat.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{info, warn};

use crate::ports::alert::{AlertOutcome, AlertTransport};

use super::super::venue::cache::TtlCache;

/// Telegram transport configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Real delivery on; otherwise dry-run.
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    /// Transport-side dedupe window.
    pub dedupe_ttl: Duration,
}

/// Alert transport posting to the Telegram bot API.
pub struct TelegramNotifier {
    http: Client,
    config: TelegramConfig,
    /// Last-send markers per dedupe key.
    dedupe: TtlCache<String, ()>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        let dedupe = TtlCache::new(config.dedupe_ttl);
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            config,
            dedupe,
        }
    }

    fn is_live(&self) -> bool {
        self.config.enabled
            && self.config.bot_token.is_some()
            && self.config.chat_id.is_some()
    }
}

#[async_trait]
impl AlertTransport for TelegramNotifier {
    async fn send(&self, text: &str, dedupe_key: &str, _cooldown_secs: u64) -> AlertOutcome {
        if self.dedupe.get(&dedupe_key.to_string()).await.is_some() {
            info!(key = dedupe_key, "Alert suppressed by transport dedupe");
            return AlertOutcome::Deduped;
        }
        self.dedupe.insert(dedupe_key.to_string(), ()).await;

        if !self.is_live() {
            let preview: String = text.chars().take(120).collect();
            info!(key = dedupe_key, preview, "Alert dry-run");
            return AlertOutcome::DryRun;
        }

        let token = self.config.bot_token.as_deref().unwrap_or_default();
        let chat_id = self.config.chat_id.as_deref().unwrap_or_default();
        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        match self.http.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => AlertOutcome::Sent,
            Ok(response) => {
                warn!(status = %response.status(), "Telegram rejected alert");
                AlertOutcome::Failed
            }
            Err(err) => {
                warn!(error = %err, "Telegram delivery failed");
                AlertOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_config() -> TelegramConfig {
        TelegramConfig {
            enabled: false,
            bot_token: None,
            chat_id: None,
            dedupe_ttl: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn disabled_transport_dry_runs() {
        let notifier = TelegramNotifier::new(dry_config());
        let outcome = notifier.send("hello", "rule:market", 120).await;
        assert_eq!(outcome, AlertOutcome::DryRun);
        assert_eq!(outcome.transport_tag(), "dry-run");
    }

    #[tokio::test]
    async fn repeats_within_window_are_deduped() {
        let notifier = TelegramNotifier::new(dry_config());
        assert_eq!(
            notifier.send("first", "k1", 120).await,
            AlertOutcome::DryRun
        );
        assert_eq!(
            notifier.send("second", "k1", 120).await,
            AlertOutcome::Deduped
        );
        assert_eq!(
            notifier.send("other key", "k2", 120).await,
            AlertOutcome::DryRun
        );
    }
}
