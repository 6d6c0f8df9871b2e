//! Configuration loader — reads and validates `config.toml`.
//!
//! Loads the TOML configuration file from the given path, applies
//! environment variable overrides for secrets and deployment knobs, and
//! validates critical fields. A configuration error is fatal: the process
//! refuses to start.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use super::{AppConfig, DataSource};

/// Load, override, and validate configuration from a TOML file.
pub fn load_config(path: &str) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read config file: {path}"))?;

    let mut config: AppConfig =
        toml::from_str(&content).context("Failed to parse config.toml")?;

    apply_env_overrides(&mut config);
    validate_config(&config)?;

    info!(path = path, "Configuration loaded successfully");
    Ok(config)
}

/// Environment variables take precedence over file values for anything
/// secret or deployment-specific.
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        if !url.is_empty() {
            config.database.url = url;
        }
    }
    if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
        if !token.is_empty() {
            config.alerts.bot_token = Some(token);
        }
    }
    if let Ok(chat) = std::env::var("TELEGRAM_CHAT_ID") {
        if !chat.is_empty() {
            config.alerts.chat_id = Some(chat);
        }
    }
    if let Ok(source) = std::env::var("MPX_DATA_SOURCE") {
        match source.as_str() {
            "mock" => config.app.data_source = DataSource::Mock,
            "real" => config.app.data_source = DataSource::Real,
            _ => {}
        }
    }
}

/// Validate critical configuration fields.
fn validate_config(config: &AppConfig) -> Result<()> {
    anyhow::ensure!(
        !config.database.url.is_empty(),
        "database.url must not be empty"
    );
    anyhow::ensure!(
        config.ingestion.poll_interval_ms > 0,
        "ingestion.poll_interval_ms must be positive"
    );
    anyhow::ensure!(
        config.ingestion.chunk_size > 0,
        "ingestion.chunk_size must be positive"
    );
    anyhow::ensure!(
        config.ingestion.max_concurrency > 0,
        "ingestion.max_concurrency must be positive"
    );
    anyhow::ensure!(
        config.rules.eval_interval_ms > 0,
        "rules.eval_interval_ms must be positive"
    );
    anyhow::ensure!(
        config.rules.breaker_max > 0,
        "rules.breaker_max must be positive"
    );
    anyhow::ensure!(
        config.execution.max_notional_per_order > Decimal::ZERO,
        "execution.max_notional_per_order must be positive"
    );
    anyhow::ensure!(
        config.execution.max_daily_notional >= config.execution.max_notional_per_order,
        "execution.max_daily_notional must cover at least one max-size order"
    );
    anyhow::ensure!(
        config.execution.max_concurrent_orders > 0,
        "execution.max_concurrent_orders must be positive"
    );
    anyhow::ensure!(
        config.execution.slippage_bps > 0,
        "execution.slippage_bps must be positive"
    );
    if config.alerts.enabled {
        anyhow::ensure!(
            config.alerts.bot_token.is_some() && config.alerts.chat_id.is_some(),
            "alerts.enabled requires bot_token and chat_id"
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[app]
name = "marketpulse-test"

[database]
url = "sqlite::memory:"
"#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: AppConfig = toml::from_str(MINIMAL).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.ingestion.poll_interval_ms, 2000);
        assert_eq!(config.rules.lookback_secs, 300);
        assert_eq!(config.execution.slippage_bps, 80);
        assert!(matches!(config.app.data_source, DataSource::Mock));
    }

    #[test]
    fn enabled_alerts_require_credentials() {
        let raw = format!("{MINIMAL}\n[alerts]\nenabled = true\n");
        let config: AppConfig = toml::from_str(&raw).unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn daily_cap_must_cover_order_cap() {
        let raw = format!(
            "{MINIMAL}\n[execution]\nmax_notional_per_order = \"500\"\nmax_daily_notional = \"100\"\n"
        );
        let config: AppConfig = toml::from_str(&raw).unwrap();
        assert!(validate_config(&config).is_err());
    }
}
