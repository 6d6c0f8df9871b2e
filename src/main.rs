//! MarketPulse - Coordinator Entry Point
//!
//! Initializes configuration, logging, the store, and the venue client,
//! then multiplexes the scheduled loops: ingestion, rule evaluation, and
//! the metrics endpoint. Runs until SIGINT/SIGTERM; shutdown broadcasts
//! to every loop and drains with a bounded timeout.

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::{broadcast, watch};
use tracing::{error, info};

use marketpulse::adapters::alert::{TelegramConfig, TelegramNotifier};
use marketpulse::adapters::metrics::MetricsRegistry;
use marketpulse::adapters::store::SqliteStore;
use marketpulse::adapters::venue::{PolymarketVenue, SyntheticVenue, VenueConfig};
use marketpulse::config::{self, DataSource};
use marketpulse::ports::venue::VenueSource;
use marketpulse::usecases::{
    BreakerConfig, CircuitBreakerTable, IngestionPipeline, RuleEngine, SynonymMatcher,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::loader::load_config("config.toml")
        .context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.app.log_level)),
        )
        .json()
        .init();

    info!(
        name = %config.app.name,
        data_source = ?config.app.data_source,
        "Starting MarketPulse coordinator"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let (ready_tx, ready_rx) = watch::channel(true);

    // Shared collaborators, constructed once and passed to each loop.
    let metrics = Arc::new(MetricsRegistry::new()?);
    let store = Arc::new(SqliteStore::connect(&config.database.url).await?);
    store
        .bootstrap_policy(
            "default",
            &config.execution.mode.to_string(),
            config.execution.max_notional_per_order,
            config.execution.max_concurrent_orders,
            config.execution.max_daily_notional,
            config.execution.slippage_bps,
        )
        .await?;

    let venue: Arc<dyn VenueSource> = match config.app.data_source {
        DataSource::Mock => Arc::new(SyntheticVenue::new(config.app.synthetic_seed)),
        DataSource::Real => {
            let venue_config = VenueConfig {
                timeout: Duration::from_secs(config.ingestion.request_timeout_secs),
                max_retries: config.ingestion.max_retries,
                backoff_base: Duration::from_millis(config.ingestion.backoff_base_ms),
                backoff_max: Duration::from_millis(config.ingestion.backoff_max_ms),
                ..VenueConfig::default()
            };
            Arc::new(
                PolymarketVenue::new(venue_config)
                    .map_err(|e| anyhow::anyhow!("venue client: {e}"))?
                    .with_request_counter(metrics.requests_total.clone()),
            )
        }
    };

    let notifier = Arc::new(TelegramNotifier::new(TelegramConfig {
        enabled: config.alerts.enabled,
        bot_token: config.alerts.bot_token.clone(),
        chat_id: config.alerts.chat_id.clone(),
        dedupe_ttl: Duration::from_secs(config.alerts.dedupe_ttl_secs),
    }));

    let breakers = Arc::new(CircuitBreakerTable::new(BreakerConfig {
        max_emissions: config.rules.breaker_max,
        window: Duration::from_secs(config.rules.breaker_window_secs),
        cooldown: Duration::from_secs(config.rules.breaker_cooldown_secs),
        max_cooldown: Duration::from_secs(config.rules.breaker_max_cooldown_secs),
    }));

    // Metrics endpoint.
    let metrics_handle = if config.metrics.enabled {
        let server = Arc::clone(&metrics);
        let bind = config.metrics.bind_address.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(bind, ready_rx, shutdown_rx).await {
                error!(error = %e, "Metrics server failed");
            }
        }))
    } else {
        None
    };

    // Ingestion loop.
    let ingestion_handle = {
        let mut pipeline = IngestionPipeline::new(
            Arc::clone(&venue),
            Arc::clone(&store),
            Arc::clone(&metrics),
            config.ingestion.clone(),
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(shutdown_rx).await {
                error!(error = %e, "Ingestion pipeline failed");
            }
        })
    };

    // Rule engine loop.
    let engine_handle = {
        let synonyms = SynonymMatcher::load(Path::new(&config.rules.synonyms_path))?;
        let mut engine = RuleEngine::new(
            Arc::clone(&store),
            notifier,
            Arc::clone(&metrics),
            Arc::clone(&breakers),
            config.rules.clone(),
            synonyms,
        );
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = engine.run(shutdown_rx).await {
                error!(error = %e, "Rule engine failed");
            }
        })
    };

    // Wait for SIGINT/SIGTERM.
    wait_for_shutdown_signal().await;
    info!("Shutdown signal received, draining");

    // 1. Stop serving readiness, flip the health gauge.
    let _ = ready_tx.send(false);
    metrics.health.set(0.0);

    // 2. Tell every loop to stop.
    let _ = shutdown_tx.send(());

    // 3. Bounded drain.
    let drain = async {
        let _ = ingestion_handle.await;
        let _ = engine_handle.await;
    };
    if tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        error!("Drain timed out, aborting remaining tasks");
    }
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            signal::unix::signal(signal::unix::SignalKind::terminate()).expect("signal handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
