//! Prometheus Metrics Registry - Pipeline Observability
//!
//! Registers every counter and gauge the loops update and exposes them on
//! the metrics endpoint alongside liveness/readiness probes. The registry
//! is a constructed collaborator: `main` builds exactly one and hands it
//! to each loop.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use tokio::sync::{broadcast, watch};
use tracing::info;

/// Centralized Prometheus metrics for the coordinator process.
pub struct MetricsRegistry {
    registry: Registry,
    /// Per-cycle ingestion wall time.
    pub ingest_latency_ms: HistogramVec,
    /// Max tick timestamp written, per source.
    pub ingest_last_tick_timestamp: GaugeVec,
    /// Chunk polls that exhausted their retries.
    pub ingest_errors_total: IntCounterVec,
    /// Ticks suppressed by the last-value dedup cache.
    pub ticks_deduped_total: IntCounterVec,
    /// Per-record schema violations skipped during ingestion.
    pub schema_errors_total: IntCounterVec,
    /// Rule evaluation cycle wall time.
    pub rule_eval_ms: HistogramVec,
    /// Signals emitted, per rule type.
    pub signals_total: IntCounterVec,
    /// Emissions suppressed by an open circuit breaker.
    pub breaker_skips_total: IntCounterVec,
    /// Intent transitions, per resulting status.
    pub order_intents_total: IntCounterVec,
    /// Alert transport delivery failures.
    pub alert_failures_total: IntCounter,
    /// Outbound venue requests, per endpoint.
    pub requests_total: IntCounterVec,
    /// 1 while the process is serving, 0 once draining.
    pub health: Gauge,
}

impl MetricsRegistry {
    /// Create and register all metrics.
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let ingest_latency_ms = HistogramVec::new(
            HistogramOpts::new("ingest_latency_ms", "Ingestion cycle latency in ms").buckets(
                vec![5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0],
            ),
            &["source"],
        )?;
        let ingest_last_tick_timestamp = GaugeVec::new(
            Opts::new(
                "ingest_last_tick_timestamp",
                "Unix timestamp of the last tick written",
            ),
            &["source"],
        )?;
        let ingest_errors_total = IntCounterVec::new(
            Opts::new("ingest_errors_total", "Chunk polls failed after retries"),
            &["source"],
        )?;
        let ticks_deduped_total = IntCounterVec::new(
            Opts::new("ticks_deduped_total", "Ticks suppressed as duplicates"),
            &["source"],
        )?;
        let schema_errors_total = IntCounterVec::new(
            Opts::new("schema_errors_total", "Records skipped on schema violations"),
            &["source"],
        )?;
        let rule_eval_ms = HistogramVec::new(
            HistogramOpts::new("rule_eval_ms", "Rule evaluation cycle latency in ms")
                .buckets(vec![5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0]),
            &["engine"],
        )?;
        let signals_total = IntCounterVec::new(
            Opts::new("signals_total", "Signals emitted"),
            &["rule"],
        )?;
        let breaker_skips_total = IntCounterVec::new(
            Opts::new("breaker_skips_total", "Evaluations skipped by open breakers"),
            &["rule"],
        )?;
        let order_intents_total = IntCounterVec::new(
            Opts::new("order_intents_total", "Order intent transitions"),
            &["status"],
        )?;
        let alert_failures_total =
            IntCounter::new("alert_failures_total", "Alert transport failures")?;
        let requests_total = IntCounterVec::new(
            Opts::new("requests_total", "Outbound venue requests"),
            &["endpoint"],
        )?;
        let health = Gauge::new("health", "1 while serving, 0 while draining")?;

        registry.register(Box::new(ingest_latency_ms.clone()))?;
        registry.register(Box::new(ingest_last_tick_timestamp.clone()))?;
        registry.register(Box::new(ingest_errors_total.clone()))?;
        registry.register(Box::new(ticks_deduped_total.clone()))?;
        registry.register(Box::new(schema_errors_total.clone()))?;
        registry.register(Box::new(rule_eval_ms.clone()))?;
        registry.register(Box::new(signals_total.clone()))?;
        registry.register(Box::new(breaker_skips_total.clone()))?;
        registry.register(Box::new(order_intents_total.clone()))?;
        registry.register(Box::new(alert_failures_total.clone()))?;
        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(health.clone()))?;

        health.set(1.0);

        Ok(Self {
            registry,
            ingest_latency_ms,
            ingest_last_tick_timestamp,
            ingest_errors_total,
            ticks_deduped_total,
            schema_errors_total,
            rule_eval_ms,
            signals_total,
            breaker_skips_total,
            order_intents_total,
            alert_failures_total,
            requests_total,
            health,
        })
    }

    /// Render the exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }

    /// Serve `/metrics`, `/live`, and `/ready` until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        bind_address: String,
        ready_rx: watch::Receiver<bool>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        let metrics_self = Arc::clone(&self);

        let app = Router::new()
            .route(
                "/metrics",
                get(move || {
                    let metrics = Arc::clone(&metrics_self);
                    async move { metrics.encode() }
                }),
            )
            .route("/live", get(|| async { StatusCode::OK }))
            .route(
                "/ready",
                get(|State(rx): State<watch::Receiver<bool>>| async move {
                    if *rx.borrow() {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(ready_rx);

        let listener = tokio::net::TcpListener::bind(&bind_address).await?;
        info!(address = %bind_address, "Metrics server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }
}
