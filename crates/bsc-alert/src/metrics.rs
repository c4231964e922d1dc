//! Prometheus metrics for the alert engine.
//!
//! One [`EngineMetrics`] owns the registry and every instrument. It is
//! constructed once in `main` and passed `Arc`-ed into each component,
//! with no global mutable state. Exposed at `GET /metrics` in text format.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct EngineMetrics {
    registry: Registry,

    // Ingestion
    pub messages_total: IntCounter,
    pub frames_dropped: IntCounter,
    pub decode_errors: IntCounter,

    // Filtering, labelled by origin (internal|external)
    pub first_layer_pass: IntCounterVec,
    pub second_layer_check: IntCounterVec,
    pub second_layer_pass: IntCounterVec,

    // Outcomes
    pub alerts: IntCounterVec,
    pub deduplicated: IntCounter,
    pub cooldown_held: IntCounter,
    pub receipts_not_found: IntCounter,
    pub resolve_failures: IntCounter,

    // Caches, labelled by kind (receipt|fourmeme|pair|stat)
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounterVec,
    pub cache_size: IntGaugeVec,

    // Layer-2 fallback, labelled by transition (1m->5m|5m->1h)
    pub fallback: IntCounterVec,
    pub no_data_pairs: IntCounter,

    // Upstream health
    pub rate_limited: IntCounter,
    pub rpc_retries: IntCounter,
    pub ws_connections: IntGauge,
    pub ws_reconnects: IntCounter,

    // Latency
    pub processing_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::with_opts(Opts::new(name, help)).expect("valid counter opts");
            registry.register(Box::new(c.clone())).expect("unique metric name");
            c
        }

        fn counter_vec(
            registry: &Registry,
            name: &str,
            help: &str,
            labels: &[&str],
        ) -> IntCounterVec {
            let c = IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter opts");
            registry.register(Box::new(c.clone())).expect("unique metric name");
            c
        }

        fn gauge(registry: &Registry, name: &str, help: &str) -> IntGauge {
            let g = IntGauge::with_opts(Opts::new(name, help)).expect("valid gauge opts");
            registry.register(Box::new(g.clone())).expect("unique metric name");
            g
        }

        fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
            let g = IntGaugeVec::new(Opts::new(name, help), labels).expect("valid gauge opts");
            registry.register(Box::new(g.clone())).expect("unique metric name");
            g
        }

        let messages_total = counter(
            &registry,
            "bsc_alert_messages_total",
            "WebSocket frames received",
        );
        let frames_dropped = counter(
            &registry,
            "bsc_alert_frames_dropped",
            "Frames that matched no routed event type",
        );
        let decode_errors = counter(
            &registry,
            "bsc_alert_decode_errors",
            "Frames rejected as malformed",
        );

        let first_layer_pass = counter_vec(
            &registry,
            "bsc_alert_first_layer_pass",
            "Events admitted by the USD-threshold layer",
            &["origin"],
        );
        let second_layer_check = counter_vec(
            &registry,
            "bsc_alert_second_layer_check",
            "Events that reached the statistics layer",
            &["origin"],
        );
        let second_layer_pass = counter_vec(
            &registry,
            "bsc_alert_second_layer_pass",
            "Events admitted by the statistics layer",
            &["origin"],
        );

        let alerts = counter_vec(
            &registry,
            "bsc_alert_alerts",
            "Alert delivery outcomes",
            &["outcome"],
        );
        let deduplicated = counter(
            &registry,
            "bsc_alert_deduplicated",
            "Events suppressed by (tx, log_index) dedup",
        );
        let cooldown_held = counter(
            &registry,
            "bsc_alert_cooldown_held",
            "Events suppressed by an active per-token cooldown",
        );
        let receipts_not_found = counter(
            &registry,
            "bsc_alert_receipts_not_found",
            "Events dropped because the receipt is still pending",
        );
        let resolve_failures = counter(
            &registry,
            "bsc_alert_resolve_failures",
            "Events dropped because pair metadata could not be resolved",
        );

        let cache_hits = counter_vec(
            &registry,
            "bsc_alert_cache_hits",
            "Cache hits by kind",
            &["kind"],
        );
        let cache_misses = counter_vec(
            &registry,
            "bsc_alert_cache_misses",
            "Cache misses by kind",
            &["kind"],
        );
        let cache_size = gauge_vec(
            &registry,
            "bsc_alert_cache_size",
            "Entries held per cache kind",
            &["kind"],
        );

        let fallback = counter_vec(
            &registry,
            "bsc_alert_fallback",
            "Layer-2 window fallback transitions",
            &["transition"],
        );
        let no_data_pairs = counter(
            &registry,
            "bsc_alert_no_data_pairs",
            "Pairs negative-cached after exhausting all windows",
        );

        let rate_limited = counter(
            &registry,
            "bsc_alert_rate_limited",
            "HTTP 429 responses from upstreams",
        );
        let rpc_retries = counter(
            &registry,
            "bsc_alert_rpc_retries",
            "RPC call retries after transient failures",
        );
        let ws_connections = gauge(
            &registry,
            "bsc_alert_ws_connections",
            "Live WebSocket connections (0 or 1)",
        );
        let ws_reconnects = counter(
            &registry,
            "bsc_alert_ws_reconnects",
            "WebSocket reconnect attempts",
        );

        let processing_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "bsc_alert_processing_seconds",
                "End-to-end per-event processing time",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )
        .expect("valid histogram opts");
        registry
            .register(Box::new(processing_seconds.clone()))
            .expect("unique metric name");

        Self {
            registry,
            messages_total,
            frames_dropped,
            decode_errors,
            first_layer_pass,
            second_layer_check,
            second_layer_pass,
            alerts,
            deduplicated,
            cooldown_held,
            receipts_not_found,
            resolve_failures,
            cache_hits,
            cache_misses,
            cache_size,
            fallback,
            no_data_pairs,
            rate_limited,
            rpc_retries,
            ws_connections,
            ws_reconnects,
            processing_seconds,
        }
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .unwrap_or_default()
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Exposition server
// ---------------------------------------------------------------------------

/// Serve `GET /metrics` until shutdown.
pub async fn run_metrics_server(
    metrics: Arc<EngineMetrics>,
    port: u16,
    shutdown: CancellationToken,
) {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %addr, "failed to bind metrics listener");
            return;
        }
    };
    info!(addr = %addr, "metrics server listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await;
    if let Err(e) = result {
        error!(error = %e, "metrics server exited with error");
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<EngineMetrics>>,
) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics.render(),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let m = EngineMetrics::new();
        m.messages_total.inc();
        m.first_layer_pass.with_label_values(&["external"]).inc();
        m.fallback.with_label_values(&["1m->5m"]).inc();
        m.alerts.with_label_values(&["success"]).inc();

        let text = m.render();
        assert!(text.contains("bsc_alert_messages_total 1"));
        assert!(text.contains(r#"bsc_alert_first_layer_pass{origin="external"} 1"#));
        assert!(text.contains(r#"bsc_alert_fallback{transition="1m->5m"} 1"#));
        assert!(text.contains(r#"bsc_alert_alerts{outcome="success"} 1"#));
    }

    #[test]
    fn test_gauges() {
        let m = EngineMetrics::new();
        m.ws_connections.set(1);
        m.cache_size.with_label_values(&["receipt"]).set(17);
        let text = m.render();
        assert!(text.contains("bsc_alert_ws_connections 1"));
        assert!(text.contains(r#"bsc_alert_cache_size{kind="receipt"} 17"#));
    }
}
