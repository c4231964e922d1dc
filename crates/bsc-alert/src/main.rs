//! BSC swap-alert engine binary.
//!
//! Startup order: env config → tracing → dependencies (Redis, SQLite,
//! price quote) → components → background tasks → signal wait. Exit codes:
//! 0 clean shutdown, 1 invalid configuration, 2 fatal dependency.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bsc_alert::cache::{CacheManager, KvStore};
use bsc_alert::config::{self, AppConfig, ConfigHandle};
use bsc_alert::cooldown::CooldownControl;
use bsc_alert::dispatch::DispatchPool;
use bsc_alert::engine::Engine;
use bsc_alert::error::EngineError;
use bsc_alert::filter::FilterEngine;
use bsc_alert::metadata::MetadataResolver;
use bsc_alert::metrics::{run_metrics_server, EngineMetrics};
use bsc_alert::notifier::Notifier;
use bsc_alert::price::{self, WbnbPriceCache};
use bsc_alert::retry::{run_retry_loop, RetryQueue};
use bsc_alert::rpc::RpcClient;
use bsc_alert::stats::StatsApi;
use bsc_alert::store::AlertStore;
use bsc_alert::websocket::run_websocket;

/// Grace period for in-flight workers at shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

enum StartupError {
    Config(String),
    Dependency(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (ignore if missing).
    let _ = dotenvy::dotenv();

    let app_config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let _guard = match init_tracing(&app_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("failed to initialize logging: {e}");
            return ExitCode::from(1);
        }
    };

    match run(app_config).await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(StartupError::Config(msg)) => {
            error!(error = %msg, "invalid configuration");
            ExitCode::from(1)
        }
        Err(StartupError::Dependency(msg)) => {
            error!(error = %msg, "fatal dependency unavailable");
            ExitCode::from(2)
        }
    }
}

async fn run(app_config: AppConfig) -> Result<(), StartupError> {
    info!(
        ws_url = %app_config.ws_url,
        rpc_url = %app_config.rpc_url,
        workers = app_config.worker_count,
        metrics_port = app_config.metrics_port,
        "bsc-alert starting"
    );

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(EngineMetrics::new());

    // -----------------------------------------------------------------------
    // Fatal dependencies
    // -----------------------------------------------------------------------

    let kv = KvStore::connect(&app_config.redis_url)
        .await
        .map_err(|e| StartupError::Dependency(format!("redis unreachable: {e}")))?;

    let store = Arc::new(
        AlertStore::new(&app_config.db_path)
            .await
            .map_err(|e| StartupError::Dependency(format!("alert database: {e}")))?,
    );

    let price_cache = WbnbPriceCache::new(app_config.allow_default_wbnb_price);
    {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StartupError::Dependency(format!("http client: {e}")))?;
        if let Err(e) = price::prime(&price_cache, &client, &app_config.spot_api_url).await {
            if app_config.allow_default_wbnb_price {
                warn!(error = %e, "no live WBNB quote, continuing on the default price");
            } else {
                return Err(StartupError::Dependency(format!(
                    "no live WBNB quote and the default price is not enabled: {e}"
                )));
            }
        }
    }

    // Thresholds: an unparseable document is a configuration error.
    let monitor_config = config::load_monitor_config(&kv).await.map_err(|e| match e {
        EngineError::Config(msg) => StartupError::Config(msg),
        other => StartupError::Dependency(other.to_string()),
    })?;
    let config_handle = ConfigHandle::new(monitor_config);

    // -----------------------------------------------------------------------
    // Components
    // -----------------------------------------------------------------------

    let caches = Arc::new(CacheManager::new(kv.clone(), metrics.clone()));
    let rpc = Arc::new(
        RpcClient::new(app_config.rpc_url.clone(), metrics.clone())
            .map_err(|e| StartupError::Dependency(format!("rpc client: {e}")))?,
    );
    let stats = Arc::new(
        StatsApi::new(
            app_config.stats_api_url.clone(),
            app_config.launchpad_api_url.clone(),
            app_config.stats_api_key.clone(),
            metrics.clone(),
        )
        .map_err(|e| StartupError::Dependency(format!("stats client: {e}")))?,
    );
    let resolver = Arc::new(MetadataResolver::new(
        rpc.clone(),
        caches.clone(),
        stats.clone(),
        metrics.clone(),
    ));
    let filter = Arc::new(FilterEngine::new(
        Duration::from_secs(app_config.cumulative_window_seconds),
        caches.clone(),
        stats.clone(),
        price_cache.clone(),
        metrics.clone(),
    ));
    let cooldown = CooldownControl::new(kv.clone());
    let notifier = Arc::new(Notifier::new(
        app_config.notifier_url.clone(),
        app_config.notifier_chat_id.clone(),
    ));
    let retry_queue = RetryQueue::new(kv.clone());

    let engine = Arc::new(Engine::new(
        config_handle.clone(),
        caches.clone(),
        rpc,
        resolver,
        filter,
        cooldown,
        notifier.clone(),
        retry_queue.clone(),
        store.clone(),
        metrics.clone(),
    ));

    info!("all components initialized");

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    let metrics_handle = tokio::spawn(run_metrics_server(
        metrics.clone(),
        app_config.metrics_port,
        shutdown.clone(),
    ));

    let price_handle = tokio::spawn(price::run_price_updater(
        price_cache,
        app_config.spot_api_url.clone(),
        shutdown.clone(),
    ));

    let retry_handle = tokio::spawn(run_retry_loop(
        retry_queue,
        notifier,
        store,
        metrics.clone(),
        shutdown.clone(),
    ));

    let health_handle = tokio::spawn(run_health_loop(
        engine.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    let refresh_handle = tokio::spawn(run_config_refresh(
        config_handle,
        kv,
        shutdown.clone(),
    ));

    let (pool, worker_handles) =
        DispatchPool::start(engine, app_config.worker_count, shutdown.clone());

    let ws_handle = tokio::spawn(run_websocket(
        app_config.ws_url.clone(),
        pool,
        metrics.clone(),
        shutdown.clone(),
    ));

    info!("all tasks running — waiting for shutdown signal");

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping gracefully...");
    shutdown.cancel();

    // The WebSocket reader stops submitting first, then workers drain.
    if let Err(e) = ws_handle.await {
        error!(error = %e, "WebSocket listener task panicked");
    }
    let workers = futures::future::join_all(worker_handles);
    if tokio::time::timeout(SHUTDOWN_GRACE, workers).await.is_err() {
        warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "workers did not drain in time");
    }

    for (name, handle) in [
        ("metrics server", metrics_handle),
        ("price updater", price_handle),
        ("retry loop", retry_handle),
        ("health loop", health_handle),
        ("config refresh", refresh_handle),
    ] {
        if let Err(e) = handle.await {
            error!(task = name, error = %e, "task panicked");
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

/// Reload thresholds from the KV store on SIGHUP.
async fn run_config_refresh(handle: ConfigHandle, kv: KvStore, shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "failed to install SIGHUP handler");
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    match config::load_monitor_config(&kv).await {
                        Ok(config) => {
                            handle.install(config);
                            info!("monitor thresholds reloaded");
                        }
                        Err(e) => warn!(error = %e, "threshold reload failed, keeping active config"),
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (handle, kv);
        shutdown.cancelled().await;
    }
}

// ---------------------------------------------------------------------------
// Health summary
// ---------------------------------------------------------------------------

/// Log a one-line status summary every 60 s and refresh the cache gauges.
async fn run_health_loop(
    engine: Arc<Engine>,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
            _ = shutdown.cancelled() => return,
        }

        engine.caches().update_size_gauges();
        engine.filter().windows().prune_idle();

        info!(
            ws_connected = metrics.ws_connections.get() == 1,
            reconnects = metrics.ws_reconnects.get(),
            messages = metrics.messages_total.get(),
            deduplicated = metrics.deduplicated.get(),
            alerts_ok = metrics.alerts.with_label_values(&["success"]).get(),
            alerts_failed = metrics.alerts.with_label_values(&["failure"]).get(),
            tracked_windows = engine.filter().windows().tracked_tokens(),
            "health summary"
        );
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Initialise the global tracing subscriber.
///
/// Returns a [`WorkerGuard`] that must be held for the process lifetime —
/// dropping it flushes and closes the log file writer.
fn init_tracing(config: &AppConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir).context("failed to create log directory")?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "bsc-alert.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bsc_alert=info,warn"));

    let registry = tracing_subscriber::registry().with(env_filter).with(
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .json(),
    );

    if config.log_format == "json" {
        registry
            .with(fmt::layer().with_writer(std::io::stderr).json())
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .compact(),
            )
            .init();
    }

    Ok(guard)
}
