//! Fixed-size dispatch worker pool.
//!
//! The WebSocket reader submits routed logs into a bounded channel; when
//! every worker is busy and the channel is full, submission awaits, so
//! backpressure reaches the socket instead of dropping frames. Each worker
//! owns one HTTP client for the lifetime of the process, so notifier
//! deliveries reuse TLS connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::types::LogEvent;

/// Notifier POST deadline.
const NOTIFIER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct DispatchPool {
    tx: mpsc::Sender<LogEvent>,
}

impl DispatchPool {
    /// Spawn `worker_count` workers sharing one bounded queue.
    pub fn start(
        engine: Arc<Engine>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        // Small buffer on top of the workers themselves; saturation is the
        // backpressure signal, not a failure.
        let (tx, rx) = mpsc::channel::<LogEvent>(worker_count.max(1) * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..worker_count.max(1))
            .map(|worker_id| {
                let engine = engine.clone();
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker_id, engine, rx, shutdown).await;
                })
            })
            .collect();

        info!(workers = worker_count.max(1), "dispatch pool started");
        (Self { tx }, handles)
    }

    /// Submit a routed log. Awaits while the pool is saturated; never drops.
    pub async fn submit(&self, log: LogEvent) -> Result<(), ()> {
        self.tx.send(log).await.map_err(|_| ())
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<Engine>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LogEvent>>>,
    shutdown: CancellationToken,
) {
    // One client per worker, reused across every delivery.
    let client = match reqwest::Client::builder()
        .timeout(NOTIFIER_TIMEOUT)
        .pool_max_idle_per_host(4)
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(worker_id, error = %e, "failed to build worker HTTP client");
            return;
        }
    };

    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = shutdown.cancelled() => {
                    debug!(worker_id, "worker shutting down");
                    return;
                }
            }
        };

        match job {
            Some(log) => engine.process_log(log, &client).await,
            None => {
                debug!(worker_id, "dispatch queue closed");
                return;
            }
        }
    }
}
