//! Persistent retry queue for failed alert deliveries.
//!
//! A failed dispatch parks its payload under `bsc:retry:{token}` (1 h TTL).
//! The drain loop re-attempts every due record on a 5-minute schedule, up to
//! 3 attempts; exhausted records move to the dead-letter table for human
//! review. Shutdown is observed at the next interval boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{keys, KvStore, KV_RETRY_TTL_SECS};
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::notifier::Notifier;
use crate::store::AlertStore;
use crate::types::AlertPayload;

/// Delay between delivery attempts for one record.
const RETRY_INTERVAL_SECS: i64 = 300;
/// Attempts before a record is dead-lettered.
const MAX_ATTEMPTS: u32 = 3;
/// Queue poll cadence.
const DRAIN_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub payload: AlertPayload,
    pub retry_count: u32,
    pub next_attempt_at: i64,
    pub last_error: String,
}

impl RetryRecord {
    pub fn new(payload: AlertPayload, error: &str) -> Self {
        Self {
            payload,
            retry_count: 0,
            next_attempt_at: Utc::now().timestamp() + RETRY_INTERVAL_SECS,
            last_error: error.to_string(),
        }
    }

    pub fn is_due(&self, now: i64) -> bool {
        now >= self.next_attempt_at
    }

    /// Record a failed attempt. Returns true if the record should move to
    /// the dead-letter table instead of being rescheduled.
    pub fn register_failure(&mut self, now: i64, error: &str) -> bool {
        self.retry_count += 1;
        self.last_error = error.to_string();
        self.next_attempt_at = now + RETRY_INTERVAL_SECS;
        self.retry_count >= MAX_ATTEMPTS
    }
}

#[derive(Clone)]
pub struct RetryQueue {
    kv: KvStore,
}

impl RetryQueue {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Park a freshly failed alert. One slot per token; a newer failure for
    /// the same token replaces the older record.
    pub async fn enqueue(&self, payload: &AlertPayload, error: &str) -> Result<(), EngineError> {
        let record = RetryRecord::new(payload.clone(), error);
        let json = serde_json::to_string(&record)?;
        self.kv
            .set_ex(&keys::retry(&payload.token), &json, KV_RETRY_TTL_SECS)
            .await?;
        info!(token = %payload.token, "alert parked for retry");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<(String, RetryRecord)>, EngineError> {
        let pattern = format!("{}*", keys::RETRY_PREFIX);
        let mut records = Vec::new();
        for key in self.kv.scan_keys(&pattern).await? {
            match self.kv.get(&key).await? {
                Some(raw) => match serde_json::from_str::<RetryRecord>(&raw) {
                    Ok(record) => records.push((key, record)),
                    Err(e) => {
                        warn!(key, error = %e, "dropping unparseable retry record");
                        let _ = self.kv.del(&key).await;
                    }
                },
                None => {} // Expired between SCAN and GET.
            }
        }
        Ok(records)
    }

    async fn store_back(&self, key: &str, record: &RetryRecord) -> Result<(), EngineError> {
        let json = serde_json::to_string(record)?;
        self.kv.set_ex(key, &json, KV_RETRY_TTL_SECS).await
    }
}

/// Drain loop: re-deliver due records until shutdown.
pub async fn run_retry_loop(
    queue: RetryQueue,
    notifier: Arc<Notifier>,
    store: Arc<AlertStore>,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to build retry HTTP client");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(DRAIN_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                debug!("retry loop shutting down");
                return;
            }
        }

        let records = match queue.load_all().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "retry queue scan failed");
                continue;
            }
        };

        let now = Utc::now().timestamp();
        for (key, mut record) in records {
            if !record.is_due(now) {
                continue;
            }

            match notifier.send(&client, &record.payload).await {
                Ok(()) => {
                    metrics.alerts.with_label_values(&["success"]).inc();
                    let _ = queue.kv.del(&key).await;
                    if let Err(e) = store
                        .record_alert(&record.payload, "retry", "sent")
                        .await
                    {
                        warn!(error = %e, "failed to record retried alert");
                    }
                    info!(token = %record.payload.token, attempts = record.retry_count + 1, "retried alert delivered");
                }
                Err(e) => {
                    metrics.alerts.with_label_values(&["failure"]).inc();
                    let exhausted = record.register_failure(now, &e.to_string());
                    if exhausted {
                        warn!(token = %record.payload.token, error = %e, "alert exhausted retries, dead-lettering");
                        if let Err(db_err) = store
                            .record_dead_letter(&record.payload, &record.last_error, record.retry_count)
                            .await
                        {
                            error!(error = %db_err, "failed to write dead letter");
                        }
                        let _ = queue.kv.del(&key).await;
                    } else if let Err(e) = queue.store_back(&key, &record).await {
                        warn!(error = %e, "failed to reschedule retry record");
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
