//! WebSocket subscription manager.
//!
//! One connection to the BSC node carries one `logs` subscription per
//! fourmeme contract plus one on the PancakeSwap V2 Swap topic. The reader
//! decodes frames and submits routed logs to the dispatch pool; it blocks
//! only on the socket read and on pool submission. Application-level pings
//! go out every 30 s; a missing pong within 10 s forces a reconnect, and
//! reconnects replay the identical subscription set.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::constants::{FOURMEME_CONTRACTS, TOPIC_V2_SWAP};
use crate::decoder::{self, WireFrame};
use crate::dispatch::DispatchPool;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;

/// Application ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Pong deadline after a ping.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
/// Reconnect backoff: 1 s doubling to a 60 s cap, plus jitter.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(60);
const RECONNECT_JITTER_MS: u64 = 1000;

/// One `eth_subscribe` request: (request id, group name, params).
pub fn subscription_requests() -> Vec<(u64, String, Value)> {
    let mut requests: Vec<(u64, String, Value)> = FOURMEME_CONTRACTS
        .iter()
        .enumerate()
        .map(|(i, addr)| {
            (
                (i + 1) as u64,
                format!("fourmeme-proxy-{}", i + 1),
                json!(["logs", { "address": format!("{addr}") }]),
            )
        })
        .collect();
    requests.push((
        (FOURMEME_CONTRACTS.len() + 1) as u64,
        "pancake-v2-swap".to_string(),
        json!(["logs", { "topics": [[format!("{TOPIC_V2_SWAP}")]] }]),
    ));
    requests
}

/// Exponential reconnect backoff with jitter, capped at 60 s.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE
        .saturating_mul(1u32 << attempt.min(7).saturating_sub(1))
        .min(RECONNECT_CAP);
    let jitter = rand::thread_rng().gen_range(0..=RECONNECT_JITTER_MS);
    exp + Duration::from_millis(jitter)
}

/// Run the WebSocket reader with reconnection until shutdown.
pub async fn run_websocket(
    url: String,
    pool: DispatchPool,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0u32;

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        info!(url = %url, attempt = attempt + 1, "connecting to BSC WebSocket");

        let result = connect_and_listen(&url, &pool, &metrics, &shutdown).await;
        metrics.ws_connections.set(0);

        match result {
            Ok(()) => {
                info!("WebSocket listener stopped cleanly");
                return;
            }
            Err(e) => {
                attempt += 1;
                metrics.ws_reconnects.inc();
                let delay = reconnect_delay(attempt);
                warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "WebSocket disconnected, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }
}

async fn connect_and_listen(
    url: &str,
    pool: &DispatchPool,
    metrics: &EngineMetrics,
    shutdown: &CancellationToken,
) -> Result<(), EngineError> {
    let (ws_stream, _response) = connect_async(url)
        .await
        .map_err(|e| EngineError::Transient(format!("connect failed: {e}")))?;
    let (mut write, mut read) = ws_stream.split();
    metrics.ws_connections.set(1);

    // Subscribe every topic group; acks map request id → subscription id.
    let mut pending: HashMap<u64, String> = HashMap::new();
    let mut routes: HashMap<String, String> = HashMap::new();
    for (id, group, params) in subscription_requests() {
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": params,
        });
        write
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| EngineError::Transient(format!("subscribe send failed: {e}")))?;
        pending.insert(id, group);
    }
    info!(groups = pending.len(), "subscriptions requested");

    let mut ping_timer = tokio::time::interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // First tick fires immediately; skip it.
    let mut pong_deadline: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        metrics.messages_total.inc();
                        match decoder::classify_frame(text.as_str()) {
                            Ok(WireFrame::SubscriptionAck { id, subscription }) => {
                                if let Some(group) = pending.remove(&id) {
                                    info!(group = %group, subscription = %subscription, "subscription active");
                                    routes.insert(subscription, group);
                                }
                            }
                            Ok(WireFrame::LogNotification { subscription, log }) => {
                                match routes.get(&subscription) {
                                    Some(group) => debug!(group = %group, tx = %log.tx_hash, "log received"),
                                    None => debug!(subscription = %subscription, "log from unmapped subscription"),
                                }
                                // Blocks when the pool is saturated: the
                                // socket is the backpressure boundary.
                                if pool.submit(log).await.is_err() {
                                    debug!("dispatch pool closed, stopping listener");
                                    return Ok(());
                                }
                            }
                            Ok(WireFrame::Ignored) => {
                                metrics.frames_dropped.inc();
                            }
                            Err(e) => {
                                metrics.decode_errors.inc();
                                debug!(error = %e, "undecodable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(EngineError::Transient(format!(
                            "closed by server: {frame:?}"
                        )));
                    }
                    Some(Ok(_)) => {} // Binary, Frame: ignore.
                    Some(Err(e)) => {
                        return Err(EngineError::Transient(format!("read failed: {e}")));
                    }
                    None => {
                        return Err(EngineError::Transient("stream ended".into()));
                    }
                }
            }
            _ = ping_timer.tick() => {
                if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return Err(EngineError::Transient("ping send failed".into()));
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(tokio::time::Instant::now() + PONG_TIMEOUT);
                }
            }
            _ = async {
                match pong_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => futures::future::pending().await,
                }
            } => {
                return Err(EngineError::Transient("pong timeout".into()));
            }
            _ = shutdown.cancelled() => {
                info!("shutdown requested, closing WebSocket");
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_requests_cover_all_groups() {
        let requests = subscription_requests();
        // Two proxy contracts plus the swap topic.
        assert_eq!(requests.len(), 3);

        // Proxy subscriptions filter by address.
        assert!(requests[0].2[1]["address"]
            .as_str()
            .unwrap()
            .starts_with("0x"));
        assert_eq!(requests[0].1, "fourmeme-proxy-1");

        // The swap subscription filters by topic0.
        let topics = &requests[2].2[1]["topics"];
        assert_eq!(
            topics[0][0].as_str().unwrap().to_lowercase(),
            format!("{TOPIC_V2_SWAP}").to_lowercase()
        );

        // Request ids must be distinct for acks to route unambiguously.
        let mut ids: Vec<u64> = requests.iter().map(|(id, _, _)| *id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_reconnect_delay_bounds() {
        for attempt in 1..12 {
            let delay = reconnect_delay(attempt);
            assert!(delay >= Duration::from_secs(1).min(RECONNECT_CAP));
            assert!(delay <= RECONNECT_CAP + Duration::from_millis(RECONNECT_JITTER_MS));
        }
        // Early attempts stay short, late attempts hit the cap.
        assert!(reconnect_delay(1) < Duration::from_secs(3));
        assert!(reconnect_delay(10) >= RECONNECT_CAP);
    }
}
