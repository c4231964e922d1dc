//! JSON-RPC client for the BSC HTTP endpoint.
//!
//! Hand-rolled JSON-RPC over a pooled reqwest client: the engine only needs
//! `eth_getTransactionReceipt`, `eth_call`, `eth_getTransactionByHash` and
//! `eth_blockNumber`, plus a Multicall3 `tryAggregate` batch for metadata
//! resolution. Transient failures (network, 5xx, 429) retry with exponential
//! backoff and jitter; a missing receipt is `Ok(None)` and never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::SolCall;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::constants::MULTICALL3;
use crate::decoder;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::types::{LogEvent, ReceiptRecord};

/// Per-call deadline.
const RPC_TIMEOUT: Duration = Duration::from_secs(3);
/// Retries after the initial attempt, transient failures only.
const MAX_RETRIES: u32 = 3;
/// Base delay of the exponential backoff schedule.
const BACKOFF_BASE_MS: u64 = 100;
/// Uniform jitter added on top of each backoff step.
const BACKOFF_JITTER_MS: u64 = 50;

sol! {
    struct Call3 {
        address target;
        bytes callData;
    }

    struct AggregateResult {
        bool success;
        bytes returnData;
    }

    function tryAggregate(bool requireSuccess, Call3[] calls)
        returns (AggregateResult[] returnData);
}

pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl RpcClient {
    pub fn new(url: String, metrics: Arc<EngineMetrics>) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(RPC_TIMEOUT)
            .pool_max_idle_per_host(100)
            .build()?;
        Ok(Self {
            client,
            url,
            next_id: AtomicU64::new(1),
            metrics,
        })
    }

    // -----------------------------------------------------------------------
    // High-level calls
    // -----------------------------------------------------------------------

    /// Fetch a transaction receipt. `Ok(None)` means the transaction is
    /// still pending; the caller drops the event, no retry.
    pub async fn get_receipt(&self, tx_hash: B256) -> Result<Option<ReceiptRecord>, EngineError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([format!("{tx_hash}")]))
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let status = result
            .get("status")
            .and_then(Value::as_str)
            .map(|s| s == "0x1")
            .unwrap_or(false);
        let gas_used = result
            .get("gasUsed")
            .and_then(Value::as_str)
            .map(decoder::parse_hex_u64)
            .transpose()?
            .unwrap_or(0);

        let logs = result
            .get("logs")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(decoder::log_from_json)
                    .collect::<Result<Vec<LogEvent>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Some(ReceiptRecord {
            tx_hash,
            status,
            gas_used,
            logs,
        }))
    }

    /// `eth_call` against `to` at the latest block. Returns raw return data.
    pub async fn eth_call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, EngineError> {
        let result = self
            .call(
                "eth_call",
                json!([{ "to": format!("{to}"), "data": format!("0x{}", hex::encode(data)) }, "latest"]),
            )
            .await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| EngineError::Decode("eth_call result is not a string".into()))?;
        decoder::parse_hex_bytes(hex_str)
    }

    /// Current block number.
    pub async fn block_number(&self) -> Result<u64, EngineError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        let hex_str = result
            .as_str()
            .ok_or_else(|| EngineError::Decode("eth_blockNumber result is not a string".into()))?;
        decoder::parse_hex_u64(hex_str)
    }

    /// Native value of a transaction (for BNB-funded launchpad buys).
    pub async fn transaction_value(&self, tx_hash: B256) -> Result<U256, EngineError> {
        let result = self
            .call("eth_getTransactionByHash", json!([format!("{tx_hash}")]))
            .await?;
        let value = result
            .get("value")
            .and_then(Value::as_str)
            .map(|s| {
                let s = s.strip_prefix("0x").unwrap_or(s);
                U256::from_str_radix(s, 16)
                    .map_err(|e| EngineError::Decode(format!("invalid tx value: {e}")))
            })
            .transpose()?
            .unwrap_or(U256::ZERO);
        Ok(value)
    }

    /// Batch several view calls through Multicall3 `tryAggregate`.
    ///
    /// Per-call failures inside the batch surface as `None` for that slot.
    /// If the batch itself fails (bad node, empty return), degrades to one
    /// `eth_call` per entry.
    pub async fn try_aggregate(
        &self,
        calls: &[(Address, Vec<u8>)],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let encoded = tryAggregateCall {
            requireSuccess: false,
            calls: calls
                .iter()
                .map(|(target, data)| Call3 {
                    target: *target,
                    callData: Bytes::from(data.clone()),
                })
                .collect(),
        }
        .abi_encode();

        match self.eth_call(MULTICALL3, encoded).await {
            Ok(raw) if !raw.is_empty() => match tryAggregateCall::abi_decode_returns(&raw, true) {
                Ok(decoded) => Ok(decoded
                    .returnData
                    .into_iter()
                    .map(|r| {
                        if r.success && !r.returnData.is_empty() {
                            Some(r.returnData.to_vec())
                        } else {
                            None
                        }
                    })
                    .collect()),
                Err(e) => {
                    warn!(error = %e, "tryAggregate return data undecodable, falling back to individual calls");
                    self.individual_calls(calls).await
                }
            },
            Ok(_) => {
                warn!("tryAggregate returned empty data, falling back to individual calls");
                self.individual_calls(calls).await
            }
            Err(e) => {
                warn!(error = %e, "tryAggregate failed, falling back to individual calls");
                self.individual_calls(calls).await
            }
        }
    }

    async fn individual_calls(
        &self,
        calls: &[(Address, Vec<u8>)],
    ) -> Result<Vec<Option<Vec<u8>>>, EngineError> {
        let mut results = Vec::with_capacity(calls.len());
        for (target, data) in calls {
            match self.eth_call(*target, data.clone()).await {
                Ok(ret) if !ret.is_empty() => results.push(Some(ret)),
                Ok(_) => results.push(None),
                Err(e) => {
                    debug!(contract = %target, error = %e, "view call failed");
                    results.push(None);
                }
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Transport
    // -----------------------------------------------------------------------

    /// Issue one JSON-RPC call with the retry schedule.
    async fn call(&self, method: &str, params: Value) -> Result<Value, EngineError> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(method, &params).await {
                Ok(value) => return Ok(value),
                Err(CallFailure::Terminal(e)) => return Err(e),
                Err(CallFailure::Transient { reason, retry_after }) => {
                    if attempt >= MAX_RETRIES {
                        return Err(EngineError::Transient(format!(
                            "{method} failed after {MAX_RETRIES} retries: {reason}"
                        )));
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    debug!(method, attempt, delay_ms = delay.as_millis() as u64, %reason, "retrying RPC call");
                    self.metrics.rpc_retries.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, CallFailure> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallFailure::Transient {
                reason: e.to_string(),
                retry_after: None,
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            self.metrics.rate_limited.inc();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(CallFailure::Transient {
                reason: "rate limited (429)".into(),
                retry_after,
            });
        }
        if status.is_server_error() {
            return Err(CallFailure::Transient {
                reason: format!("server error ({status})"),
                retry_after: None,
            });
        }
        if !status.is_success() {
            return Err(CallFailure::Terminal(EngineError::Decode(format!(
                "{method} returned HTTP {status}"
            ))));
        }

        let body: Value = resp.json().await.map_err(|e| CallFailure::Transient {
            reason: format!("body read failed: {e}"),
            retry_after: None,
        })?;

        if let Some(err) = body.get("error") {
            // JSON-RPC level errors (reverts, bad params) are not transient.
            return Err(CallFailure::Terminal(EngineError::Decode(format!(
                "{method} rpc error: {err}"
            ))));
        }

        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }
}

enum CallFailure {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Terminal(EngineError),
}

/// Exponential backoff with uniform jitter: `100ms * 2^n + U(0, 50ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_bounds() {
        for attempt in 0..4 {
            let d = backoff_delay(attempt).as_millis() as u64;
            let base = BACKOFF_BASE_MS * (1 << attempt);
            assert!(d >= base, "attempt {attempt}: {d} < {base}");
            assert!(
                d <= base + BACKOFF_JITTER_MS,
                "attempt {attempt}: {d} > {}",
                base + BACKOFF_JITTER_MS
            );
        }
    }

    #[test]
    fn test_backoff_is_monotonic_in_base() {
        // The deterministic part doubles each attempt.
        let floor = |n: u32| BACKOFF_BASE_MS * (1 << n);
        assert!(floor(1) == 2 * floor(0));
        assert!(floor(3) == 8 * floor(0));
    }

    #[test]
    fn test_try_aggregate_encoding_selector() {
        // tryAggregate(bool,(address,bytes)[]) has a fixed selector.
        let call = tryAggregateCall {
            requireSuccess: false,
            calls: vec![],
        };
        let encoded = call.abi_encode();
        assert_eq!(&encoded[..4], &[0xbc, 0xe3, 0x8b, 0xd7]);
    }
}
