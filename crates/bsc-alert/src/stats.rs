//! Client for the external token statistics and launchpad classifier APIs.
//!
//! Layer-2 filtering is driven by per-window pair statistics; the launchpad
//! endpoint gates external-origin events. Both endpoints share one pooled
//! client and the same retry policy (429/5xx/timeouts, up to 3 attempts).

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::types::{Completeness, PriceStat, StatWindow};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;

pub struct StatsApi {
    client: reqwest::Client,
    stats_base_url: String,
    launchpad_base_url: String,
    api_key: Option<String>,
    metrics: Arc<EngineMetrics>,
}

/// Wire shape of `GET /pair/{addr}?interval={1m|5m|1h}`.
#[derive(Debug, Deserialize)]
struct PairStatsResponse {
    #[serde(rename = "priceChange", default)]
    price_change: f64,
    #[serde(default)]
    volume: f64,
    #[serde(default)]
    txs: u32,
    #[serde(default)]
    top10: f64,
    #[serde(default)]
    completeness: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    price: f64,
    #[serde(rename = "marketCap", default)]
    market_cap: f64,
}

/// Wire shape of `GET /launchpad/{token}`.
#[derive(Debug, Deserialize)]
struct LaunchpadResponse {
    is_fourmeme: bool,
}

impl StatsApi {
    pub fn new(
        stats_base_url: String,
        launchpad_base_url: String,
        api_key: Option<String>,
        metrics: Arc<EngineMetrics>,
    ) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .pool_max_idle_per_host(20)
            .build()?;
        Ok(Self {
            client,
            stats_base_url,
            launchpad_base_url,
            api_key,
            metrics,
        })
    }

    /// Fetch statistics for one pair and window.
    pub async fn pair_stats(
        &self,
        pair: Address,
        token: Address,
        window: StatWindow,
    ) -> Result<PriceStat, EngineError> {
        let url = format!("{}/pair/{pair}", self.stats_base_url);
        let body = self
            .get_with_retry(&url, &[("interval", window.as_str())])
            .await?;
        let parsed: PairStatsResponse = serde_json::from_str(&body)?;
        Ok(to_price_stat(parsed, token, window))
    }

    /// Launchpad classification for a token.
    pub async fn is_fourmeme(&self, token: Address) -> Result<bool, EngineError> {
        let url = format!("{}/launchpad/{token}", self.launchpad_base_url);
        let body = self.get_with_retry(&url, &[]).await?;
        let parsed: LaunchpadResponse = serde_json::from_str(&body)?;
        Ok(parsed.is_fourmeme)
    }

    async fn get_with_retry(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<String, EngineError> {
        let mut last_err = String::new();
        for attempt in 0..MAX_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
            }

            let mut req = self.client.get(url).query(query);
            if let Some(key) = &self.api_key {
                req = req.header("x-api-key", key);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }
                    if status.as_u16() == 429 {
                        self.metrics.rate_limited.inc();
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = format!("HTTP {status}");
                        debug!(url, attempt, %status, "stats API retryable failure");
                        continue;
                    }
                    return Err(EngineError::Transient(format!(
                        "stats API returned {status}"
                    )));
                }
                Err(e) => {
                    last_err = e.to_string();
                    debug!(url, attempt, error = %e, "stats API request failed");
                    continue;
                }
            }
        }
        warn!(url, attempts = MAX_ATTEMPTS, error = %last_err, "stats API exhausted retries");
        Err(EngineError::Transient(format!(
            "stats API failed after {MAX_ATTEMPTS} attempts: {last_err}"
        )))
    }
}

fn to_price_stat(resp: PairStatsResponse, token: Address, window: StatWindow) -> PriceStat {
    PriceStat {
        token,
        window,
        symbol: resp.symbol.unwrap_or_else(|| "Unknown".to_string()),
        price_usd: dec(resp.price),
        price_change_pct: dec(resp.price_change),
        volume_usd: dec(resp.volume),
        tx_count: resp.txs,
        top10_pct: dec(resp.top10),
        market_cap_usd: dec(resp.market_cap),
        completeness: Completeness::parse(&resp.completeness),
    }
}

fn dec(value: f64) -> Decimal {
    Decimal::try_from(value).unwrap_or(Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pair_stats_parse() {
        let body = r#"{
            "priceChange": 22.5,
            "volume": 18000.0,
            "txs": 42,
            "top10": 31.2,
            "completeness": "complete",
            "symbol": "PEPE",
            "price": 0.0021,
            "marketCap": 1500000.0
        }"#;
        let parsed: PairStatsResponse = serde_json::from_str(body).unwrap();
        let stat = to_price_stat(parsed, Address::ZERO, StatWindow::OneMinute);

        assert_eq!(stat.price_change_pct, dec!(22.5));
        assert_eq!(stat.volume_usd, dec!(18000.0));
        assert_eq!(stat.tx_count, 42);
        assert_eq!(stat.symbol, "PEPE");
        assert_eq!(stat.completeness, Completeness::Complete);
        assert_eq!(stat.window, StatWindow::OneMinute);
    }

    #[test]
    fn test_pair_stats_empty_window() {
        let body = r#"{"completeness": "empty"}"#;
        let parsed: PairStatsResponse = serde_json::from_str(body).unwrap();
        let stat = to_price_stat(parsed, Address::ZERO, StatWindow::FiveMinutes);

        assert_eq!(stat.completeness, Completeness::Empty);
        assert_eq!(stat.price_change_pct, Decimal::ZERO);
        assert_eq!(stat.volume_usd, Decimal::ZERO);
        assert_eq!(stat.symbol, "Unknown");
    }

    #[test]
    fn test_launchpad_parse() {
        let yes: LaunchpadResponse = serde_json::from_str(r#"{"is_fourmeme": true}"#).unwrap();
        assert!(yes.is_fourmeme);
        let no: LaunchpadResponse = serde_json::from_str(r#"{"is_fourmeme": false}"#).unwrap();
        assert!(!no.is_fourmeme);
    }
}
