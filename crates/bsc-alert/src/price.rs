//! WBNB spot price cache and background refresh task.
//!
//! The quote side of a WBNB pair is priced through this cache; stablecoin
//! quotes are 1 USD and never touch it. A live quote is required before the
//! engine starts unless the operator explicitly allows the hard default.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Refresh cadence; also the staleness TTL of a quote.
const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Hard default, used only when explicitly enabled and no live quote was
/// ever obtained.
const DEFAULT_WBNB_PRICE: Decimal = dec!(600);

#[derive(Debug, Clone)]
pub struct WbnbPriceCache {
    inner: Arc<Mutex<PriceState>>,
    allow_default: bool,
}

#[derive(Debug)]
struct PriceState {
    live: Option<Decimal>,
}

impl WbnbPriceCache {
    pub fn new(allow_default: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(PriceState { live: None })),
            allow_default,
        }
    }

    /// The current WBNB/USD price.
    ///
    /// `None` only when no live quote was ever obtained and the default is
    /// not enabled; callers must drop the event in that case.
    pub fn get(&self) -> Option<Decimal> {
        let live = self.inner.lock().expect("price lock poisoned").live;
        live.or(if self.allow_default {
            Some(DEFAULT_WBNB_PRICE)
        } else {
            None
        })
    }

    pub fn has_live_quote(&self) -> bool {
        self.inner.lock().expect("price lock poisoned").live.is_some()
    }

    fn update(&self, price: Decimal) {
        self.inner.lock().expect("price lock poisoned").live = Some(price);
    }
}

/// Fetch one quote and install it. Used at startup before any event flows.
pub async fn prime(
    cache: &WbnbPriceCache,
    client: &reqwest::Client,
    spot_api_url: &str,
) -> Result<(), EngineError> {
    let price = fetch_spot_price(client, spot_api_url).await?;
    cache.update(price);
    info!(price = %price, "WBNB price primed");
    Ok(())
}

/// Background refresh loop. Keeps the last known quote on failure.
pub async fn run_price_updater(
    cache: WbnbPriceCache,
    spot_api_url: String,
    shutdown: CancellationToken,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "failed to build price updater HTTP client");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = tokio::time::sleep(REFRESH_INTERVAL) => {}
            _ = shutdown.cancelled() => {
                debug!("price updater shutting down");
                return;
            }
        }

        match fetch_spot_price(&client, &spot_api_url).await {
            Ok(price) => {
                debug!(price = %price, "WBNB price refreshed");
                cache.update(price);
            }
            Err(e) => {
                warn!(error = %e, "WBNB price refresh failed, keeping last quote");
            }
        }
    }
}

/// `GET {base}/spot/tickers?currency_pair=BNB_USDT` → `[{"last": "…"}]`.
async fn fetch_spot_price(
    client: &reqwest::Client,
    spot_api_url: &str,
) -> Result<Decimal, EngineError> {
    let url = format!("{spot_api_url}/spot/tickers");
    let resp = client
        .get(&url)
        .query(&[("currency_pair", "BNB_USDT")])
        .send()
        .await?;

    if !resp.status().is_success() {
        return Err(EngineError::Transient(format!(
            "spot API returned {}",
            resp.status()
        )));
    }

    let body: Value = resp.json().await?;
    parse_ticker_price(&body)
        .ok_or_else(|| EngineError::Decode("spot API response missing last price".into()))
}

fn parse_ticker_price(body: &Value) -> Option<Decimal> {
    let last = body.as_array()?.first()?.get("last")?.as_str()?;
    last.parse::<Decimal>().ok().filter(|p| *p > Decimal::ZERO)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_quote_without_default() {
        let cache = WbnbPriceCache::new(false);
        assert_eq!(cache.get(), None);
        assert!(!cache.has_live_quote());
    }

    #[test]
    fn test_default_only_when_enabled() {
        let cache = WbnbPriceCache::new(true);
        assert_eq!(cache.get(), Some(dec!(600)));
        assert!(!cache.has_live_quote());
    }

    #[test]
    fn test_live_quote_overrides_default() {
        let cache = WbnbPriceCache::new(true);
        cache.update(dec!(1000));
        assert_eq!(cache.get(), Some(dec!(1000)));
        assert!(cache.has_live_quote());
    }

    #[test]
    fn test_parse_ticker_price() {
        let body = serde_json::json!([{"currency_pair": "BNB_USDT", "last": "612.34"}]);
        assert_eq!(parse_ticker_price(&body), Some(dec!(612.34)));

        let empty = serde_json::json!([]);
        assert_eq!(parse_ticker_price(&empty), None);

        let zero = serde_json::json!([{"last": "0"}]);
        assert_eq!(parse_ticker_price(&zero), None);
    }
}
