//! Two-layer admission filter.
//!
//! Layer-1 is synchronous and RPC-free: orient the swap around the quote
//! asset, normalize to USD, and admit on the per-event threshold or the
//! cumulative rolling window. Layer-2 is HTTP-bound: fetch per-window
//! statistics (widening through the fallback table on thin data) and
//! evaluate the configured trigger rules.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::cache::{keys, CacheManager, KV_NO_DATA_TTL_SECS};
use crate::config::MonitorConfig;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::price::WbnbPriceCache;
use crate::stats::StatsApi;
use crate::types::{
    Completeness, EventOrigin, PairMeta, PriceStat, QuoteSide, StatWindow, SwapAmounts,
    TriggeredRule,
};
use crate::window::CumulativeWindows;

// ---------------------------------------------------------------------------
// Swap orientation and USD normalization
// ---------------------------------------------------------------------------

/// A swap reoriented around the quote asset. Only buys (quote in, target
/// out) are monitorable.
#[derive(Debug, Clone)]
pub struct OrientedSwap {
    pub quote_token: Address,
    pub base_token: Address,
    pub quote_amount: U256,
    pub base_amount: U256,
    pub quote_decimals: u8,
    pub base_decimals: u8,
    pub quote_symbol: String,
    pub base_symbol: String,
}

/// Determine which side of the swap is the quote asset.
///
/// Returns `None` for sells, pairs without exactly one quote side, and
/// payloads that violate the one-nonzero-side-per-token invariant.
pub fn orient_swap(meta: &PairMeta, amounts: &SwapAmounts) -> Option<OrientedSwap> {
    let quote_side = meta.quote_side()?;

    if amounts.amount0_in > U256::ZERO && amounts.amount1_out > U256::ZERO {
        if quote_side == QuoteSide::Token0 {
            return Some(OrientedSwap {
                quote_token: meta.token0,
                base_token: meta.token1,
                quote_amount: amounts.amount0_in,
                base_amount: amounts.amount1_out,
                quote_decimals: meta.decimals0,
                base_decimals: meta.decimals1,
                quote_symbol: meta.symbol0.clone(),
                base_symbol: meta.symbol1.clone(),
            });
        }
    } else if amounts.amount1_in > U256::ZERO && amounts.amount0_out > U256::ZERO {
        if quote_side == QuoteSide::Token1 {
            return Some(OrientedSwap {
                quote_token: meta.token1,
                base_token: meta.token0,
                quote_amount: amounts.amount1_in,
                base_amount: amounts.amount0_out,
                quote_decimals: meta.decimals1,
                base_decimals: meta.decimals0,
                quote_symbol: meta.symbol1.clone(),
                base_symbol: meta.symbol0.clone(),
            });
        }
    }
    None
}

/// Scale a raw token amount by its decimals.
///
/// Goes through the string form: U256 overflows `Decimal` for large raw
/// values, but after the point shift the magnitudes are token amounts.
/// The fraction is capped at 12 digits, far inside USD precision.
pub fn normalize_units(amount: U256, decimals: u8) -> Decimal {
    let raw = amount.to_string();
    let d = decimals as usize;

    let (int_part, frac_part) = if raw.len() > d {
        let split = raw.len() - d;
        (raw[..split].to_string(), raw[split..].to_string())
    } else {
        ("0".to_string(), format!("{raw:0>d$}"))
    };

    let frac: String = frac_part.chars().take(12).collect();
    let text = if frac.is_empty() {
        int_part
    } else {
        format!("{int_part}.{frac}")
    };
    Decimal::from_str(&text).unwrap_or(Decimal::ZERO)
}

/// USD value of a quote-asset amount. Stablecoins are 1 USD; WBNB goes
/// through the price cache. `None` when no WBNB quote is available.
pub fn usd_value(
    quote_token: &Address,
    quote_amount: Decimal,
    price_cache: &WbnbPriceCache,
) -> Option<Decimal> {
    if *quote_token == crate::constants::WBNB {
        Some(quote_amount * price_cache.get()?)
    } else {
        Some(quote_amount)
    }
}

// ---------------------------------------------------------------------------
// Layer-1
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum Layer1Verdict {
    /// Admitted on the per-event threshold.
    AdmitSingle,
    /// Admitted because the rolling window crossed the cumulative minimum.
    AdmitCumulative(Decimal),
    Reject,
}

/// Threshold-or-cumulative admission for one event.
pub fn evaluate_layer1(
    windows: &CumulativeWindows,
    origin: EventOrigin,
    token: Address,
    usd: Decimal,
    config: &MonitorConfig,
) -> Layer1Verdict {
    let (threshold, cumulative_min) = match origin {
        EventOrigin::Internal => (config.min_usd_internal, config.cumulative_min_usd_internal),
        EventOrigin::External => (config.min_usd_external, config.cumulative_min_usd_external),
    };

    if usd >= threshold {
        return Layer1Verdict::AdmitSingle;
    }

    // Below the per-event threshold: accumulate. A cumulative admission
    // clears the window so the same accumulation cannot admit twice.
    let sum = windows.record(token, usd);
    if sum >= cumulative_min {
        windows.reset(&token);
        return Layer1Verdict::AdmitCumulative(sum);
    }
    Layer1Verdict::Reject
}

// ---------------------------------------------------------------------------
// Layer-2
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Layer2Verdict {
    Triggered {
        rules: Vec<TriggeredRule>,
        stat: PriceStat,
    },
    Rejected,
    /// Every window was empty; the pair is negative-cached.
    NoData,
}

pub struct FilterEngine {
    windows: CumulativeWindows,
    caches: Arc<CacheManager>,
    stats: Arc<StatsApi>,
    price: WbnbPriceCache,
    metrics: Arc<EngineMetrics>,
}

impl FilterEngine {
    pub fn new(
        cumulative_window: Duration,
        caches: Arc<CacheManager>,
        stats: Arc<StatsApi>,
        price: WbnbPriceCache,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            windows: CumulativeWindows::new(cumulative_window),
            caches,
            stats,
            price,
            metrics,
        }
    }

    pub fn price_cache(&self) -> &WbnbPriceCache {
        &self.price
    }

    pub fn windows(&self) -> &CumulativeWindows {
        &self.windows
    }

    /// Layer-1: per-event threshold, then the cumulative window.
    pub fn layer1(
        &self,
        origin: EventOrigin,
        token: Address,
        usd: Decimal,
        config: &MonitorConfig,
    ) -> Layer1Verdict {
        let verdict = evaluate_layer1(&self.windows, origin, token, usd, config);
        if verdict != Layer1Verdict::Reject {
            self.metrics
                .first_layer_pass
                .with_label_values(&[origin.as_str()])
                .inc();
        }
        verdict
    }

    /// Layer-2: statistics rules with window fallback and negative caching.
    pub async fn layer2(
        &self,
        token: Address,
        pair: Address,
        origin: EventOrigin,
        config: &MonitorConfig,
    ) -> Result<Layer2Verdict, EngineError> {
        let rule_set = match origin {
            EventOrigin::Internal => &config.internal_rules,
            EventOrigin::External => &config.external_rules,
        };
        if rule_set.rules.is_empty() {
            return Ok(Layer2Verdict::Rejected);
        }

        // Negative cache: a recently-empty pair blocks Layer-2 for its TTL.
        if self.caches.no_data_pairs.get(&pair).is_some() {
            self.metrics.cache_hits.with_label_values(&["stat"]).inc();
            return Ok(Layer2Verdict::NoData);
        }
        if let Ok(Some(_)) = self.caches.kv.get(&keys::no_data_pair(&pair)).await {
            self.caches.no_data_pairs.insert(pair, ());
            return Ok(Layer2Verdict::NoData);
        }

        self.metrics
            .second_layer_check
            .with_label_values(&[origin.as_str()])
            .inc();

        let mut stats_by_window: HashMap<StatWindow, PriceStat> = HashMap::new();

        for requested in rule_set.windows() {
            match self.fetch_with_fallback(pair, token, requested).await? {
                Some(stat) => {
                    stats_by_window.insert(requested, stat);
                }
                None => {
                    self.mark_no_data(pair).await;
                    return Ok(Layer2Verdict::NoData);
                }
            }
        }

        let (triggered, fired) = rule_set.evaluate(&stats_by_window);
        if !triggered {
            debug!(token = %token, "layer-2 rules not met");
            return Ok(Layer2Verdict::Rejected);
        }

        // Report the narrowest fetched window's statistics with the alert.
        // No rule can fire without a fetched window; an empty map rejects.
        let narrowest = stats_by_window.keys().min().copied();
        let Some(stat) = narrowest.and_then(|window| stats_by_window.remove(&window)) else {
            return Ok(Layer2Verdict::Rejected);
        };

        self.metrics
            .second_layer_pass
            .with_label_values(&[origin.as_str()])
            .inc();
        Ok(Layer2Verdict::Triggered { rules: fired, stat })
    }

    /// Fetch a window's statistics, widening per the fallback table until a
    /// complete window is found. `None` means every window came back empty.
    async fn fetch_with_fallback(
        &self,
        pair: Address,
        token: Address,
        requested: StatWindow,
    ) -> Result<Option<PriceStat>, EngineError> {
        let mut window = requested;
        loop {
            let stat = self.stats.pair_stats(pair, token, window).await?;
            if stat.completeness == Completeness::Complete {
                return Ok(Some(stat));
            }

            match window.wider() {
                Some(next) => {
                    self.metrics
                        .fallback
                        .with_label_values(&[&format!(
                            "{}->{}",
                            window.as_str(),
                            next.as_str()
                        )])
                        .inc();
                    debug!(pair = %pair, from = window.as_str(), to = next.as_str(), "widening stats window");
                    window = next;
                }
                // Widest window reached: partial data is still usable,
                // empty data negative-caches the pair.
                None if stat.completeness == Completeness::Partial => return Ok(Some(stat)),
                None => return Ok(None),
            }
        }
    }

    async fn mark_no_data(&self, pair: Address) {
        self.metrics.no_data_pairs.inc();
        self.caches.no_data_pairs.insert(pair, ());
        if let Err(e) = self
            .caches
            .kv
            .set_ex(&keys::no_data_pair(&pair), "1", KV_NO_DATA_TTL_SECS)
            .await
        {
            warn!(pair = %pair, error = %e, "failed to persist no-data marker");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{USDT, WBNB};
    use rust_decimal_macros::dec;

    fn target() -> Address {
        "0x1111111111111111111111111111111111111111".parse().unwrap()
    }

    fn meta(token0: Address, token1: Address) -> PairMeta {
        PairMeta {
            pair: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            token0,
            token1,
            decimals0: 18,
            decimals1: 18,
            symbol0: "Q".into(),
            symbol1: "T".into(),
            resolved_at: 0,
        }
    }

    fn wei(n: u64) -> U256 {
        U256::from(n) * U256::from(10u64).pow(U256::from(18))
    }

    #[test]
    fn test_orient_swap_quote_in_token0() {
        let m = meta(USDT, target());
        let amounts = SwapAmounts {
            amount0_in: wei(500),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: wei(1000),
        };
        let oriented = orient_swap(&m, &amounts).unwrap();
        assert_eq!(oriented.quote_token, USDT);
        assert_eq!(oriented.base_token, target());
        assert_eq!(oriented.quote_amount, wei(500));
        assert_eq!(oriented.base_amount, wei(1000));
    }

    #[test]
    fn test_orient_swap_quote_in_token1() {
        let m = meta(target(), WBNB);
        let amounts = SwapAmounts {
            amount0_in: U256::ZERO,
            amount1_in: wei(2),
            amount0_out: wei(777),
            amount1_out: U256::ZERO,
        };
        let oriented = orient_swap(&m, &amounts).unwrap();
        assert_eq!(oriented.quote_token, WBNB);
        assert_eq!(oriented.base_token, target());
    }

    #[test]
    fn test_orient_swap_rejects_sells_and_quote_pairs() {
        // Sell: target in, quote out.
        let m = meta(USDT, target());
        let sell = SwapAmounts {
            amount0_in: U256::ZERO,
            amount1_in: wei(1000),
            amount0_out: wei(500),
            amount1_out: U256::ZERO,
        };
        assert!(orient_swap(&m, &sell).is_none());

        // Quote/quote pair.
        let m2 = meta(USDT, WBNB);
        let buy = SwapAmounts {
            amount0_in: wei(1),
            amount1_in: U256::ZERO,
            amount0_out: U256::ZERO,
            amount1_out: wei(1),
        };
        assert!(orient_swap(&m2, &buy).is_none());
    }

    #[test]
    fn test_normalize_units() {
        // 0.6 WBNB in wei.
        let amount = U256::from(600_000_000_000_000_000u128);
        assert_eq!(normalize_units(amount, 18), dec!(0.6));

        assert_eq!(normalize_units(U256::from(1500u64), 3), dec!(1.5));
        assert_eq!(normalize_units(U256::ZERO, 18), Decimal::ZERO);
        assert_eq!(normalize_units(U256::from(7u64), 0), dec!(7));
    }

    #[test]
    fn test_layer1_single_trade_admission() {
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let config = crate::config::MonitorConfig::default();

        // $600 against the $400 external threshold.
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(600), &config),
            Layer1Verdict::AdmitSingle
        );
        // Exactly at the threshold admits.
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(400), &config),
            Layer1Verdict::AdmitSingle
        );
    }

    #[test]
    fn test_layer1_cumulative_admission() {
        // Three $250 external swaps: first two rejected but accumulated,
        // the third admits on cumulative $750 >= $600.
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let mut config = crate::config::MonitorConfig::default();
        config.min_usd_external = dec!(400);
        config.cumulative_min_usd_external = dec!(600);

        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(250), &config),
            Layer1Verdict::Reject
        );
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(250), &config),
            Layer1Verdict::Reject
        );
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(250), &config),
            Layer1Verdict::AdmitCumulative(dec!(750))
        );
        // The window was cleared by the admission.
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(250), &config),
            Layer1Verdict::Reject
        );
    }

    #[test]
    fn test_layer1_origin_thresholds_differ() {
        let windows = CumulativeWindows::new(Duration::from_secs(300));
        let config = crate::config::MonitorConfig::default();

        // $250 clears the internal threshold ($200) but not the external ($400).
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::Internal, target(), dec!(250), &config),
            Layer1Verdict::AdmitSingle
        );
        assert_eq!(
            evaluate_layer1(&windows, EventOrigin::External, target(), dec!(250), &config),
            Layer1Verdict::Reject
        );
    }

    #[test]
    fn test_usd_value_wbnb_and_stable() {
        use crate::price::WbnbPriceCache;

        // Stablecoin: face value, no price needed.
        let no_price = WbnbPriceCache::new(false);
        assert_eq!(
            usd_value(&USDT, dec!(250), &no_price),
            Some(dec!(250))
        );
        // WBNB without a quote: unpriceable.
        assert_eq!(usd_value(&WBNB, dec!(0.6), &no_price), None);
    }
}
