//! Pair and token metadata resolution.
//!
//! Reads go hot → warm → KV → chain. A cold pair costs one `eth_call` for
//! each of `token0()`/`token1()` plus a single Multicall3 batch for the
//! decimals and symbols of both sides. Resolution is single-flight per key:
//! concurrent misses wait on the winner and re-read the cache.

use std::sync::Arc;

use alloy::primitives::{Address, U256};
use chrono::Utc;
use tracing::{debug, warn};

use crate::cache::{keys, CacheManager, KV_FOURMEME_TTL_SECS, KV_TOKEN_META_TTL_SECS};
use crate::constants::{MAX_TOKEN_DECIMALS, SEL_DECIMALS, SEL_SYMBOL, SEL_TOKEN0, SEL_TOKEN1};
use crate::decoder;
use crate::error::EngineError;
use crate::metrics::EngineMetrics;
use crate::rpc::RpcClient;
use crate::stats::StatsApi;
use crate::types::{LaunchpadClass, PairMeta};

pub struct MetadataResolver {
    rpc: Arc<RpcClient>,
    caches: Arc<CacheManager>,
    stats: Arc<StatsApi>,
    metrics: Arc<EngineMetrics>,
}

impl MetadataResolver {
    pub fn new(
        rpc: Arc<RpcClient>,
        caches: Arc<CacheManager>,
        stats: Arc<StatsApi>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            rpc,
            caches,
            stats,
            metrics,
        }
    }

    // -----------------------------------------------------------------------
    // Pair metadata
    // -----------------------------------------------------------------------

    /// Resolve full pair metadata, serving from cache where possible.
    pub async fn resolve_pair(&self, pair: Address) -> Result<PairMeta, EngineError> {
        if let Some(meta) = self.caches.pair_meta(&pair) {
            return Ok(meta);
        }

        let flight_key = format!("pair:{pair}");
        let _guard = self.caches.lock_key(&flight_key).await;

        // The winner may have published while we waited.
        if let Some(meta) = self.caches.pair_meta(&pair) {
            return Ok(meta);
        }

        let result = self.resolve_pair_uncached(pair).await;
        self.caches.release_key(&flight_key);

        match result {
            Ok(meta) => {
                self.caches.store_pair_meta(meta.clone());
                Ok(meta)
            }
            Err(e) => {
                debug!(pair = %pair, error = %e, "pair resolution failed");
                Err(EngineError::Resolve(pair))
            }
        }
    }

    async fn resolve_pair_uncached(&self, pair: Address) -> Result<PairMeta, EngineError> {
        let (token0, token1) = self.pair_tokens(pair).await?;
        let (decimals0, symbol0) = self.token_meta(token0).await?;
        let (decimals1, symbol1) = self.token_meta(token1).await?;

        Ok(PairMeta {
            pair,
            token0,
            token1,
            decimals0,
            decimals1,
            symbol0,
            symbol1,
            resolved_at: Utc::now().timestamp(),
        })
    }

    /// `token0()`/`token1()` of a pair, with a persistent-tier shortcut.
    async fn pair_tokens(&self, pair: Address) -> Result<(Address, Address), EngineError> {
        let kv_key = keys::pair_tokens(&pair);
        if let Ok(Some(cached)) = self.caches.kv.get(&kv_key).await {
            if let Some((t0, t1)) = cached.split_once(',') {
                if let (Ok(token0), Ok(token1)) = (t0.parse::<Address>(), t1.parse::<Address>()) {
                    return Ok((token0, token1));
                }
            }
        }

        let ret0 = self.rpc.eth_call(pair, SEL_TOKEN0.to_vec()).await?;
        let ret1 = self.rpc.eth_call(pair, SEL_TOKEN1.to_vec()).await?;
        let token0 = decoder::address_from_word(&ret0)?;
        let token1 = decoder::address_from_word(&ret1)?;

        if let Err(e) = self
            .caches
            .kv
            .set_ex(
                &kv_key,
                &format!("{token0},{token1}"),
                KV_TOKEN_META_TTL_SECS,
            )
            .await
        {
            warn!(pair = %pair, error = %e, "failed to persist pair tokens");
        }

        Ok((token0, token1))
    }

    // -----------------------------------------------------------------------
    // Token metadata (decimals + symbol)
    // -----------------------------------------------------------------------

    /// Decimals and symbol for one token: warm → KV → Multicall3 batch.
    pub async fn token_meta(&self, token: Address) -> Result<(u8, String), EngineError> {
        let cached_decimals = self.caches.token_decimals.get(&token);
        let cached_symbol = self.caches.token_symbols.get(&token);
        if let (Some(decimals), Some(symbol)) = (cached_decimals, cached_symbol.clone()) {
            return Ok((decimals, symbol));
        }

        let flight_key = format!("token:{token}");
        let _guard = self.caches.lock_key(&flight_key).await;

        let result = self
            .token_meta_uncached(token, cached_decimals, cached_symbol)
            .await;
        self.caches.release_key(&flight_key);
        result
    }

    async fn token_meta_uncached(
        &self,
        token: Address,
        mut decimals: Option<u8>,
        mut symbol: Option<String>,
    ) -> Result<(u8, String), EngineError> {
        // Re-check under the lock.
        decimals = decimals.or_else(|| self.caches.token_decimals.get(&token));
        symbol = symbol.or_else(|| self.caches.token_symbols.get(&token));

        // Persistent tier.
        if decimals.is_none() {
            if let Ok(Some(raw)) = self.caches.kv.get(&keys::token_decimals(&token)).await {
                if let Ok(value) = raw.parse::<u8>() {
                    decimals = Some(value);
                }
            }
        }
        if symbol.is_none() {
            if let Ok(Some(raw)) = self.caches.kv.get(&keys::token_symbol(&token)).await {
                symbol = Some(raw);
            }
        }

        // Chain, batched: only the fields still missing.
        if decimals.is_none() || symbol.is_none() {
            let mut calls: Vec<(Address, Vec<u8>)> = Vec::new();
            if decimals.is_none() {
                calls.push((token, SEL_DECIMALS.to_vec()));
            }
            if symbol.is_none() {
                calls.push((token, SEL_SYMBOL.to_vec()));
            }

            let results = self.rpc.try_aggregate(&calls).await?;
            let mut iter = results.into_iter();

            if decimals.is_none() {
                let raw = iter.next().flatten();
                let value = raw
                    .as_deref()
                    .map(parse_decimals)
                    .transpose()?
                    .unwrap_or(18);
                decimals = Some(value);
                let _ = self
                    .caches
                    .kv
                    .set_ex(
                        &keys::token_decimals(&token),
                        &value.to_string(),
                        KV_TOKEN_META_TTL_SECS,
                    )
                    .await;
            }
            if symbol.is_none() {
                let raw = iter.next().flatten();
                let value = raw
                    .as_deref()
                    .map(decoder::parse_symbol_data)
                    .unwrap_or_else(|| "???".to_string());
                let _ = self
                    .caches
                    .kv
                    .set_ex(&keys::token_symbol(&token), &value, KV_TOKEN_META_TTL_SECS)
                    .await;
                symbol = Some(value);
            }
        }

        let decimals = decimals.unwrap_or(18);
        let symbol = symbol.unwrap_or_else(|| "???".to_string());
        self.caches.token_decimals.insert(token, decimals);
        self.caches.token_symbols.insert(token, symbol.clone());
        Ok((decimals, symbol))
    }

    // -----------------------------------------------------------------------
    // Launchpad classification
    // -----------------------------------------------------------------------

    /// Classify a token: whitelist → blacklist → classifier API.
    ///
    /// The API outcome is persisted to the matching set for 7 days; the
    /// classification only fails if the KV sets are silent *and* the HTTP
    /// classifier is unreachable.
    pub async fn classify_launchpad(&self, token: Address) -> Result<LaunchpadClass, EngineError> {
        let member = token.to_string();

        match self.caches.kv.sismember(keys::FOURMEME_SET, &member).await {
            Ok(true) => {
                self.metrics.cache_hits.with_label_values(&["fourmeme"]).inc();
                return Ok(LaunchpadClass::Fourmeme);
            }
            Ok(false) => {}
            Err(e) => warn!(token = %token, error = %e, "fourmeme whitelist read failed"),
        }
        match self
            .caches
            .kv
            .sismember(keys::NON_FOURMEME_SET, &member)
            .await
        {
            Ok(true) => {
                self.metrics.cache_hits.with_label_values(&["fourmeme"]).inc();
                return Ok(LaunchpadClass::NotFourmeme);
            }
            Ok(false) => {}
            Err(e) => warn!(token = %token, error = %e, "fourmeme blacklist read failed"),
        }

        self.metrics
            .cache_misses
            .with_label_values(&["fourmeme"])
            .inc();

        let is_fourmeme = self
            .stats
            .is_fourmeme(token)
            .await
            .map_err(|_| EngineError::Resolve(token))?;

        let set = if is_fourmeme {
            keys::FOURMEME_SET
        } else {
            keys::NON_FOURMEME_SET
        };
        if let Err(e) = self
            .caches
            .kv
            .sadd_with_ttl(set, &member, KV_FOURMEME_TTL_SECS)
            .await
        {
            warn!(token = %token, error = %e, "failed to persist launchpad classification");
        }

        Ok(if is_fourmeme {
            LaunchpadClass::Fourmeme
        } else {
            LaunchpadClass::NotFourmeme
        })
    }
}

/// Parse a `decimals()` return word, rejecting malformed values.
fn parse_decimals(data: &[u8]) -> Result<u8, EngineError> {
    if data.len() < 32 {
        return Err(EngineError::Decode("decimals word too short".into()));
    }
    let value = U256::from_be_slice(&data[..32]);
    let decimals = value
        .try_into()
        .map_err(|_| EngineError::Decode(format!("decimals out of range: {value}")))?;
    if decimals > MAX_TOKEN_DECIMALS {
        return Err(EngineError::Decode(format!(
            "decimals out of range: {decimals}"
        )));
    }
    Ok(decimals)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decimals() {
        let mut word = vec![0u8; 32];
        word[31] = 18;
        assert_eq!(parse_decimals(&word).unwrap(), 18);

        word[31] = 0;
        assert_eq!(parse_decimals(&word).unwrap(), 0);
    }

    #[test]
    fn test_parse_decimals_rejects_out_of_range() {
        let mut word = vec![0u8; 32];
        word[31] = 37;
        assert!(parse_decimals(&word).is_err());

        // A value wider than u8.
        word[30] = 1;
        assert!(parse_decimals(&word).is_err());

        assert!(parse_decimals(&[0u8; 8]).is_err());
    }
}
