//! Per-event processing pipeline.
//!
//! Runs inside a dispatch worker: dedup → metadata → Layer-1 → Layer-2 →
//! cooldown claim → delivery. Every failure after a successful claim
//! releases the cooldown before the worker takes its next job.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, warn};

use crate::cache::CacheManager;
use crate::config::{ConfigHandle, MonitorConfig};
use crate::constants::{self, USDT, WBNB};
use crate::cooldown::{CooldownControl, SeenTxSet};
use crate::decoder::{self, EventKind};
use crate::error::EngineError;
use crate::filter::{self, FilterEngine, Layer1Verdict, Layer2Verdict};
use crate::metadata::MetadataResolver;
use crate::metrics::EngineMetrics;
use crate::notifier::Notifier;
use crate::retry::RetryQueue;
use crate::rpc::RpcClient;
use crate::store::AlertStore;
use crate::types::{
    AlertPayload, EventOrigin, LaunchpadClass, LogEvent, PriceStat, ReceiptRecord, TransferEvent,
    TriggeredRule,
};

pub struct Engine {
    config: ConfigHandle,
    caches: Arc<CacheManager>,
    rpc: Arc<RpcClient>,
    resolver: Arc<MetadataResolver>,
    filter: Arc<FilterEngine>,
    cooldown: CooldownControl,
    seen: SeenTxSet,
    notifier: Arc<Notifier>,
    retry: RetryQueue,
    store: Arc<AlertStore>,
    metrics: Arc<EngineMetrics>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigHandle,
        caches: Arc<CacheManager>,
        rpc: Arc<RpcClient>,
        resolver: Arc<MetadataResolver>,
        filter: Arc<FilterEngine>,
        cooldown: CooldownControl,
        notifier: Arc<Notifier>,
        retry: RetryQueue,
        store: Arc<AlertStore>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            config,
            caches,
            rpc,
            resolver,
            filter,
            cooldown,
            seen: SeenTxSet::new(),
            notifier,
            retry,
            store,
            metrics,
        }
    }

    pub fn filter(&self) -> &FilterEngine {
        &self.filter
    }

    pub fn caches(&self) -> &CacheManager {
        &self.caches
    }

    /// Process one routed log. All errors are handled here; nothing crosses
    /// the worker boundary uncaught.
    pub async fn process_log(&self, log: LogEvent, http: &reqwest::Client) {
        let started = Instant::now();

        let kind = match decoder::classify_log(&log) {
            Some(kind) => kind,
            None => {
                self.metrics.frames_dropped.inc();
                return;
            }
        };

        if !self.seen.insert(log.tx_hash, log.log_index) {
            self.metrics.deduplicated.inc();
            return;
        }

        let config = self.config.snapshot();
        let result = match kind {
            EventKind::ExternalSwap => self.process_external(&log, &config, http).await,
            EventKind::InternalProxy => self.process_internal(&log, &config, http).await,
        };

        if let Err(e) = result {
            match &e {
                EngineError::ReceiptNotFound(_) => self.metrics.receipts_not_found.inc(),
                EngineError::Resolve(_) => self.metrics.resolve_failures.inc(),
                EngineError::Decode(_) => self.metrics.decode_errors.inc(),
                _ => warn!(tx = %log.tx_hash, error = %e, "event processing failed"),
            }
            debug!(tx = %log.tx_hash, error = %e, "event dropped");
        }

        self.metrics
            .processing_seconds
            .observe(started.elapsed().as_secs_f64());
    }

    // -----------------------------------------------------------------------
    // External path (PancakeSwap V2 Swap)
    // -----------------------------------------------------------------------

    async fn process_external(
        &self,
        log: &LogEvent,
        config: &MonitorConfig,
        http: &reqwest::Client,
    ) -> Result<(), EngineError> {
        let amounts = decoder::decode_swap_amounts(&log.data)?;
        let meta = self.resolver.resolve_pair(log.address).await?;

        let Some(oriented) = filter::orient_swap(&meta, &amounts) else {
            // Sell, quote/quote pair, or no quote side: not monitorable.
            return Ok(());
        };

        let quote_units = filter::normalize_units(oriented.quote_amount, oriented.quote_decimals);
        let Some(usd) = filter::usd_value(
            &oriented.quote_token,
            quote_units,
            self.filter.price_cache(),
        ) else {
            self.metrics.resolve_failures.inc();
            return Ok(());
        };

        if self.filter.layer1(
            EventOrigin::External,
            oriented.base_token,
            usd,
            config,
        ) == Layer1Verdict::Reject
        {
            return Ok(());
        }

        // External events must come from the launchpad ecosystem.
        match self.resolver.classify_launchpad(oriented.base_token).await? {
            LaunchpadClass::Fourmeme => {}
            _ => {
                debug!(token = %oriented.base_token, "external token not fourmeme, skipping");
                return Ok(());
            }
        }

        let verdict = self
            .filter
            .layer2(oriented.base_token, log.address, EventOrigin::External, config)
            .await?;
        let Layer2Verdict::Triggered { rules, stat } = verdict else {
            return Ok(());
        };

        let payload = build_payload(
            oriented.base_token,
            log.address,
            log.tx_hash,
            EventOrigin::External,
            usd,
            &oriented.quote_symbol,
            quote_units,
            filter::normalize_units(oriented.base_amount, oriented.base_decimals),
            &oriented.base_symbol,
            &stat,
            rules,
        );
        self.finish_alert(payload, config, http).await
    }

    // -----------------------------------------------------------------------
    // Internal path (fourmeme router/proxy)
    // -----------------------------------------------------------------------

    async fn process_internal(
        &self,
        log: &LogEvent,
        config: &MonitorConfig,
        http: &reqwest::Client,
    ) -> Result<(), EngineError> {
        let receipt = self.receipt(log.tx_hash).await?;

        let transfers: Vec<TransferEvent> = receipt
            .logs
            .iter()
            .filter_map(decoder::decode_transfer)
            .collect();
        if transfers.is_empty() {
            return Ok(());
        }

        // What was paid in: USDT or WBNB into the proxy, else raw BNB value.
        let usdt_in = quote_inflow(&transfers, &USDT);
        let wbnb_in = quote_inflow(&transfers, &WBNB);
        let (quote_token, quote_amount, quote_symbol) = if usdt_in > U256::ZERO {
            (USDT, usdt_in, "USDT")
        } else if wbnb_in > U256::ZERO {
            (WBNB, wbnb_in, "WBNB")
        } else {
            let value = self.rpc.transaction_value(log.tx_hash).await?;
            if value.is_zero() {
                return Ok(());
            }
            (WBNB, value, "BNB")
        };

        // What was bought: the largest non-quote outflow from the proxy.
        let Some((target_token, target_amount)) = largest_target_outflow(&transfers) else {
            return Ok(());
        };

        let (target_decimals, target_symbol) = self.resolver.token_meta(target_token).await?;

        // Quote assets are all 18 decimals on BSC.
        let quote_units = filter::normalize_units(quote_amount, 18);
        let Some(usd) = filter::usd_value(&quote_token, quote_units, self.filter.price_cache())
        else {
            self.metrics.resolve_failures.inc();
            return Ok(());
        };

        if self.filter.layer1(EventOrigin::Internal, target_token, usd, config)
            == Layer1Verdict::Reject
        {
            return Ok(());
        }

        // Internal events are launchpad trades by construction; the stats
        // API resolves the canonical pair from the token address.
        let verdict = self
            .filter
            .layer2(target_token, target_token, EventOrigin::Internal, config)
            .await?;
        let Layer2Verdict::Triggered { rules, stat } = verdict else {
            return Ok(());
        };

        let payload = build_payload(
            target_token,
            log.address,
            log.tx_hash,
            EventOrigin::Internal,
            usd,
            quote_symbol,
            quote_units,
            filter::normalize_units(target_amount, target_decimals),
            &target_symbol,
            &stat,
            rules,
        );
        self.finish_alert(payload, config, http).await
    }

    // -----------------------------------------------------------------------
    // Receipt cache
    // -----------------------------------------------------------------------

    async fn receipt(&self, tx_hash: B256) -> Result<Arc<ReceiptRecord>, EngineError> {
        if let Some(receipt) = self.caches.receipts.get(&tx_hash) {
            self.metrics.cache_hits.with_label_values(&["receipt"]).inc();
            return Ok(receipt);
        }
        self.metrics
            .cache_misses
            .with_label_values(&["receipt"])
            .inc();

        let flight_key = format!("receipt:{tx_hash}");
        let _guard = self.caches.lock_key(&flight_key).await;

        if let Some(receipt) = self.caches.receipts.get(&tx_hash) {
            self.caches.release_key(&flight_key);
            return Ok(receipt);
        }

        let result = self.rpc.get_receipt(tx_hash).await;
        self.caches.release_key(&flight_key);

        match result? {
            Some(receipt) => {
                let receipt = Arc::new(receipt);
                self.caches.receipts.insert(tx_hash, receipt.clone());
                Ok(receipt)
            }
            // Pending transactions are never cached: the next event for the
            // same hash gets a fresh look.
            None => Err(EngineError::ReceiptNotFound(tx_hash)),
        }
    }

    // -----------------------------------------------------------------------
    // Claim, deliver, release-on-failure
    // -----------------------------------------------------------------------

    async fn finish_alert(
        &self,
        payload: AlertPayload,
        config: &MonitorConfig,
        http: &reqwest::Client,
    ) -> Result<(), EngineError> {
        let claimed = self
            .cooldown
            .claim(
                &payload.token,
                config.cooldown_seconds,
                config.jitter_seconds,
            )
            .await?;
        if !claimed {
            self.metrics.cooldown_held.inc();
            debug!(token = %payload.token, "cooldown held, skipping alert");
            return Ok(());
        }

        match self.notifier.send(http, &payload).await {
            Ok(()) => {
                self.metrics.alerts.with_label_values(&["success"]).inc();
                if let Err(e) = self.store.record_alert(&payload, "live", "sent").await {
                    warn!(error = %e, "failed to record delivered alert");
                }
                Ok(())
            }
            Err(e) => {
                self.metrics.alerts.with_label_values(&["failure"]).inc();
                // Release before parking: a later admissible event must not
                // be suppressed by a cooldown that never produced an alert.
                if let Err(release_err) = self.cooldown.release(&payload.token).await {
                    error!(token = %payload.token, error = %release_err, "cooldown release failed");
                }
                if let Err(enqueue_err) = self.retry.enqueue(&payload, &e.to_string()).await {
                    error!(token = %payload.token, error = %enqueue_err, "failed to park alert for retry");
                }
                if let Err(db_err) = self.store.record_alert(&payload, "live", "failed").await {
                    warn!(error = %db_err, "failed to record failed alert");
                }
                warn!(token = %payload.token, error = %e, "alert delivery failed, cooldown released");
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pure helpers
// ---------------------------------------------------------------------------

/// Sum of `token` transferred into the fourmeme contracts.
fn quote_inflow(transfers: &[TransferEvent], token: &Address) -> U256 {
    transfers
        .iter()
        .filter(|t| t.token == *token && constants::is_fourmeme_contract(&t.to))
        .fold(U256::ZERO, |acc, t| acc.saturating_add(t.value))
}

/// The non-quote token with the largest outflow from the fourmeme contracts.
fn largest_target_outflow(transfers: &[TransferEvent]) -> Option<(Address, U256)> {
    let mut outflows: HashMap<Address, U256> = HashMap::new();
    for t in transfers {
        if constants::is_fourmeme_contract(&t.from) && !constants::is_quote_asset(&t.token) {
            let entry = outflows.entry(t.token).or_insert(U256::ZERO);
            *entry = entry.saturating_add(t.value);
        }
    }
    outflows.into_iter().max_by_key(|(_, amount)| *amount)
}

#[allow(clippy::too_many_arguments)]
fn build_payload(
    token: Address,
    pair: Address,
    tx_hash: B256,
    origin: EventOrigin,
    usd_value: Decimal,
    quote_symbol: &str,
    quote_amount: Decimal,
    base_amount: Decimal,
    base_symbol: &str,
    stat: &PriceStat,
    reasons: Vec<TriggeredRule>,
) -> AlertPayload {
    let symbol = if stat.symbol == "Unknown" {
        base_symbol.to_string()
    } else {
        stat.symbol.clone()
    };
    AlertPayload {
        token,
        pair,
        tx_hash,
        symbol,
        origin: origin.as_str().to_string(),
        usd_value,
        quote_symbol: quote_symbol.to_string(),
        quote_amount,
        base_amount,
        price_usd: stat.price_usd,
        market_cap_usd: stat.market_cap_usd,
        reasons,
        created_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
