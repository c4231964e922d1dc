//! Core types for the BSC alert engine.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::constants;

// ---------------------------------------------------------------------------
// Wire-level log event
// ---------------------------------------------------------------------------

/// A single EVM log, either from an `eth_subscription` frame or a receipt.
#[derive(Debug, Clone)]
pub struct LogEvent {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl LogEvent {
    pub fn topic0(&self) -> Option<&B256> {
        self.topics.first()
    }
}

// ---------------------------------------------------------------------------
// Decoded swap
// ---------------------------------------------------------------------------

/// Raw amounts from a PancakeSwap V2 `Swap` event data payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapAmounts {
    pub amount0_in: U256,
    pub amount1_in: U256,
    pub amount0_out: U256,
    pub amount1_out: U256,
}

/// A fully decoded external swap event.
#[derive(Debug, Clone)]
pub struct SwapEvent {
    pub tx_hash: B256,
    pub log_index: u64,
    pub pair: Address,
    pub amounts: SwapAmounts,
    pub block_number: u64,
    pub timestamp: i64,
}

/// An ERC-20 transfer parsed out of a receipt log.
#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub value: U256,
}

/// Where a trade was routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// Through the fourmeme router/proxy contracts.
    Internal,
    /// Directly through a PancakeSwap V2 pair.
    External,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Internal => "internal",
            EventOrigin::External => "external",
        }
    }
}

// ---------------------------------------------------------------------------
// Pair metadata
// ---------------------------------------------------------------------------

/// Resolved pair metadata. Only ever published fully populated.
#[derive(Debug, Clone)]
pub struct PairMeta {
    pub pair: Address,
    pub token0: Address,
    pub token1: Address,
    pub decimals0: u8,
    pub decimals1: u8,
    pub symbol0: String,
    pub symbol1: String,
    pub resolved_at: i64,
}

impl PairMeta {
    /// Which side of the pair is the quote asset, if exactly one is.
    ///
    /// Pairs where both or neither side is a quote asset are not monitorable.
    pub fn quote_side(&self) -> Option<QuoteSide> {
        let q0 = constants::is_quote_asset(&self.token0);
        let q1 = constants::is_quote_asset(&self.token1);
        match (q0, q1) {
            (true, false) => Some(QuoteSide::Token0),
            (false, true) => Some(QuoteSide::Token1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteSide {
    Token0,
    Token1,
}

/// Launchpad classification for a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchpadClass {
    Unknown,
    Fourmeme,
    NotFourmeme,
}

// ---------------------------------------------------------------------------
// Receipts
// ---------------------------------------------------------------------------

/// A transaction receipt, kept only as long as the dedup horizon needs it.
#[derive(Debug, Clone)]
pub struct ReceiptRecord {
    pub tx_hash: B256,
    pub status: bool,
    pub gas_used: u64,
    pub logs: Vec<LogEvent>,
}

// ---------------------------------------------------------------------------
// Token statistics (Layer-2)
// ---------------------------------------------------------------------------

/// Statistics window requested from the external token statistics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatWindow {
    OneMinute,
    FiveMinutes,
    OneHour,
}

impl StatWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatWindow::OneMinute => "1m",
            StatWindow::FiveMinutes => "5m",
            StatWindow::OneHour => "1h",
        }
    }

    /// The next wider window in the fallback table, if any.
    pub fn wider(&self) -> Option<StatWindow> {
        match self {
            StatWindow::OneMinute => Some(StatWindow::FiveMinutes),
            StatWindow::FiveMinutes => Some(StatWindow::OneHour),
            StatWindow::OneHour => None,
        }
    }

    pub fn parse(s: &str) -> Option<StatWindow> {
        match s {
            "1m" => Some(StatWindow::OneMinute),
            "5m" => Some(StatWindow::FiveMinutes),
            "1h" => Some(StatWindow::OneHour),
            _ => None,
        }
    }
}

/// Data completeness reported by the statistics API for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    Complete,
    Partial,
    Empty,
}

impl Completeness {
    pub fn parse(s: &str) -> Completeness {
        match s {
            "complete" => Completeness::Complete,
            "partial" => Completeness::Partial,
            _ => Completeness::Empty,
        }
    }
}

/// Per-window token statistics used by the Layer-2 filter.
#[derive(Debug, Clone)]
pub struct PriceStat {
    pub token: Address,
    pub window: StatWindow,
    pub symbol: String,
    pub price_usd: Decimal,
    pub price_change_pct: Decimal,
    pub volume_usd: Decimal,
    pub tx_count: u32,
    pub top10_pct: Decimal,
    pub market_cap_usd: Decimal,
    pub completeness: Completeness,
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// A rule that fired during Layer-2 evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredRule {
    pub description: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub value: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub threshold: Decimal,
}

/// Everything the notifier needs to render and deliver one alert.
///
/// Serializable because failed alerts are parked in the retry queue as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub token: Address,
    pub pair: Address,
    pub tx_hash: B256,
    pub symbol: String,
    pub origin: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub usd_value: Decimal,
    pub quote_symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub quote_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub base_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_usd: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub market_cap_usd: Decimal,
    pub reasons: Vec<TriggeredRule>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{USDT, WBNB};
    use alloy::primitives::address;

    fn meta(token0: Address, token1: Address) -> PairMeta {
        PairMeta {
            pair: Address::ZERO,
            token0,
            token1,
            decimals0: 18,
            decimals1: 18,
            symbol0: "A".into(),
            symbol1: "B".into(),
            resolved_at: 0,
        }
    }

    #[test]
    fn test_quote_side_detection() {
        let target = address!("1111111111111111111111111111111111111111");
        assert_eq!(meta(USDT, target).quote_side(), Some(QuoteSide::Token0));
        assert_eq!(meta(target, WBNB).quote_side(), Some(QuoteSide::Token1));
        // Both sides quote assets: not monitorable.
        assert_eq!(meta(USDT, WBNB).quote_side(), None);
        // Neither side a quote asset: not monitorable.
        let other = address!("2222222222222222222222222222222222222222");
        assert_eq!(meta(target, other).quote_side(), None);
    }

    #[test]
    fn test_fallback_table() {
        assert_eq!(StatWindow::OneMinute.wider(), Some(StatWindow::FiveMinutes));
        assert_eq!(StatWindow::FiveMinutes.wider(), Some(StatWindow::OneHour));
        assert_eq!(StatWindow::OneHour.wider(), None);
    }

    #[test]
    fn test_window_parse_roundtrip() {
        for w in [
            StatWindow::OneMinute,
            StatWindow::FiveMinutes,
            StatWindow::OneHour,
        ] {
            assert_eq!(StatWindow::parse(w.as_str()), Some(w));
        }
        assert_eq!(StatWindow::parse("2h"), None);
    }

    #[test]
    fn test_completeness_parse_defaults_to_empty() {
        assert_eq!(Completeness::parse("complete"), Completeness::Complete);
        assert_eq!(Completeness::parse("partial"), Completeness::Partial);
        assert_eq!(Completeness::parse("empty"), Completeness::Empty);
        assert_eq!(Completeness::parse("garbage"), Completeness::Empty);
    }
}
