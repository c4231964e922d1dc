//! BSC on-chain swap monitor.
//!
//! Subscribes to PancakeSwap V2 `Swap` logs and fourmeme router/proxy logs
//! over a BSC WebSocket endpoint, admits events through a two-layer filter
//! (USD notional, then statistics-window rules), and dispatches alerts to a
//! notifier with per-token cooldown and transaction-level dedup.

pub mod cache;
pub mod config;
pub mod constants;
pub mod cooldown;
pub mod decoder;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod filter;
pub mod metadata;
pub mod metrics;
pub mod notifier;
pub mod price;
pub mod retry;
pub mod rpc;
pub mod stats;
pub mod store;
pub mod trigger;
pub mod types;
pub mod websocket;
pub mod window;
