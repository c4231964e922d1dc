use alloy::primitives::{Address, B256};
use thiserror::Error;

/// Typed error hierarchy for the alert engine.
///
/// Component-internal errors use specific variants; application code wraps
/// with `anyhow::Context` for propagation. `FilterReject` and `CooldownHeld`
/// are ordinary control-flow outcomes, not errors, and have no variant here.
#[derive(Error, Debug)]
pub enum EngineError {
    // -- Wire ---------------------------------------------------------------
    #[error("malformed frame: {0}")]
    Decode(String),

    // -- Upstream -----------------------------------------------------------
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("receipt not found for {0} (transaction pending)")]
    ReceiptNotFound(B256),

    #[error("metadata unresolvable for {0}")]
    Resolve(Address),

    // -- Delivery -----------------------------------------------------------
    #[error("alert delivery failed: {0}")]
    Dispatch(String),

    // -- Configuration ------------------------------------------------------
    #[error("invalid configuration: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kv(#[from] redis::RedisError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Whether the RPC/HTTP layer may retry the failed call.
    ///
    /// `ReceiptNotFound` is never retryable: the receipt is absent because
    /// the transaction is still pending, not because the call failed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}
