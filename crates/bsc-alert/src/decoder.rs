//! Wire decoder for WebSocket frames and log payloads.
//!
//! Classifies incoming JSON frames (subscription acks vs. log notifications),
//! decodes PancakeSwap V2 `Swap` data words, and parses ERC-20 `Transfer`
//! logs and `symbol()` return data. Anything that is valid JSON but not a
//! frame we care about is dropped by the caller with a counter increment;
//! structurally broken payloads are a [`EngineError::Decode`].

use alloy::primitives::{Address, B256, U256};
use serde_json::Value;

use crate::constants::{self, TOPIC_ERC20_TRANSFER, TOPIC_V2_SWAP};
use crate::error::EngineError;
use crate::types::{LogEvent, SwapAmounts, TransferEvent};

// ---------------------------------------------------------------------------
// Frame classification
// ---------------------------------------------------------------------------

/// A classified WebSocket frame.
#[derive(Debug)]
pub enum WireFrame {
    /// Response to an `eth_subscribe` request: request id → subscription id.
    SubscriptionAck { id: u64, subscription: String },
    /// An `eth_subscription` log notification.
    LogNotification { subscription: String, log: LogEvent },
    /// Valid JSON-RPC traffic we do not route (pings, unknown methods).
    Ignored,
}

/// Classify a UTF-8 WebSocket frame.
pub fn classify_frame(text: &str) -> Result<WireFrame, EngineError> {
    let msg: Value = serde_json::from_str(text)
        .map_err(|e| EngineError::Decode(format!("frame is not JSON: {e}")))?;

    // Subscription ack: { "id": N, "result": "0x..." }.
    if let Some(id) = msg.get("id").and_then(Value::as_u64) {
        if let Some(sub) = msg.get("result").and_then(Value::as_str) {
            return Ok(WireFrame::SubscriptionAck {
                id,
                subscription: sub.to_string(),
            });
        }
        if let Some(err) = msg.get("error") {
            return Err(EngineError::Decode(format!(
                "subscription request {id} rejected: {err}"
            )));
        }
        return Ok(WireFrame::Ignored);
    }

    // Log notification: { "method": "eth_subscription", "params": { ... } }.
    if msg.get("method").and_then(Value::as_str) == Some("eth_subscription") {
        let params = msg
            .get("params")
            .ok_or_else(|| EngineError::Decode("eth_subscription without params".into()))?;
        let subscription = params
            .get("subscription")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Decode("eth_subscription without subscription id".into()))?
            .to_string();
        let result = params
            .get("result")
            .ok_or_else(|| EngineError::Decode("eth_subscription without result".into()))?;
        let log = log_from_json(result)?;
        return Ok(WireFrame::LogNotification { subscription, log });
    }

    Ok(WireFrame::Ignored)
}

// ---------------------------------------------------------------------------
// Log object parsing
// ---------------------------------------------------------------------------

/// Parse a JSON log object (from a subscription frame or a receipt).
pub fn log_from_json(obj: &Value) -> Result<LogEvent, EngineError> {
    let address = parse_address(require_str(obj, "address")?)?;

    let topics = obj
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| EngineError::Decode("log missing topics".into()))?
        .iter()
        .map(|t| {
            t.as_str()
                .ok_or_else(|| EngineError::Decode("topic is not a string".into()))
                .and_then(parse_b256)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let data = parse_hex_bytes(require_str(obj, "data")?)?;
    let block_number = parse_hex_u64(require_str(obj, "blockNumber")?)?;
    let tx_hash = parse_b256(require_str(obj, "transactionHash")?)?;
    let log_index = parse_hex_u64(require_str(obj, "logIndex")?)?;

    Ok(LogEvent {
        address,
        topics,
        data,
        block_number,
        tx_hash,
        log_index,
    })
}

fn require_str<'a>(obj: &'a Value, field: &str) -> Result<&'a str, EngineError> {
    obj.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Decode(format!("log missing field: {field}")))
}

// ---------------------------------------------------------------------------
// Event decoding
// ---------------------------------------------------------------------------

/// Which pipeline a log routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// PancakeSwap V2 `Swap` (external origin).
    ExternalSwap,
    /// Log emitted by a fourmeme router/proxy contract (internal origin).
    InternalProxy,
}

/// Route a log by topic0 and emitting address. `None` means not ours.
pub fn classify_log(log: &LogEvent) -> Option<EventKind> {
    if log.topic0() == Some(&TOPIC_V2_SWAP) {
        return Some(EventKind::ExternalSwap);
    }
    if constants::is_fourmeme_contract(&log.address) {
        return Some(EventKind::InternalProxy);
    }
    None
}

/// Decode the four amount words of a V2 `Swap` event data payload.
pub fn decode_swap_amounts(data: &[u8]) -> Result<SwapAmounts, EngineError> {
    if data.len() < 128 {
        return Err(EngineError::Decode(format!(
            "swap data too short: {} bytes, expected 128",
            data.len()
        )));
    }
    Ok(SwapAmounts {
        amount0_in: U256::from_be_slice(&data[0..32]),
        amount1_in: U256::from_be_slice(&data[32..64]),
        amount0_out: U256::from_be_slice(&data[64..96]),
        amount1_out: U256::from_be_slice(&data[96..128]),
    })
}

/// Decode an ERC-20 `Transfer` from a receipt log.
///
/// Returns `None` for logs that are not transfers (wrong topic0 or an
/// anonymous/short topic set); receipts are full of unrelated logs.
pub fn decode_transfer(log: &LogEvent) -> Option<TransferEvent> {
    if log.topic0() != Some(&TOPIC_ERC20_TRANSFER) || log.topics.len() < 3 {
        return None;
    }
    let from = Address::from_slice(&log.topics[1][12..]);
    let to = Address::from_slice(&log.topics[2][12..]);
    let value = if log.data.len() >= 32 {
        U256::from_be_slice(&log.data[..32])
    } else {
        U256::ZERO
    };
    Some(TransferEvent {
        token: log.address,
        from,
        to,
        value,
    })
}

/// Parse `symbol()` return data.
///
/// Handles both the standard dynamic-string encoding (offset + length +
/// bytes) and the nonstandard fixed 32-byte encoding some older tokens use.
pub fn parse_symbol_data(data: &[u8]) -> String {
    const FALLBACK: &str = "???";

    // Dynamic string: offset word, length word, then the bytes.
    if data.len() >= 64 {
        let len = U256::from_be_slice(&data[32..64]).saturating_to::<usize>();
        if len > 0 && len <= 64 && data.len() >= 64 + len {
            return String::from_utf8_lossy(&data[64..64 + len])
                .trim_end_matches('\0')
                .to_string();
        }
    }

    // Fixed bytes32: a single word of right-padded UTF-8.
    if data.len() == 32 {
        let trimmed: Vec<u8> = data.iter().copied().take_while(|b| *b != 0).collect();
        if !trimmed.is_empty() {
            if let Ok(s) = String::from_utf8(trimmed) {
                return s;
            }
        }
    }

    FALLBACK.to_string()
}

/// Extract an address from the last 20 bytes of a 32-byte return word.
pub fn address_from_word(data: &[u8]) -> Result<Address, EngineError> {
    if data.len() < 32 {
        return Err(EngineError::Decode(format!(
            "address word too short: {} bytes",
            data.len()
        )));
    }
    Ok(Address::from_slice(&data[12..32]))
}

// ---------------------------------------------------------------------------
// Hex helpers
// ---------------------------------------------------------------------------

pub fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, EngineError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(s).map_err(|e| EngineError::Decode(format!("invalid hex: {e}")))
}

pub fn parse_hex_u64(s: &str) -> Result<u64, EngineError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| EngineError::Decode(format!("invalid hex u64: {e}")))
}

pub fn parse_address(s: &str) -> Result<Address, EngineError> {
    s.parse::<Address>()
        .map_err(|e| EngineError::Decode(format!("invalid address {s}: {e}")))
}

pub fn parse_b256(s: &str) -> Result<B256, EngineError> {
    s.parse::<B256>()
        .map_err(|e| EngineError::Decode(format!("invalid 32-byte hex {s}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FOURMEME_PROXY;

    const TX: &str = "0x1111111111111111111111111111111111111111111111111111111111111111";

    fn log_json(address: &str, topic0: &str, data: &str) -> Value {
        serde_json::json!({
            "address": address,
            "topics": [topic0],
            "data": data,
            "blockNumber": "0x2a",
            "transactionHash": TX,
            "logIndex": "0x3",
        })
    }

    #[test]
    fn test_classify_subscription_ack() {
        let frame = r#"{"jsonrpc":"2.0","id":2,"result":"0xcd0c3e8af590364c09d0fa6a1210faf5"}"#;
        match classify_frame(frame).unwrap() {
            WireFrame::SubscriptionAck { id, subscription } => {
                assert_eq!(id, 2);
                assert_eq!(subscription, "0xcd0c3e8af590364c09d0fa6a1210faf5");
            }
            other => panic!("expected ack, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_log_notification() {
        let frame = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_subscription",
            "params": {
                "subscription": "0xabc",
                "result": log_json(
                    "0x5c952063c7fc8610ffdb798152d69f0b9550762b",
                    "0xd78ad95fa46c994b6551d0da85fc275fe613ce37657fb8d5e3d130840159d822",
                    "0x",
                ),
            },
        })
        .to_string();

        match classify_frame(&frame).unwrap() {
            WireFrame::LogNotification { subscription, log } => {
                assert_eq!(subscription, "0xabc");
                assert_eq!(log.block_number, 42);
                assert_eq!(log.log_index, 3);
                assert_eq!(log.address, FOURMEME_PROXY);
            }
            other => panic!("expected log, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_non_json_is_decode_error() {
        assert!(matches!(
            classify_frame("not json at all"),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn test_classify_unknown_method_ignored() {
        let frame = r#"{"jsonrpc":"2.0","method":"eth_somethingElse","params":{}}"#;
        assert!(matches!(classify_frame(frame).unwrap(), WireFrame::Ignored));
    }

    #[test]
    fn test_missing_field_is_decode_error() {
        let frame = serde_json::json!({
            "method": "eth_subscription",
            "params": {
                "subscription": "0xabc",
                "result": { "address": "0x5c952063c7fc8610ffdb798152d69f0b9550762b" },
            },
        })
        .to_string();
        assert!(matches!(
            classify_frame(&frame),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_swap_amounts() {
        // amount0In = 5, amount1In = 0, amount0Out = 0, amount1Out = 7.
        let mut data = vec![0u8; 128];
        data[31] = 5;
        data[127] = 7;
        let amounts = decode_swap_amounts(&data).unwrap();
        assert_eq!(amounts.amount0_in, U256::from(5));
        assert_eq!(amounts.amount1_in, U256::ZERO);
        assert_eq!(amounts.amount0_out, U256::ZERO);
        assert_eq!(amounts.amount1_out, U256::from(7));
    }

    #[test]
    fn test_decode_swap_amounts_short_data() {
        assert!(matches!(
            decode_swap_amounts(&[0u8; 96]),
            Err(EngineError::Decode(_))
        ));
    }

    #[test]
    fn test_decode_transfer() {
        let from = "0x000000000000000000000000aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
        let to = "0x000000000000000000000000bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
        let mut value = vec![0u8; 32];
        value[31] = 9;

        let log = LogEvent {
            address: FOURMEME_PROXY,
            topics: vec![
                TOPIC_ERC20_TRANSFER,
                from.parse().unwrap(),
                to.parse().unwrap(),
            ],
            data: value,
            block_number: 1,
            tx_hash: TX.parse().unwrap(),
            log_index: 0,
        };

        let transfer = decode_transfer(&log).unwrap();
        assert_eq!(
            transfer.from,
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
                .parse::<Address>()
                .unwrap()
        );
        assert_eq!(
            transfer.to,
            "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb"
                .parse::<Address>()
                .unwrap()
        );
        assert_eq!(transfer.value, U256::from(9));
    }

    #[test]
    fn test_decode_transfer_wrong_topic() {
        let log = LogEvent {
            address: FOURMEME_PROXY,
            topics: vec![TOPIC_V2_SWAP],
            data: vec![],
            block_number: 1,
            tx_hash: TX.parse().unwrap(),
            log_index: 0,
        };
        assert!(decode_transfer(&log).is_none());
    }

    #[test]
    fn test_parse_symbol_dynamic() {
        // offset (0x20), length (4), "CAKE" padded.
        let mut data = vec![0u8; 96];
        data[31] = 0x20;
        data[63] = 4;
        data[64..68].copy_from_slice(b"CAKE");
        assert_eq!(parse_symbol_data(&data), "CAKE");
    }

    #[test]
    fn test_parse_symbol_fixed_bytes32() {
        let mut data = vec![0u8; 32];
        data[..3].copy_from_slice(b"MKR");
        assert_eq!(parse_symbol_data(&data), "MKR");
    }

    #[test]
    fn test_parse_symbol_garbage() {
        assert_eq!(parse_symbol_data(&[]), "???");
        assert_eq!(parse_symbol_data(&[0u8; 32]), "???");
    }

    #[test]
    fn test_classify_log_routing() {
        let swap = LogEvent {
            address: Address::ZERO,
            topics: vec![TOPIC_V2_SWAP],
            data: vec![],
            block_number: 1,
            tx_hash: TX.parse().unwrap(),
            log_index: 0,
        };
        assert_eq!(classify_log(&swap), Some(EventKind::ExternalSwap));

        let proxy = LogEvent {
            address: FOURMEME_PROXY,
            topics: vec![TOPIC_ERC20_TRANSFER],
            data: vec![],
            block_number: 1,
            tx_hash: TX.parse().unwrap(),
            log_index: 1,
        };
        assert_eq!(classify_log(&proxy), Some(EventKind::InternalProxy));

        let other = LogEvent {
            address: Address::ZERO,
            topics: vec![TOPIC_ERC20_TRANSFER],
            data: vec![],
            block_number: 1,
            tx_hash: TX.parse().unwrap(),
            log_index: 2,
        };
        assert_eq!(classify_log(&other), None);
    }
}
