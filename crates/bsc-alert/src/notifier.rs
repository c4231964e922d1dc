//! Alert payload rendering and delivery to the notifier endpoint.
//!
//! The notifier is an external send-message RPC: `POST {base}/send` with
//! `{chat_id, text, buttons[]}`, 2xx means accepted. Rendering follows the
//! channel's established message layout (HTML markup, copyable contract
//! address, deep links to trackers).

use alloy::primitives::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::constants::USDT;
use crate::error::EngineError;
use crate::types::AlertPayload;

pub struct Notifier {
    base_url: String,
    chat_id: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    chat_id: &'a str,
    text: String,
    buttons: Vec<Button>,
}

#[derive(Debug, Serialize)]
pub struct Button {
    pub label: String,
    pub url: String,
}

impl Notifier {
    pub fn new(base_url: String, chat_id: String) -> Self {
        Self { base_url, chat_id }
    }

    /// Deliver one alert. Non-2xx responses are a `DispatchError`.
    pub async fn send(
        &self,
        client: &reqwest::Client,
        payload: &AlertPayload,
    ) -> Result<(), EngineError> {
        let request = SendRequest {
            chat_id: &self.chat_id,
            text: build_message(payload),
            buttons: build_buttons(&payload.token),
        };

        let resp = client
            .post(format!("{}/send", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch(format!("notifier unreachable: {e}")))?;

        if !resp.status().is_success() {
            return Err(EngineError::Dispatch(format!(
                "notifier returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn build_message(payload: &AlertPayload) -> String {
    let origin_label = match payload.origin.as_str() {
        "internal" => "launchpad",
        _ => "DEX",
    };
    let price_str = if payload.price_usd >= dec!(0.01) {
        format!("${:.5}", payload.price_usd)
    } else {
        format!("${:.10}", payload.price_usd)
    };

    let mut lines = vec![
        "<b>BSC signal</b>".to_string(),
        String::new(),
        format!("Token: {}", payload.symbol),
        format!("Contract: <code>{}</code>", payload.token),
        String::new(),
        format!("Price: {price_str}"),
        format!("Market cap: ${}", format_number(payload.market_cap_usd)),
        format!("Venue: {origin_label}"),
        String::new(),
        format!(
            "Buy: {} {} (~${:.2})",
            format_amount(payload.quote_amount),
            payload.quote_symbol,
            payload.usd_value
        ),
        format!(
            "Received: {} {}",
            format_amount(payload.base_amount),
            payload.symbol
        ),
        String::new(),
        "<b>Triggered</b>".to_string(),
    ];

    if payload.reasons.is_empty() {
        lines.push(format!("- large trade ${:.2}", payload.usd_value));
    } else {
        for reason in &payload.reasons {
            lines.push(format!("- {}", reason.description));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "Time: {}",
        payload.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));

    lines.join("\n")
}

pub fn build_buttons(token: &Address) -> Vec<Button> {
    vec![
        Button {
            label: "GMGN".to_string(),
            url: format!("https://gmgn.ai/bsc/token/{token}"),
        },
        Button {
            label: "OKX".to_string(),
            url: format!(
                "https://www.okx.com/web3/dex-swap#inputChain=56&inputCurrency={token}&outputChain=56&outputCurrency={USDT}"
            ),
        },
    ]
}

/// Compact K/M/B formatting for volumes and market caps.
pub fn format_number(value: Decimal) -> String {
    if value >= dec!(1000000000) {
        format!("{:.2}B", value / dec!(1000000000))
    } else if value >= dec!(1000000) {
        format!("{:.2}M", value / dec!(1000000))
    } else if value >= dec!(1000) {
        format!("{:.2}K", value / dec!(1000))
    } else {
        format!("{value:.2}")
    }
}

/// Human formatting for token amounts: grouped above 1 000, more precision
/// the smaller the value.
pub fn format_amount(value: Decimal) -> String {
    if value >= dec!(1000) {
        group_thousands(&format!("{value:.2}"))
    } else if value >= Decimal::ONE {
        format!("{value:.4}")
    } else {
        format!("{value:.8}")
    }
}

fn group_thousands(formatted: &str) -> String {
    let (int_part, frac_part) = match formatted.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (formatted, None),
    };

    let mut grouped = String::new();
    let digits: Vec<char> = int_part.chars().collect();
    for (i, c) in digits.iter().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(*c);
    }

    match frac_part {
        Some(f) => format!("{grouped}.{f}"),
        None => grouped,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TriggeredRule;
    use chrono::Utc;

    fn payload() -> AlertPayload {
        AlertPayload {
            token: "0x1111111111111111111111111111111111111111".parse().unwrap(),
            pair: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            tx_hash: alloy::primitives::B256::repeat_byte(3),
            symbol: "PEPE".into(),
            origin: "external".into(),
            usd_value: dec!(600),
            quote_symbol: "WBNB".into(),
            quote_amount: dec!(0.6),
            base_amount: dec!(123456.78),
            price_usd: dec!(0.0021),
            market_cap_usd: dec!(1500000),
            reasons: vec![TriggeredRule {
                description: "1m price rise +22.00% (>= 20%)".into(),
                value: dec!(22),
                threshold: dec!(20),
            }],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(dec!(950)), "950.00");
        assert_eq!(format_number(dec!(1500)), "1.50K");
        assert_eq!(format_number(dec!(2500000)), "2.50M");
        assert_eq!(format_number(dec!(3100000000)), "3.10B");
    }

    #[test]
    fn test_format_amount() {
        assert_eq!(format_amount(dec!(1234567.891)), "1,234,567.89");
        assert_eq!(format_amount(dec!(12.34567)), "12.3457");
        assert_eq!(format_amount(dec!(0.000012345)), "0.00001234");
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands("1234567.89"), "1,234,567.89");
        assert_eq!(group_thousands("999"), "999");
        assert_eq!(group_thousands("1000"), "1,000");
    }

    #[test]
    fn test_message_contents() {
        let text = build_message(&payload());
        assert!(text.contains("PEPE"));
        assert!(text.contains("$600.00"));
        assert!(text.contains("1m price rise"));
        assert!(text.contains("1.50M"));
        assert!(text.contains("<code>0x1111111111111111111111111111111111111111</code>"));
    }

    #[test]
    fn test_message_without_reasons_names_the_trade() {
        let mut p = payload();
        p.reasons.clear();
        let text = build_message(&p);
        assert!(text.contains("large trade $600.00"));
    }

    #[test]
    fn test_buttons_link_to_token() {
        let buttons = build_buttons(&payload().token);
        assert_eq!(buttons.len(), 2);
        assert!(buttons[0].url.contains("gmgn.ai/bsc/token/0x1111"));
        assert!(buttons[1].url.contains("okx.com"));
    }
}
