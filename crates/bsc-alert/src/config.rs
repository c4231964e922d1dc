//! Configuration: environment variables plus KV-store thresholds.
//!
//! Endpoints, ports, and pool sizes come from the environment with defaults.
//! Filter thresholds and rule templates live in the KV store (written by the
//! operator-facing config service) and are loaded at startup and again on
//! SIGHUP. The active threshold set is an immutable snapshot behind an
//! `Arc`: each event clones the `Arc` once and sees a consistent config.

use std::str::FromStr;
use std::sync::{Arc, RwLock};

use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::{info, warn};

use crate::cache::{keys, KvStore};
use crate::error::EngineError;
use crate::trigger::{to_decimal, RuleSet, RuleTemplate, TriggerMode, TriggerRule};
use crate::types::StatWindow;

// ---------------------------------------------------------------------------
// Environment config
// ---------------------------------------------------------------------------

/// Process-level configuration from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// BSC WebSocket endpoint for log subscriptions.
    pub ws_url: String,
    /// BSC HTTP JSON-RPC endpoint.
    pub rpc_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// SQLite path for the alert sink.
    pub db_path: String,
    /// Token statistics API base URL.
    pub stats_api_url: String,
    /// Launchpad classifier API base URL.
    pub launchpad_api_url: String,
    /// Spot price API base URL.
    pub spot_api_url: String,
    /// Optional API key for the statistics API.
    pub stats_api_key: Option<String>,
    /// Notifier endpoint base URL (`POST {base}/send`).
    pub notifier_url: String,
    /// Notification channel id.
    pub notifier_chat_id: String,
    /// Dispatch worker pool size.
    pub worker_count: usize,
    /// Prometheus exposition port.
    pub metrics_port: u16,
    /// Cumulative Layer-1 window length in seconds.
    pub cumulative_window_seconds: u64,
    /// Permit the hard $600 WBNB default when no live quote exists.
    pub allow_default_wbnb_price: bool,
    /// `json` or `text` stderr log format.
    pub log_format: String,
    /// Directory for rolling file logs.
    pub log_dir: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        let config = Self {
            ws_url: env_string("BSC_WS_URL")
                .unwrap_or_else(|| "wss://bsc-ws-node.nariox.org:443".to_string()),
            rpc_url: env_string("BSC_RPC_URL")
                .unwrap_or_else(|| "https://bsc-dataseed1.binance.org".to_string()),
            redis_url: env_string("REDIS_URL")
                .unwrap_or_else(|| "redis://localhost:6379".to_string()),
            db_path: env_string("ALERT_DB_PATH").unwrap_or_else(|| "data/alerts.db".to_string()),
            stats_api_url: env_string("STATS_API_URL")
                .unwrap_or_else(|| "https://api-data-v1.dbotx.com".to_string()),
            launchpad_api_url: env_string("LAUNCHPAD_API_URL")
                .unwrap_or_else(|| "https://api-data-v1.dbotx.com".to_string()),
            spot_api_url: env_string("SPOT_API_URL")
                .unwrap_or_else(|| "https://api.gateio.ws/api/v4".to_string()),
            stats_api_key: env_string("STATS_API_KEY"),
            notifier_url: env_string("NOTIFIER_URL")
                .unwrap_or_else(|| "http://localhost:9100".to_string()),
            notifier_chat_id: env_string("NOTIFIER_CHAT_ID").unwrap_or_default(),
            worker_count: env_parse("WORKER_COUNT").unwrap_or(20),
            metrics_port: env_parse("METRICS_PORT").unwrap_or(8001),
            cumulative_window_seconds: env_parse("CUMULATIVE_WINDOW_SECONDS").unwrap_or(300),
            allow_default_wbnb_price: env_bool("ALLOW_DEFAULT_WBNB_PRICE").unwrap_or(false),
            log_format: env_string("LOG_FORMAT").unwrap_or_else(|| "text".to_string()),
            log_dir: env_string("LOG_DIR").unwrap_or_else(|| "logs".to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), EngineError> {
        let mut errors: Vec<String> = Vec::new();

        if !self.ws_url.starts_with("ws://") && !self.ws_url.starts_with("wss://") {
            errors.push(format!("BSC_WS_URL is not a WebSocket URL: {}", self.ws_url));
        }
        if !self.rpc_url.starts_with("http://") && !self.rpc_url.starts_with("https://") {
            errors.push(format!("BSC_RPC_URL is not an HTTP URL: {}", self.rpc_url));
        }
        if self.worker_count == 0 {
            errors.push("WORKER_COUNT must be at least 1".into());
        }
        if self.cumulative_window_seconds == 0 {
            errors.push("CUMULATIVE_WINDOW_SECONDS must be at least 1".into());
        }
        if self.notifier_chat_id.is_empty() {
            errors.push("NOTIFIER_CHAT_ID is required".into());
        }
        if self.log_format != "json" && self.log_format != "text" {
            errors.push(format!(
                "LOG_FORMAT must be json or text, got {}",
                self.log_format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Config(format!(
                "{} error{}: {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("; ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Monitor thresholds (KV-loaded snapshot)
// ---------------------------------------------------------------------------

/// Filter thresholds and rule templates. Immutable once installed.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub min_usd_internal: Decimal,
    pub min_usd_external: Decimal,
    pub cumulative_min_usd_internal: Decimal,
    pub cumulative_min_usd_external: Decimal,
    pub cooldown_seconds: u64,
    pub jitter_seconds: u64,
    pub internal_rules: RuleSet,
    pub external_rules: RuleSet,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            min_usd_internal: dec!(200),
            min_usd_external: dec!(400),
            cumulative_min_usd_internal: dec!(500),
            cumulative_min_usd_external: dec!(1000),
            cooldown_seconds: 180,
            jitter_seconds: 30,
            internal_rules: RuleSet {
                mode: TriggerMode::Any,
                rules: vec![
                    TriggerRule::PriceRise {
                        window: StatWindow::OneMinute,
                        min_pct: dec!(30),
                    },
                    TriggerRule::Volume {
                        window: StatWindow::OneMinute,
                        min_usd: dec!(5000),
                    },
                ],
            },
            external_rules: RuleSet {
                mode: TriggerMode::Any,
                rules: vec![
                    TriggerRule::PriceRise {
                        window: StatWindow::OneMinute,
                        min_pct: dec!(50),
                    },
                    TriggerRule::Volume {
                        window: StatWindow::OneMinute,
                        min_usd: dec!(20000),
                    },
                ],
            },
        }
    }
}

/// Wire shape of `bsc:monitor:config:thresholds`.
#[derive(Debug, Deserialize, Default)]
struct ThresholdsDoc {
    #[serde(default)]
    min_usd_internal: Option<f64>,
    #[serde(default)]
    min_usd_external: Option<f64>,
    #[serde(default)]
    cumulative_min_usd_internal: Option<f64>,
    #[serde(default)]
    cumulative_min_usd_external: Option<f64>,
    #[serde(default)]
    cooldown_seconds: Option<u64>,
    #[serde(default)]
    jitter_seconds: Option<u64>,
    #[serde(default)]
    internal_rules: Option<RuleTemplate>,
    #[serde(default)]
    external_rules: Option<RuleTemplate>,
}

/// Strip the type markers the upstream Java config service leaves in the
/// JSON (`"@type": "..."` members and `L`-suffixed integer literals).
pub fn sanitize_thresholds_json(raw: &str) -> String {
    let type_marker = Regex::new(r#""@type"\s*:\s*"[^"]*"\s*,?"#).expect("valid regex");
    let long_suffix = Regex::new(r":\s*(\d+)L\b").expect("valid regex");
    let trailing_comma = Regex::new(r",\s*\}").expect("valid regex");

    let cleaned = type_marker.replace_all(raw, "");
    let cleaned = long_suffix.replace_all(&cleaned, ":$1");
    trailing_comma.replace_all(&cleaned, "}").into_owned()
}

/// Load thresholds from the KV store, falling back to defaults per field.
pub async fn load_monitor_config(kv: &KvStore) -> Result<MonitorConfig, EngineError> {
    let mut config = MonitorConfig::default();

    match kv.get(keys::THRESHOLDS).await? {
        Some(raw) => {
            let cleaned = sanitize_thresholds_json(&raw);
            match serde_json::from_str::<ThresholdsDoc>(&cleaned) {
                Ok(doc) => apply_thresholds(&mut config, doc),
                Err(e) => {
                    return Err(EngineError::Config(format!(
                        "thresholds document unparseable: {e}"
                    )));
                }
            }
        }
        None => {
            warn!(key = keys::THRESHOLDS, "no thresholds in KV store, using defaults");
        }
    }

    apply_env_overrides(&mut config);

    info!(
        min_usd_internal = %config.min_usd_internal,
        min_usd_external = %config.min_usd_external,
        cumulative_internal = %config.cumulative_min_usd_internal,
        cumulative_external = %config.cumulative_min_usd_external,
        cooldown_seconds = config.cooldown_seconds,
        jitter_seconds = config.jitter_seconds,
        internal_rules = config.internal_rules.rules.len(),
        external_rules = config.external_rules.rules.len(),
        "monitor thresholds loaded"
    );
    Ok(config)
}

fn apply_thresholds(config: &mut MonitorConfig, doc: ThresholdsDoc) {
    if let Some(v) = doc.min_usd_internal.and_then(to_decimal) {
        config.min_usd_internal = v;
    }
    if let Some(v) = doc.min_usd_external.and_then(to_decimal) {
        config.min_usd_external = v;
    }
    if let Some(v) = doc.cumulative_min_usd_internal.and_then(to_decimal) {
        config.cumulative_min_usd_internal = v;
    }
    if let Some(v) = doc.cumulative_min_usd_external.and_then(to_decimal) {
        config.cumulative_min_usd_external = v;
    }
    if let Some(v) = doc.cooldown_seconds {
        config.cooldown_seconds = v;
    }
    if let Some(v) = doc.jitter_seconds {
        config.jitter_seconds = v;
    }
    if let Some(template) = doc.internal_rules {
        let set = template.into_rule_set();
        if !set.rules.is_empty() {
            config.internal_rules = set;
        }
    }
    if let Some(template) = doc.external_rules {
        let set = template.into_rule_set();
        if !set.rules.is_empty() {
            config.external_rules = set;
        }
    }
}

/// Only non-empty env vars take effect; parse failures keep the loaded value.
fn apply_env_overrides(config: &mut MonitorConfig) {
    if let Some(v) = env_decimal("MIN_USD_INTERNAL") {
        info!(%v, "env override: MIN_USD_INTERNAL");
        config.min_usd_internal = v;
    }
    if let Some(v) = env_decimal("MIN_USD_EXTERNAL") {
        info!(%v, "env override: MIN_USD_EXTERNAL");
        config.min_usd_external = v;
    }
    if let Some(v) = env_decimal("CUMULATIVE_MIN_USD_INTERNAL") {
        info!(%v, "env override: CUMULATIVE_MIN_USD_INTERNAL");
        config.cumulative_min_usd_internal = v;
    }
    if let Some(v) = env_decimal("CUMULATIVE_MIN_USD_EXTERNAL") {
        info!(%v, "env override: CUMULATIVE_MIN_USD_EXTERNAL");
        config.cumulative_min_usd_external = v;
    }
    if let Some(v) = env_parse::<u64>("COOLDOWN_SECONDS") {
        info!(v, "env override: COOLDOWN_SECONDS");
        config.cooldown_seconds = v;
    }
    if let Some(v) = env_parse::<u64>("COOLDOWN_JITTER_SECONDS") {
        info!(v, "env override: COOLDOWN_JITTER_SECONDS");
        config.jitter_seconds = v;
    }
}

// ---------------------------------------------------------------------------
// Snapshot handle
// ---------------------------------------------------------------------------

/// Shared handle to the active threshold snapshot.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<MonitorConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// A consistent snapshot for one event. The lock is never held across
    /// an await point.
    pub fn snapshot(&self) -> Arc<MonitorConfig> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    pub fn install(&self, config: MonitorConfig) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_string(key).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
}

fn env_decimal(key: &str) -> Option<Decimal> {
    env_string(key).and_then(|v| Decimal::from_str(&v).ok())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clean_env() {
        for key in [
            "BSC_WS_URL",
            "BSC_RPC_URL",
            "REDIS_URL",
            "NOTIFIER_CHAT_ID",
            "WORKER_COUNT",
            "LOG_FORMAT",
            "MIN_USD_INTERNAL",
            "MIN_USD_EXTERNAL",
            "CUMULATIVE_MIN_USD_INTERNAL",
            "CUMULATIVE_MIN_USD_EXTERNAL",
            "COOLDOWN_SECONDS",
            "COOLDOWN_JITTER_SECONDS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_app_config_defaults() {
        clean_env();
        std::env::set_var("NOTIFIER_CHAT_ID", "-1001234");
        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.worker_count, 20);
        assert_eq!(config.metrics_port, 8001);
        assert_eq!(config.cumulative_window_seconds, 300);
        assert!(!config.allow_default_wbnb_price);
        clean_env();
    }

    #[test]
    #[serial]
    fn test_app_config_rejects_bad_urls() {
        clean_env();
        std::env::set_var("NOTIFIER_CHAT_ID", "-1001234");
        std::env::set_var("BSC_WS_URL", "https://not-a-ws-url");
        let err = AppConfig::from_env().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        clean_env();
    }

    #[test]
    #[serial]
    fn test_app_config_requires_chat_id() {
        clean_env();
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("NOTIFIER_CHAT_ID"));
        clean_env();
    }

    #[test]
    fn test_monitor_defaults_match_shipped_values() {
        let config = MonitorConfig::default();
        assert_eq!(config.min_usd_internal, dec!(200));
        assert_eq!(config.min_usd_external, dec!(400));
        assert_eq!(config.cumulative_min_usd_internal, dec!(500));
        assert_eq!(config.cumulative_min_usd_external, dec!(1000));
        assert_eq!(config.cooldown_seconds, 180);
        assert_eq!(config.jitter_seconds, 30);
    }

    #[test]
    fn test_sanitize_java_type_markers() {
        let raw = r#"{"@type": "com.example.Config", "min_usd_external": 400L, "cooldown_seconds": 180}"#;
        let cleaned = sanitize_thresholds_json(raw);
        let doc: ThresholdsDoc = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(doc.min_usd_external, Some(400.0));
        assert_eq!(doc.cooldown_seconds, Some(180));
    }

    #[test]
    fn test_sanitize_trailing_comma() {
        let raw = r#"{"@type": "X", "cooldown_seconds": 90, }"#;
        let cleaned = sanitize_thresholds_json(raw);
        let doc: ThresholdsDoc = serde_json::from_str(&cleaned).unwrap();
        assert_eq!(doc.cooldown_seconds, Some(90));
    }

    #[test]
    fn test_apply_thresholds_with_rules() {
        let raw = r#"{
            "min_usd_external": 400,
            "external_rules": {
                "trigger": "any",
                "priceChange": { "risePercent": 20 }
            }
        }"#;
        let doc: ThresholdsDoc = serde_json::from_str(raw).unwrap();
        let mut config = MonitorConfig::default();
        apply_thresholds(&mut config, doc);

        assert_eq!(config.min_usd_external, dec!(400));
        assert_eq!(config.external_rules.rules.len(), 1);
        // Untouched fields keep defaults.
        assert_eq!(config.min_usd_internal, dec!(200));
        assert_eq!(config.internal_rules.rules.len(), 2);
    }

    #[test]
    #[serial]
    fn test_env_override_thresholds() {
        clean_env();
        std::env::set_var("MIN_USD_EXTERNAL", "750");
        std::env::set_var("COOLDOWN_SECONDS", "240");
        let mut config = MonitorConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.min_usd_external, dec!(750));
        assert_eq!(config.cooldown_seconds, 240);
        clean_env();
    }

    #[test]
    #[serial]
    fn test_env_override_invalid_parse_ignored() {
        clean_env();
        std::env::set_var("MIN_USD_EXTERNAL", "not_a_number");
        let mut config = MonitorConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(config.min_usd_external, dec!(400));
        clean_env();
    }

    #[test]
    fn test_snapshot_isolation() {
        let handle = ConfigHandle::new(MonitorConfig::default());
        let snapshot = handle.snapshot();

        let mut updated = MonitorConfig::default();
        updated.min_usd_external = dec!(999);
        handle.install(updated);

        // The old snapshot is unchanged; new reads see the update.
        assert_eq!(snapshot.min_usd_external, dec!(400));
        assert_eq!(handle.snapshot().min_usd_external, dec!(999));
    }
}
