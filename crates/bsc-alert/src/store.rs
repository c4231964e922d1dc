//! Append-only relational sink for delivered alerts and dead letters.
//!
//! SQLite via `sqlx::query()` runtime binds; the schema is created by
//! `sqlx::migrate!` at startup.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::types::AlertPayload;

pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    /// Open (creating if needed) the alert database and run migrations.
    pub async fn new(db_path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(1) // SQLite is single-writer
            .connect(&format!("sqlite:{db_path}?mode=rwc"))
            .await
            .context("failed to connect to alert database")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("failed to run alert database migrations")?;

        info!(db_path, "alert store initialized");
        Ok(Self { pool })
    }

    /// Append one alert outcome row.
    pub async fn record_alert(
        &self,
        payload: &AlertPayload,
        batch_id: &str,
        status: &str,
    ) -> Result<i64> {
        let reasons = serde_json::to_string(
            &payload
                .reasons
                .iter()
                .map(|r| r.description.as_str())
                .collect::<Vec<_>>(),
        )?;

        let result = sqlx::query(
            "INSERT INTO alert_log (batch_id, token, tx_hash, usd_value, reasons, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch_id)
        .bind(payload.token.to_string())
        .bind(payload.tx_hash.to_string())
        .bind(payload.usd_value.to_string())
        .bind(&reasons)
        .bind(status)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Park an alert that exhausted its delivery retries.
    pub async fn record_dead_letter(
        &self,
        payload: &AlertPayload,
        reason: &str,
        retries: u32,
    ) -> Result<i64> {
        let payload_json = serde_json::to_string(payload)?;

        let result = sqlx::query(
            "INSERT INTO alert_dead_letter_queue (token, payload, reason, retries, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(payload.token.to_string())
        .bind(&payload_json)
        .bind(reason)
        .bind(retries as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Count of alert rows for a token (operator tooling and tests).
    pub async fn alert_count(&self, token: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alert_log WHERE token = ?")
            .bind(token)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    pub async fn dead_letter_count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM alert_dead_letter_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn payload() -> AlertPayload {
        AlertPayload {
            token: "0x1111111111111111111111111111111111111111".parse().unwrap(),
            pair: "0x2222222222222222222222222222222222222222".parse().unwrap(),
            tx_hash: alloy::primitives::B256::repeat_byte(7),
            symbol: "TKN".into(),
            origin: "internal".into(),
            usd_value: dec!(512.5),
            quote_symbol: "USDT".into(),
            quote_amount: dec!(512.5),
            base_amount: dec!(1000),
            price_usd: dec!(0.5),
            market_cap_usd: dec!(250000),
            reasons: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_count_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("alerts.db");
        let store = AlertStore::new(db_path.to_str().unwrap()).await.unwrap();

        let p = payload();
        let id = store.record_alert(&p, "batch-1", "sent").await.unwrap();
        assert!(id > 0);
        store.record_alert(&p, "batch-1", "failed").await.unwrap();

        let count = store.alert_count(&p.token.to_string()).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("alerts.db");
        let store = AlertStore::new(db_path.to_str().unwrap()).await.unwrap();

        let p = payload();
        store
            .record_dead_letter(&p, "notifier returned 500", 3)
            .await
            .unwrap();
        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
    }
}
