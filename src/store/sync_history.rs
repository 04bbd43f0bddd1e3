use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;

use super::{SqliteRecordStore, SyncHistoryEntry};

#[async_trait]
pub trait SyncHistoryStore {
    async fn append_sync_history(&self, entry: &SyncHistoryEntry) -> Result<()>;
    /// Ordered ascending by timestamp.
    async fn get_sync_history(&self) -> Result<Vec<SyncHistoryEntry>>;
}

#[async_trait]
impl SyncHistoryStore for SqliteRecordStore {
    async fn append_sync_history(&self, entry: &SyncHistoryEntry) -> Result<()> {
        let brands = serde_json::to_string(&entry.brands).unwrap_or_default();
        let purchasers = serde_json::to_string(&entry.purchasers).unwrap_or_default();
        sqlx::query(
            "INSERT INTO tbl_sync_history (timestamp, synced, skipped, errors, message, brands, purchasers)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(entry.timestamp.to_rfc3339())
        .bind(entry.synced)
        .bind(entry.skipped)
        .bind(entry.errors)
        .bind(&entry.message)
        .bind(brands)
        .bind(purchasers)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn get_sync_history(&self) -> Result<Vec<SyncHistoryEntry>> {
        let rows: Vec<(String, i64, i64, i64, Option<String>, String, String)> = sqlx::query_as(
            "SELECT timestamp, synced, skipped, errors, message, brands, purchasers
             FROM tbl_sync_history ORDER BY timestamp ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|(timestamp, synced, skipped, errors, message, brands, purchasers)| {
                SyncHistoryEntry {
                    timestamp: timestamp.parse().unwrap_or_else(|_| Utc::now()),
                    synced,
                    skipped,
                    errors,
                    message,
                    brands: serde_json::from_str(&brands).unwrap_or_default(),
                    purchasers: serde_json::from_str(&purchasers).unwrap_or_default(),
                }
            })
            .collect())
    }
}

/// Ancillary log writers for out-of-scope consumers (admin HTTP surface,
/// scheduler, notifications). The core writes these but does not interpret
/// their contents.
#[async_trait]
pub trait ExtractionLogStore {
    async fn append_extraction_log(&self, run_id: &str, level: &str, data_json: &str) -> Result<()>;
}

#[async_trait]
impl ExtractionLogStore for SqliteRecordStore {
    async fn append_extraction_log(&self, run_id: &str, level: &str, data_json: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO tbl_extraction_logs (run_id, timestamp, level, data) VALUES (?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(level)
        .bind(data_json)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
pub trait EmailLogStore {
    async fn record_email_intent(
        &self,
        run_id: &str,
        recipient: Option<&str>,
        subject: Option<&str>,
        body: Option<&str>,
    ) -> Result<()>;
}

#[async_trait]
impl EmailLogStore for SqliteRecordStore {
    async fn record_email_intent(
        &self,
        run_id: &str,
        recipient: Option<&str>,
        subject: Option<&str>,
        body: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO tbl_email_logs (run_id, timestamp, recipient, subject, body)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(recipient)
        .bind(subject)
        .bind(body)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

#[async_trait]
pub trait ScheduleLogStore {
    async fn append_schedule_log(&self, schedule_id: Option<&str>, outcome: &str) -> Result<()>;
}

#[async_trait]
impl ScheduleLogStore for SqliteRecordStore {
    async fn append_schedule_log(&self, schedule_id: Option<&str>, outcome: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO tbl_schedule_logs (schedule_id, timestamp, outcome) VALUES (?, ?, ?)",
        )
        .bind(schedule_id)
        .bind(Utc::now().to_rfc3339())
        .bind(outcome)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

/// Generic string k/v used for small pieces of state beyond the manifest
/// and resume-state singletons (e.g. feature flags read by the admin surface).
#[async_trait]
pub trait AppConfig {
    async fn get_meta(&self, key: &str) -> Result<Option<String>>;
    async fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

#[async_trait]
impl AppConfig for SqliteRecordStore {
    async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM tbl_app_config WHERE key = ?")
            .bind(key)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.map(|(v,)| v))
    }

    async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO tbl_app_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
