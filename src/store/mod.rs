mod checkpoints;
mod file_registry;
mod manifest;
mod pool;
mod resume_state;
mod runs;
pub mod schema;
mod sync_history;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::Result;

pub use checkpoints::{CheckpointReader, CheckpointWriter};
pub use file_registry::FileRegistry;
pub use manifest::ManifestStore;
pub use resume_state::ResumeStateStore;
pub use runs::RunStore;
pub use sync_history::{AppConfig, EmailLogStore, ExtractionLogStore, ScheduleLogStore, SyncHistoryStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Running => "running",
            Status::Done => "done",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Status {
        match s {
            "running" => Status::Running,
            "done" => Status::Done,
            "error" => Status::Error,
            "skipped" => Status::Skipped,
            _ => Status::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CaseId {
    Pipe,
    Sync,
    Extract,
    P1,
    P2,
}

impl CaseId {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseId::Pipe => "PIPE",
            CaseId::Sync => "SYNC",
            CaseId::Extract => "EXTRACT",
            CaseId::P1 => "P1",
            CaseId::P2 => "P2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Done,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileRegistryInput {
    pub id: String,
    pub full_path: String,
    pub brand: String,
    pub purchaser: String,
    pub size: i64,
    pub etag: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileRegistryEntry {
    pub id: String,
    pub full_path: String,
    pub brand: String,
    pub purchaser: String,
    pub size: i64,
    pub etag: Option<String>,
    pub sha256: Option<String>,
    pub status: Status,
    pub run_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub run_id: String,
    pub relative_path: String,
    pub file_path: String,
    pub brand: String,
    pub purchaser: String,
    pub status: Status,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<i64>,
    pub status_code: Option<i32>,
    pub error_message: Option<String>,
    pub pattern_key: Option<String>,
    pub full_response: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub etag: Option<String>,
    pub sha256: String,
    pub size: i64,
    pub local_path: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeState {
    pub sync_in_progress_path: Option<String>,
    pub sync_in_progress_manifest_key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub synced: i64,
    pub skipped: i64,
    pub errors: i64,
    pub message: Option<String>,
    pub brands: Vec<String>,
    pub purchasers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CumulativeStats {
    pub success: i64,
    pub failed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default)]
pub struct CumulativeStatsFilter {
    pub brand: Option<String>,
    pub purchaser: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub case_id: String,
    pub summary: Option<String>,
}

/// A single embedded connection pool implementing every capability group.
/// Engines depend on the narrow traits (`FileRegistry`, `CheckpointWriter`,
/// ...) rather than this concrete type.
#[derive(Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
    db_path: std::path::PathBuf,
    manifest_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SqliteRecordStore {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = pool::open(path).await?;
        Ok(Self {
            pool,
            db_path: path.to_path_buf(),
            manifest_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// `close()` is idempotent: sqlx's pool close is itself idempotent, so a
    /// second call after the pool is already closed is a no-op.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Writes a consistent disaster-recovery copy to `<db_path>.bak` via
    /// SQLite's own backup mechanism (`VACUUM INTO`), safe to run against a
    /// live pool. Best-effort: callers treat a failure here as non-fatal.
    pub async fn backup(&self) -> Result<()> {
        let bak_path = {
            let mut p = self.db_path.clone().into_os_string();
            p.push(".bak");
            p
        };
        let bak_path = bak_path.to_string_lossy().replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{bak_path}'"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
pub trait RecordStore:
    FileRegistry
    + CheckpointWriter
    + CheckpointReader
    + RunStore
    + ManifestStore
    + ResumeStateStore
    + SyncHistoryStore
    + ExtractionLogStore
    + EmailLogStore
    + ScheduleLogStore
    + AppConfig
    + Send
    + Sync
{
}

impl RecordStore for SqliteRecordStore {}
