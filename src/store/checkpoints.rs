use std::collections::HashSet;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;

use super::{Checkpoint, SqliteRecordStore, Status};

#[async_trait]
pub trait CheckpointWriter {
    /// Atomic single-key upsert; last write for `(run_id, relative_path)` wins.
    async fn upsert_checkpoint(&self, c: &Checkpoint) -> Result<()>;
    /// Atomic batch upsert, used for writing skipped-file checkpoints in one write.
    async fn upsert_checkpoints(&self, cs: &[Checkpoint]) -> Result<()>;
}

#[async_trait]
pub trait CheckpointReader {
    /// `status='done'` paths, scoped to `run_id` when given else global.
    async fn get_completed_paths(&self, run_id: Option<&str>) -> Result<HashSet<String>>;
    /// `status` in `{done, skipped, error}`, scoped to `run_id` when given else global.
    async fn get_processed_paths(&self, run_id: Option<&str>) -> Result<HashSet<String>>;
    async fn get_error_paths(&self, run_id: &str) -> Result<HashSet<String>>;
    async fn get_checkpoints_for_run(&self, run_id: &str) -> Result<Vec<Checkpoint>>;
}

#[async_trait]
impl CheckpointWriter for SqliteRecordStore {
    async fn upsert_checkpoint(&self, c: &Checkpoint) -> Result<()> {
        upsert_one(self.pool(), c).await
    }

    async fn upsert_checkpoints(&self, cs: &[Checkpoint]) -> Result<()> {
        if cs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for c in cs {
            upsert_one_tx(&mut tx, c).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn upsert_one(pool: &sqlx::SqlitePool, c: &Checkpoint) -> Result<()> {
    sqlx::query(UPSERT_SQL)
        .bind(&c.run_id)
        .bind(&c.relative_path)
        .bind(&c.file_path)
        .bind(&c.brand)
        .bind(&c.purchaser)
        .bind(c.status.as_str())
        .bind(c.started_at.map(|t| t.to_rfc3339()))
        .bind(c.finished_at.map(|t| t.to_rfc3339()))
        .bind(c.latency_ms)
        .bind(c.status_code)
        .bind(&c.error_message)
        .bind(&c.pattern_key)
        .bind(&c.full_response)
        .execute(pool)
        .await?;
    Ok(())
}

async fn upsert_one_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    c: &Checkpoint,
) -> Result<()> {
    sqlx::query(UPSERT_SQL)
        .bind(&c.run_id)
        .bind(&c.relative_path)
        .bind(&c.file_path)
        .bind(&c.brand)
        .bind(&c.purchaser)
        .bind(c.status.as_str())
        .bind(c.started_at.map(|t| t.to_rfc3339()))
        .bind(c.finished_at.map(|t| t.to_rfc3339()))
        .bind(c.latency_ms)
        .bind(c.status_code)
        .bind(&c.error_message)
        .bind(&c.pattern_key)
        .bind(&c.full_response)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

const UPSERT_SQL: &str = r#"
    INSERT INTO tbl_checkpoints
        (run_id, relative_path, file_path, brand, purchaser, status, started_at,
         finished_at, latency_ms, status_code, error_message, pattern_key, full_response)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(run_id, relative_path) DO UPDATE SET
        file_path = excluded.file_path,
        brand = excluded.brand,
        purchaser = excluded.purchaser,
        status = excluded.status,
        started_at = excluded.started_at,
        finished_at = excluded.finished_at,
        latency_ms = excluded.latency_ms,
        status_code = excluded.status_code,
        error_message = excluded.error_message,
        pattern_key = excluded.pattern_key,
        full_response = excluded.full_response
"#;

#[async_trait]
impl CheckpointReader for SqliteRecordStore {
    async fn get_completed_paths(&self, run_id: Option<&str>) -> Result<HashSet<String>> {
        paths_with_statuses(self.pool(), run_id, &["done"]).await
    }

    async fn get_processed_paths(&self, run_id: Option<&str>) -> Result<HashSet<String>> {
        paths_with_statuses(self.pool(), run_id, &["done", "skipped", "error"]).await
    }

    async fn get_error_paths(&self, run_id: &str) -> Result<HashSet<String>> {
        paths_with_statuses(self.pool(), Some(run_id), &["error"]).await
    }

    async fn get_checkpoints_for_run(&self, run_id: &str) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"SELECT run_id, relative_path, file_path, brand, purchaser, status, started_at,
                      finished_at, latency_ms, status_code, error_message, pattern_key, full_response
               FROM tbl_checkpoints WHERE run_id = ?"#,
        )
        .bind(run_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

async fn paths_with_statuses(
    pool: &sqlx::SqlitePool,
    run_id: Option<&str>,
    statuses: &[&str],
) -> Result<HashSet<String>> {
    let placeholders = statuses.iter().map(|_| "?").collect::<Vec<_>>().join(",");
    let sql = match run_id {
        Some(_) => format!(
            "SELECT DISTINCT relative_path FROM tbl_checkpoints WHERE run_id = ? AND status IN ({placeholders})"
        ),
        None => format!(
            "SELECT DISTINCT relative_path FROM tbl_checkpoints WHERE status IN ({placeholders})"
        ),
    };
    let mut query = sqlx::query_as::<_, (String,)>(&sql);
    if let Some(r) = run_id {
        query = query.bind(r);
    }
    for s in statuses {
        query = query.bind(*s);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows.into_iter().map(|(p,)| p).collect())
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    run_id: String,
    relative_path: String,
    file_path: String,
    brand: String,
    purchaser: String,
    status: String,
    started_at: Option<String>,
    finished_at: Option<String>,
    latency_ms: Option<i64>,
    status_code: Option<i32>,
    error_message: Option<String>,
    pattern_key: Option<String>,
    full_response: Option<String>,
}

impl From<CheckpointRow> for Checkpoint {
    fn from(r: CheckpointRow) -> Self {
        Checkpoint {
            run_id: r.run_id,
            relative_path: r.relative_path,
            file_path: r.file_path,
            brand: r.brand,
            purchaser: r.purchaser,
            status: Status::parse(&r.status),
            started_at: r.started_at.and_then(|s| s.parse().ok()),
            finished_at: r.finished_at.and_then(|s| s.parse().ok()),
            latency_ms: r.latency_ms,
            status_code: r.status_code,
            error_message: r.error_message,
            pattern_key: r.pattern_key,
            full_response: r.full_response,
        }
    }
}

pub fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
