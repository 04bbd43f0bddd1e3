use async_trait::async_trait;
use chrono::Utc;

use crate::error::Result;

use super::{FileRegistryEntry, FileRegistryInput, SqliteRecordStore, Status};

/// Master registry of discovered objects. Idempotent upsert by `id`
/// (stable hash of `bucket|key`); an input that omits `sha256` preserves
/// whatever was previously recorded rather than clearing it.
#[async_trait]
pub trait FileRegistry {
    async fn register_files(&self, inputs: &[FileRegistryInput]) -> Result<()>;
    async fn get_file(&self, id: &str) -> Result<Option<FileRegistryEntry>>;
    /// Looks a registry row up by the local staging path the Sync Engine
    /// wrote it under, which is the same path the Extraction Engine and
    /// `discover_staged_files` address a file by. Used because neither of
    /// those holds onto the remote `bucket|key` the row's id is hashed from.
    async fn get_file_by_full_path(&self, full_path: &str) -> Result<Option<FileRegistryEntry>>;
    async fn update_status(&self, id: &str, status: Status, run_id: &str) -> Result<()>;
}

#[async_trait]
impl FileRegistry for SqliteRecordStore {
    async fn register_files(&self, inputs: &[FileRegistryInput]) -> Result<()> {
        if inputs.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        let now = Utc::now().to_rfc3339();
        for input in inputs {
            sqlx::query(
                r#"
                INSERT INTO tbl_file_registry
                    (id, full_path, brand, purchaser, size, etag, sha256, status, run_id, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?)
                ON CONFLICT(id) DO UPDATE SET
                    full_path = excluded.full_path,
                    brand = excluded.brand,
                    purchaser = excluded.purchaser,
                    size = excluded.size,
                    etag = excluded.etag,
                    sha256 = COALESCE(excluded.sha256, tbl_file_registry.sha256),
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&input.id)
            .bind(&input.full_path)
            .bind(&input.brand)
            .bind(&input.purchaser)
            .bind(input.size)
            .bind(&input.etag)
            .bind(&input.sha256)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<FileRegistryEntry>> {
        let row = sqlx::query_as::<_, (String, String, String, String, i64, Option<String>, Option<String>, String, Option<String>)>(
            "SELECT id, full_path, brand, purchaser, size, etag, sha256, status, run_id FROM tbl_file_registry WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(row_to_entry))
    }

    async fn get_file_by_full_path(&self, full_path: &str) -> Result<Option<FileRegistryEntry>> {
        let row = sqlx::query_as::<_, (String, String, String, String, i64, Option<String>, Option<String>, String, Option<String>)>(
            "SELECT id, full_path, brand, purchaser, size, etag, sha256, status, run_id FROM tbl_file_registry WHERE full_path = ?",
        )
        .bind(full_path)
        .fetch_optional(self.pool())
        .await?;

        Ok(row.map(row_to_entry))
    }

    async fn update_status(&self, id: &str, status: Status, run_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE tbl_file_registry SET status = ?, run_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(run_id)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

fn row_to_entry(
    row: (String, String, String, String, i64, Option<String>, Option<String>, String, Option<String>),
) -> FileRegistryEntry {
    let (id, full_path, brand, purchaser, size, etag, sha256, status, run_id) = row;
    FileRegistryEntry {
        id,
        full_path,
        brand,
        purchaser,
        size,
        etag,
        sha256,
        status: Status::parse(&status),
        run_id,
    }
}
