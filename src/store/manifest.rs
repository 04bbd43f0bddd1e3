use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::{IntelliExtractError, Result};

use super::{ManifestEntry, SqliteRecordStore};

const MANIFEST_KEY: &str = "manifest";

/// A single-JSON-blob manifest keyed by `bucket|key`, stored as one row in
/// `tbl_app_config`. This is a known scalability ceiling (every update
/// rewrites the whole blob) accepted as-is; updates are serialised through
/// an in-process mutex so concurrent sync tasks never race the read-modify-write.
#[async_trait]
pub trait ManifestStore {
    async fn get_manifest(&self) -> Result<HashMap<String, ManifestEntry>>;
    async fn save_manifest(&self, manifest: &HashMap<String, ManifestEntry>) -> Result<()>;
    async fn upsert_manifest_entry(&self, key: &str, entry: ManifestEntry) -> Result<()>;
    async fn delete_manifest_entry(&self, key: &str) -> Result<()>;
}

#[async_trait]
impl ManifestStore for SqliteRecordStore {
    async fn get_manifest(&self) -> Result<HashMap<String, ManifestEntry>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM tbl_app_config WHERE key = ?")
                .bind(MANIFEST_KEY)
                .fetch_optional(self.pool())
                .await?;
        match row {
            Some((value,)) => serde_json::from_str(&value)
                .map_err(|e| IntelliExtractError::Store(sqlx::Error::Decode(Box::new(e)))),
            None => Ok(HashMap::new()),
        }
    }

    async fn save_manifest(&self, manifest: &HashMap<String, ManifestEntry>) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let value = serde_json::to_string(manifest)
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Encode(Box::new(e))))?;
        sqlx::query(
            "INSERT INTO tbl_app_config (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(MANIFEST_KEY)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn upsert_manifest_entry(&self, key: &str, entry: ManifestEntry) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = read_locked(self).await?;
        manifest.insert(key.to_string(), entry);
        write_locked(self, &manifest).await
    }

    async fn delete_manifest_entry(&self, key: &str) -> Result<()> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = read_locked(self).await?;
        manifest.remove(key);
        write_locked(self, &manifest).await
    }
}

/// Helpers used while `manifest_lock` is already held, reading/writing
/// without re-acquiring it (`get_manifest`/`save_manifest` would deadlock).
async fn read_locked(store: &SqliteRecordStore) -> Result<HashMap<String, ManifestEntry>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM tbl_app_config WHERE key = ?")
        .bind(MANIFEST_KEY)
        .fetch_optional(store.pool())
        .await?;
    match row {
        Some((value,)) => serde_json::from_str(&value)
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Decode(Box::new(e)))),
        None => Ok(HashMap::new()),
    }
}

async fn write_locked(
    store: &SqliteRecordStore,
    manifest: &HashMap<String, ManifestEntry>,
) -> Result<()> {
    let value = serde_json::to_string(manifest)
        .map_err(|e| IntelliExtractError::Store(sqlx::Error::Encode(Box::new(e))))?;
    sqlx::query(
        "INSERT INTO tbl_app_config (key, value) VALUES (?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(MANIFEST_KEY)
    .bind(value)
    .execute(store.pool())
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn save_then_get_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("db.sqlite"))
            .await
            .unwrap();

        let mut manifest = HashMap::new();
        manifest.insert(
            "bucket|key1".to_string(),
            ManifestEntry {
                etag: Some("e1".into()),
                sha256: "abc".into(),
                size: 10,
                local_path: "/tmp/x".into(),
                last_synced_at: Utc::now(),
            },
        );
        store.save_manifest(&manifest).await.unwrap();
        let reloaded = store.get_manifest().await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded["bucket|key1"].sha256, "abc");
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("db.sqlite"))
            .await
            .unwrap();
        let manifest = store.get_manifest().await.unwrap();
        store.save_manifest(&manifest).await.unwrap();
        let reloaded = store.get_manifest().await.unwrap();
        assert_eq!(reloaded.len(), manifest.len());
    }
}
