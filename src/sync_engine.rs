use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::config::BucketConfig;
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::object_store::ObjectStoreAdapter;
use crate::store::{
    FileRegistry, FileRegistryInput, ManifestEntry, ManifestStore, ResumeState, ResumeStateStore,
    SyncHistoryEntry, SyncHistoryStore,
};

#[derive(Debug, Clone, Default)]
pub struct BucketSyncOutcome {
    pub brand: String,
    pub purchaser: String,
    pub synced: i64,
    pub skipped: i64,
    pub errors: i64,
    pub synced_files: Vec<SyncedFile>,
}

#[derive(Debug, Clone)]
pub struct SyncedFile {
    pub full_path: String,
    pub relative_path: String,
    pub brand: String,
    pub purchaser: String,
}

pub struct SyncRequest {
    pub buckets: Vec<BucketConfig>,
    pub staging_dir: PathBuf,
    pub concurrency: usize,
    pub download_budget: Option<usize>,
    pub already_extracted_paths: HashSet<String>,
}

/// Walks each configured bucket, downloading objects whose content has
/// changed and skipping those whose on-disk SHA-256 still matches the
/// manifest. Up to `concurrency` buckets run at once (`buffer_unordered`);
/// the download budget (when set) is shared across all of them via an
/// atomic counter.
pub async fn run_sync<S>(
    store: Arc<S>,
    object_store: Arc<dyn ObjectStoreAdapter>,
    request: SyncRequest,
    metrics: Arc<EngineMetrics>,
    on_progress: impl Fn(usize, usize) + Send + Sync + 'static,
) -> Result<Vec<BucketSyncOutcome>>
where
    S: FileRegistry + ManifestStore + ResumeStateStore + SyncHistoryStore + Send + Sync + 'static,
{
    // A crashed prior run may have left a `.part` file; clean it up before
    // this sync starts so it doesn't get mistaken for a completed download.
    recover_dangling_download(store.as_ref()).await?;

    let budget = request
        .download_budget
        .map(|b| Arc::new(AtomicUsize::new(b)));
    let done_buckets = Arc::new(AtomicUsize::new(0));
    let total_buckets = request.buckets.len();
    let on_progress = Arc::new(on_progress);
    let staging_dir = Arc::new(request.staging_dir);
    let already_extracted = Arc::new(request.already_extracted_paths);

    let results: Vec<Result<BucketSyncOutcome>> = stream::iter(request.buckets.into_iter())
        .map(|bucket| {
            let store = store.clone();
            let object_store = object_store.clone();
            let staging_dir = staging_dir.clone();
            let budget = budget.clone();
            let already_extracted = already_extracted.clone();
            let done_buckets = done_buckets.clone();
            let on_progress = on_progress.clone();
            let metrics = metrics.clone();
            async move {
                let outcome = sync_one_bucket(
                    store.as_ref(),
                    object_store.as_ref(),
                    &bucket,
                    &staging_dir,
                    budget.as_deref(),
                    &already_extracted,
                    metrics.as_ref(),
                )
                .await;
                let done = done_buckets.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(done, total_buckets);
                outcome
            }
        })
        .buffer_unordered(request.concurrency.max(1))
        .collect()
        .await;

    let mut outcomes = Vec::with_capacity(results.len());
    let mut all_synced = 0i64;
    let mut all_skipped = 0i64;
    let mut all_errors = 0i64;
    let mut brands = HashSet::new();
    let mut purchasers = HashSet::new();

    for outcome in results {
        let outcome = outcome?;
        all_synced += outcome.synced;
        all_skipped += outcome.skipped;
        all_errors += outcome.errors;
        brands.insert(outcome.brand.clone());
        purchasers.insert(outcome.purchaser.clone());
        outcomes.push(outcome);
    }

    store
        .append_sync_history(&SyncHistoryEntry {
            timestamp: Utc::now(),
            synced: all_synced,
            skipped: all_skipped,
            errors: all_errors,
            message: None,
            brands: brands.into_iter().collect(),
            purchasers: purchasers.into_iter().collect(),
        })
        .await?;

    Ok(outcomes)
}

#[allow(clippy::too_many_arguments)]
async fn sync_one_bucket<S>(
    store: &S,
    object_store: &dyn ObjectStoreAdapter,
    bucket: &BucketConfig,
    staging_dir: &std::path::Path,
    budget: Option<&AtomicUsize>,
    already_extracted: &HashSet<String>,
    metrics: &EngineMetrics,
) -> Result<BucketSyncOutcome>
where
    S: FileRegistry + ManifestStore + ResumeStateStore + Send + Sync,
{
    let objects = object_store.list(&bucket.bucket, &bucket.prefix).await?;
    // Read once for skip decisions; a concurrent bucket's write landing after
    // this snapshot only costs an extra re-download, never data corruption,
    // since writes go through `upsert_manifest_entry`'s own critical section.
    let manifest = store.get_manifest().await?;

    let mut outcome = BucketSyncOutcome {
        brand: bucket.tenant.clone(),
        purchaser: bucket.purchaser.clone(),
        ..Default::default()
    };

    for object in objects {
        let manifest_key = format!("{}|{}", bucket.bucket, object.key);
        let base_name = object
            .key
            .rsplit('/')
            .next()
            .unwrap_or(&object.key)
            .to_string();
        let local_path = staging_dir
            .join(&bucket.tenant)
            .join(&bucket.purchaser)
            .join(&base_name);
        let relative_path = format!("{}/{}/{}", bucket.tenant, bucket.purchaser, base_name);

        if already_extracted.contains(&relative_path) {
            outcome.skipped += 1;
            metrics.objects_skipped_total.inc();
            continue;
        }

        if let Some(entry) = manifest.get(&manifest_key) {
            if entry.etag.as_deref() == Some(object.etag.as_str())
                && local_path.exists()
                && sha256_matches(&local_path, &entry.sha256).await
            {
                debug!(key = %object.key, "skip: manifest matches");
                outcome.skipped += 1;
                metrics.objects_skipped_total.inc();
                continue;
            }
        }

        if let Some(budget) = budget {
            let decremented = budget
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| b.checked_sub(1))
                .is_ok();
            if !decremented {
                info!(bucket = %bucket.bucket, "download budget exhausted, stopping bucket");
                break;
            }
        }

        metrics.objects_in_flight.inc();
        let started = std::time::Instant::now();
        let download_result = download_one(
            store,
            object_store,
            bucket,
            &object.key,
            &object.etag,
            &local_path,
            &manifest_key,
        )
        .await;
        metrics.objects_in_flight.dec();
        metrics
            .download_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if let Err(e) = download_result {
            warn!(key = %object.key, error = %e, "download failed");
            outcome.errors += 1;
            metrics.objects_sync_failed_total.inc();
            continue;
        }

        outcome.synced += 1;
        metrics.objects_synced_total.inc();
        outcome.synced_files.push(SyncedFile {
            full_path: local_path.display().to_string(),
            relative_path,
            brand: bucket.tenant.clone(),
            purchaser: bucket.purchaser.clone(),
        });
    }

    info!(
        bucket = %bucket.bucket, synced = outcome.synced, skipped = outcome.skipped, errors = outcome.errors,
        "bucket sync complete"
    );

    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
async fn download_one<S>(
    store: &S,
    object_store: &dyn ObjectStoreAdapter,
    bucket: &BucketConfig,
    key: &str,
    etag: &str,
    local_path: &std::path::Path,
    manifest_key: &str,
) -> Result<()>
where
    S: FileRegistry + ManifestStore + ResumeStateStore + Send + Sync,
{
    store
        .set_resume_state(&ResumeState {
            sync_in_progress_path: Some(local_path.display().to_string()),
            sync_in_progress_manifest_key: Some(manifest_key.to_string()),
        })
        .await?;

    let part_path = append_part_suffix(local_path);

    let outcome = object_store.get(&bucket.bucket, key, &part_path).await?;
    let sha256 = sha256_file(&part_path).await;

    tokio::fs::rename(&part_path, local_path)
        .await
        .map_err(|e| crate::error::IntelliExtractError::ObjectStore(e.to_string()))?;

    let entry = ManifestEntry {
        etag: Some(etag.to_string()),
        sha256: sha256.clone(),
        size: outcome.bytes_written as i64,
        local_path: local_path.display().to_string(),
        last_synced_at: Utc::now(),
    };
    // Single-entry upsert takes the store's manifest critical section
    // internally, so concurrent bucket tasks never clobber each other's
    // writes the way a read-whole-blob/write-whole-blob cycle would.
    store.upsert_manifest_entry(manifest_key, entry).await?;

    let id = hex::encode(Sha256::digest(format!("{}|{}", bucket.bucket, key).as_bytes()));
    store
        .register_files(&[FileRegistryInput {
            id,
            full_path: local_path.display().to_string(),
            brand: bucket.tenant.clone(),
            purchaser: bucket.purchaser.clone(),
            size: outcome.bytes_written as i64,
            etag: Some(etag.to_string()),
            sha256: Some(sha256),
        }])
        .await?;

    store.clear_resume_state().await?;
    Ok(())
}

/// Deletes any `.part` file left by a crashed download and clears resume
/// state; the manifest is untouched since a partial download never wrote one.
/// Called both at the start of every sync and directly by the `resume`
/// maintenance command.
pub async fn recover_dangling_download<S>(store: &S) -> Result<()>
where
    S: ResumeStateStore,
{
    let resume_state = store.get_resume_state().await?;
    if let Some(path) = resume_state.sync_in_progress_path {
        let path = std::path::PathBuf::from(path);
        let part_path = append_part_suffix(&path);
        if tokio::fs::remove_file(&part_path).await.is_ok() {
            info!(path = %part_path.display(), "removed partial download on resume");
        }
        store.clear_resume_state().await?;
    }
    Ok(())
}

fn append_part_suffix(path: &std::path::Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".part");
    PathBuf::from(os)
}

async fn sha256_file(path: &std::path::Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => hex::encode(Sha256::digest(&bytes)),
        Err(_) => String::new(),
    }
}

async fn sha256_matches(path: &std::path::Path, expected: &str) -> bool {
    sha256_file(path).await == expected
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::MockObjectStore;
    use crate::store::SqliteRecordStore;
    use std::sync::atomic::AtomicUsize;

    fn test_bucket() -> BucketConfig {
        BucketConfig {
            bucket: "acme-bucket".into(),
            prefix: String::new(),
            tenant: "acme".into(),
            purchaser: "retailx".into(),
        }
    }

    #[tokio::test]
    async fn skips_paths_already_extracted_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("db.sqlite")).await.unwrap();
        let object_store = MockObjectStore::new();
        let bucket = test_bucket();
        object_store.put(&bucket.bucket, "a.csv", b"hello".to_vec(), "etag-a").await;

        let mut already_extracted = HashSet::new();
        already_extracted.insert("acme/retailx/a.csv".to_string());

        let outcome = sync_one_bucket(
            &store,
            &object_store,
            &bucket,
            &dir.path().join("staging"),
            None,
            &already_extracted,
            &EngineMetrics::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.synced, 0);
        assert_eq!(outcome.skipped, 1);
        assert!(!dir.path().join("staging/acme/retailx/a.csv").exists());
    }

    #[tokio::test]
    async fn skips_object_whose_manifest_entry_and_on_disk_hash_still_match() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("db.sqlite")).await.unwrap();
        let object_store = MockObjectStore::new();
        let bucket = test_bucket();
        object_store.put(&bucket.bucket, "a.csv", b"hello".to_vec(), "etag-a").await;
        let staging_dir = dir.path().join("staging");

        // First pass downloads and records the manifest entry.
        let first = sync_one_bucket(
            &store,
            &object_store,
            &bucket,
            &staging_dir,
            None,
            &HashSet::new(),
            &EngineMetrics::default(),
        )
        .await
        .unwrap();
        assert_eq!(first.synced, 1);

        // Second pass against the unchanged object/etag/on-disk file is a skip.
        let second = sync_one_bucket(
            &store,
            &object_store,
            &bucket,
            &staging_dir,
            None,
            &HashSet::new(),
            &EngineMetrics::default(),
        )
        .await
        .unwrap();
        assert_eq!(second.synced, 0);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn exhausted_download_budget_stops_the_bucket_early() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteRecordStore::open(&dir.path().join("db.sqlite")).await.unwrap();
        let object_store = MockObjectStore::new();
        let bucket = test_bucket();
        object_store.put(&bucket.bucket, "a.csv", b"1".to_vec(), "etag-a").await;
        object_store.put(&bucket.bucket, "b.csv", b"2".to_vec(), "etag-b").await;
        object_store.put(&bucket.bucket, "c.csv", b"3".to_vec(), "etag-c").await;

        let budget = AtomicUsize::new(1);
        let outcome = sync_one_bucket(
            &store,
            &object_store,
            &bucket,
            &dir.path().join("staging"),
            Some(&budget),
            &HashSet::new(),
            &EngineMetrics::default(),
        )
        .await
        .unwrap();

        assert_eq!(outcome.synced, 1);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(outcome.errors, 0);
        assert_eq!(budget.load(Ordering::SeqCst), 0);
    }
}
