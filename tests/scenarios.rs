use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use intelliextract::config::{BucketConfig, Config, ExtractionAuth};
use intelliextract::coordinator::{ExecuteRequest, ProgressEvent, WorkflowCoordinator};
use intelliextract::error::{IntelliExtractError, Result};
use intelliextract::extraction_client::{ExtractionClient, ExtractionResult, MockExtractionClient};
use intelliextract::extraction_engine::{self, ExtractionInput, ExtractionRequest};
use intelliextract::metrics::EngineMetrics;
use intelliextract::object_store::MockObjectStore;
use intelliextract::report::NullReportSink;
use intelliextract::store::{CaseId, CheckpointReader, ManifestStore, SqliteRecordStore};
use intelliextract::sync_engine::{self, SyncRequest};
use tempfile::TempDir;

fn test_config(checkpoint_path: PathBuf, staging_dir: PathBuf, buckets: Vec<BucketConfig>) -> Config {
    Config {
        checkpoint_path,
        staging_dir,
        extraction_base_url: "http://127.0.0.1:0".into(),
        auth: ExtractionAuth {
            access_key: "key".into(),
            secret_message: "secret".into(),
            signature: "sig".into(),
        },
        buckets,
        extraction_concurrency: 4,
        requests_per_second: None,
        sync_concurrency: 4,
        download_budget: None,
        request_timeout_secs: 5,
        log_file: None,
        report_dir: None,
        use_mock_extraction: true,
    }
}

fn bucket(tenant: &str, purchaser: &str) -> BucketConfig {
    BucketConfig {
        bucket: format!("{tenant}-bucket"),
        prefix: String::new(),
        tenant: tenant.into(),
        purchaser: purchaser.into(),
    }
}

async fn new_store(dir: &TempDir) -> SqliteRecordStore {
    SqliteRecordStore::open(&dir.path().join("db.sqlite"))
        .await
        .unwrap()
}

fn engine_metrics() -> Arc<EngineMetrics> {
    Arc::new(EngineMetrics::default())
}

#[tokio::test]
async fn cold_sync_downloads_every_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let object_store = Arc::new(MockObjectStore::new());
    let b = bucket("acme", "retailx");
    object_store
        .put(&b.bucket, "a.csv", b"x".repeat(100), "etag-a")
        .await;
    object_store
        .put(&b.bucket, "b.csv", b"x".repeat(200), "etag-b")
        .await;
    object_store
        .put(&b.bucket, "c.csv", b"x".repeat(300), "etag-c")
        .await;

    let outcomes = sync_engine::run_sync(
        store.clone(),
        object_store.clone(),
        SyncRequest {
            buckets: vec![b.clone()],
            staging_dir: dir.path().join("staging"),
            concurrency: 2,
            download_budget: None,
            already_extracted_paths: Default::default(),
        },
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].synced, 3);
    assert_eq!(outcomes[0].skipped, 0);
    assert_eq!(outcomes[0].errors, 0);
    for name in ["a.csv", "b.csv", "c.csv"] {
        assert!(dir.path().join(format!("staging/acme/retailx/{name}")).exists());
    }
    let manifest = store.get_manifest().await.unwrap();
    assert_eq!(manifest.len(), 3);
}

#[tokio::test]
async fn resync_only_redownloads_the_changed_object() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let object_store = Arc::new(MockObjectStore::new());
    let b = bucket("acme", "retailx");
    object_store
        .put(&b.bucket, "a.csv", b"x".repeat(100), "etag-a")
        .await;
    object_store
        .put(&b.bucket, "b.csv", b"x".repeat(200), "etag-b")
        .await;
    object_store
        .put(&b.bucket, "c.csv", b"x".repeat(300), "etag-c")
        .await;

    let request = || SyncRequest {
        buckets: vec![b.clone()],
        staging_dir: dir.path().join("staging"),
        concurrency: 2,
        download_budget: None,
        already_extracted_paths: Default::default(),
    };

    sync_engine::run_sync(
        store.clone(),
        object_store.clone(),
        request(),
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    object_store
        .put(&b.bucket, "b.csv", b"y".repeat(200), "etag-b2")
        .await;

    let outcomes = sync_engine::run_sync(
        store.clone(),
        object_store.clone(),
        request(),
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    assert_eq!(outcomes[0].synced, 1);
    assert_eq!(outcomes[0].skipped, 2);
    let contents = tokio::fs::read(dir.path().join("staging/acme/retailx/b.csv"))
        .await
        .unwrap();
    assert_eq!(contents, b"y".repeat(200));
}

#[tokio::test]
async fn extraction_respects_rate_limit_and_processes_all_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let client: Arc<dyn ExtractionClient> = Arc::new(MockExtractionClient { latency_ms: 1 });

    let files: Vec<ExtractionInput> = (0..6)
        .map(|i| {
            let path = dir.path().join(format!("f{i}.csv"));
            ExtractionInput {
                file_path: path,
                relative_path: format!("acme/retailx/f{i}.csv"),
                brand: "acme".into(),
                purchaser: "retailx".into(),
            }
        })
        .collect();

    let progress_calls: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let progress_calls_for_cb = progress_calls.clone();

    let started = std::time::Instant::now();
    let outcome = extraction_engine::run_extraction(
        store.clone(),
        client,
        ExtractionRequest {
            files,
            run_id: "RUN-rate".into(),
            concurrency: 3,
            requests_per_second: Some(2),
            skip_completed: false,
        },
        engine_metrics(),
        move |done, total| progress_calls_for_cb.lock().unwrap().push((done, total)),
    )
    .await
    .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome.processed, 6);
    assert_eq!(outcome.skipped, 0);
    assert!(!outcome.aborted);
    assert!(outcome.failures.is_empty());

    // 6 calls at 2/s is 3 full intervals; allow jitter below the 3.0s ideal.
    assert!(
        elapsed >= std::time::Duration::from_millis(2400),
        "expected rate limiting to stretch the run to >= 2.4s, took {elapsed:?}"
    );

    let calls = progress_calls.lock().unwrap();
    assert_eq!(calls.len(), 6, "progress callback should fire exactly once per file");
    let mut last_done = 0;
    for &(done, total) in calls.iter() {
        assert_eq!(total, 6);
        assert!(done > last_done, "done should be strictly increasing");
        last_done = done;
    }
    assert_eq!(last_done, 6);
}

/// Succeeds for the first `abort_on - 1` calls, then returns a network-abort
/// error on and after the `abort_on`th; used to exercise the extraction
/// engine's cancellation path without touching a real socket.
struct AbortOnNthCallClient {
    abort_on: usize,
    calls: std::sync::atomic::AtomicUsize,
}

#[async_trait]
impl ExtractionClient for AbortOnNthCallClient {
    async fn extract(&self, _file_path: &Path, _brand: &str, _purchaser: &str) -> Result<ExtractionResult> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if call >= self.abort_on {
            Err(IntelliExtractError::NetworkAbort("connection refused".into()))
        } else {
            Ok(ExtractionResult {
                success: true,
                status_code: 200,
                latency_ms: 1,
                pattern_key: Some("mock-pattern".into()),
                error_message: None,
                full_response: None,
            })
        }
    }
}

#[tokio::test]
async fn network_abort_cancels_not_yet_started_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let client: Arc<dyn ExtractionClient> = Arc::new(AbortOnNthCallClient {
        abort_on: 4,
        calls: std::sync::atomic::AtomicUsize::new(0),
    });

    let files: Vec<ExtractionInput> = (0..10)
        .map(|i| ExtractionInput {
            file_path: dir.path().join(format!("f{i}.csv")),
            relative_path: format!("acme/retailx/f{i}.csv"),
            brand: "acme".into(),
            purchaser: "retailx".into(),
        })
        .collect();

    // concurrency=1 keeps call order deterministic so the 4th call is the abort.
    let outcome = extraction_engine::run_extraction(
        store.clone(),
        client,
        ExtractionRequest {
            files: files.clone(),
            run_id: "RUN-abort".into(),
            concurrency: 1,
            requests_per_second: None,
            skip_completed: false,
        },
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    assert!(outcome.aborted);
    assert_eq!(outcome.processed, 4, "3 successes + 1 network-abort failure");
    assert_eq!(outcome.failures.len(), 1);

    // A second pass over the same run with skip_completed=false must pick up
    // the 7 files with no `done` checkpoint yet: the aborted one plus the 6
    // that never started (run-scoped completion, not global).
    let client2: Arc<dyn ExtractionClient> = Arc::new(MockExtractionClient::default());
    let outcome2 = extraction_engine::run_extraction(
        store.clone(),
        client2,
        ExtractionRequest {
            files,
            run_id: "RUN-abort".into(),
            concurrency: 4,
            requests_per_second: None,
            skip_completed: false,
        },
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    assert_eq!(outcome2.processed, 7);
}

#[tokio::test]
async fn dangling_partial_download_is_cleaned_up_on_resume() {
    use intelliextract::store::{ResumeState, ResumeStateStore};

    let dir = tempfile::tempdir().unwrap();
    let store = new_store(&dir).await;

    let local_path = dir.path().join("staging/acme/retailx/a.csv");
    tokio::fs::create_dir_all(local_path.parent().unwrap())
        .await
        .unwrap();
    let part_path = {
        let mut os = local_path.as_os_str().to_os_string();
        os.push(".part");
        PathBuf::from(os)
    };
    tokio::fs::write(&part_path, b"half-downloaded").await.unwrap();
    store
        .set_resume_state(&ResumeState {
            sync_in_progress_path: Some(local_path.display().to_string()),
            sync_in_progress_manifest_key: Some("acme-bucket|a.csv".into()),
        })
        .await
        .unwrap();

    sync_engine::recover_dangling_download(&store).await.unwrap();

    assert!(!part_path.exists());
    let resume_state = store.get_resume_state().await.unwrap();
    assert!(resume_state.sync_in_progress_path.is_none());
}

#[tokio::test]
async fn pipeline_extracts_exactly_the_files_it_just_synced() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let object_store = Arc::new(MockObjectStore::new());
    let b = bucket("acme", "retailx");
    object_store
        .put(&b.bucket, "a.csv", b"one".to_vec(), "etag-a")
        .await;
    object_store
        .put(&b.bucket, "b.csv", b"two".to_vec(), "etag-b")
        .await;

    let config = test_config(
        dir.path().join("db.sqlite"),
        dir.path().join("staging"),
        vec![b],
    );
    let extraction_client: Arc<dyn ExtractionClient> = Arc::new(MockExtractionClient::default());
    let coordinator = WorkflowCoordinator::new(
        store.clone(),
        object_store.clone(),
        extraction_client,
        Arc::new(NullReportSink),
        config,
    );

    let events: Arc<Mutex<Vec<ProgressEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let events_for_closure = events.clone();
    let on_update: intelliextract::coordinator::OnUpdate = Arc::new(move |event| {
        events_for_closure.lock().unwrap().push(event);
    });

    coordinator
        .execute(
            ExecuteRequest {
                case_id: CaseId::Pipe,
                pairs: vec![],
                retry_failed: false,
                concurrency: None,
                requests_per_second: None,
                skip_completed: false,
            },
            on_update,
        )
        .await
        .unwrap();

    let reports: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Report(m) => Some(m.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].success, 2);
    assert_eq!(reports[0].failed, 0);
}

#[tokio::test]
async fn skipped_records_are_counted_not_silently_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(new_store(&dir).await);
    let client: Arc<dyn ExtractionClient> = Arc::new(MockExtractionClient::default());

    let already_done: Vec<ExtractionInput> = (0..2)
        .map(|i| ExtractionInput {
            file_path: dir.path().join(format!("old{i}.csv")),
            relative_path: format!("acme/retailx/old{i}.csv"),
            brand: "acme".into(),
            purchaser: "retailx".into(),
        })
        .collect();
    extraction_engine::run_extraction(
        store.clone(),
        client.clone(),
        ExtractionRequest {
            files: already_done.clone(),
            run_id: "RUN-0".into(),
            concurrency: 2,
            requests_per_second: None,
            skip_completed: false,
        },
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    let new_files: Vec<ExtractionInput> = (0..3)
        .map(|i| ExtractionInput {
            file_path: dir.path().join(format!("new{i}.csv")),
            relative_path: format!("acme/retailx/new{i}.csv"),
            brand: "acme".into(),
            purchaser: "retailx".into(),
        })
        .collect();
    let files: Vec<ExtractionInput> = already_done.into_iter().chain(new_files).collect();

    let outcome = extraction_engine::run_extraction(
        store.clone(),
        client,
        ExtractionRequest {
            files,
            run_id: "RUN-1".into(),
            concurrency: 3,
            requests_per_second: None,
            skip_completed: true,
        },
        engine_metrics(),
        |_, _| {},
    )
    .await
    .unwrap();

    assert_eq!(outcome.skipped, 2);
    assert_eq!(outcome.processed, 3);
    assert!(outcome.failures.is_empty());

    let checkpoints = store.get_checkpoints_for_run("RUN-1").await.unwrap();
    let skipped_rows = checkpoints
        .iter()
        .filter(|c| c.status == intelliextract::store::Status::Skipped)
        .count();
    assert_eq!(skipped_rows, 2);
}
