use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;

use crate::config::{BucketConfig, Config};
use crate::error::{IntelliExtractError, Result};
use crate::extraction_client::ExtractionClient;
use crate::extraction_engine::{self, ExtractionInput, ExtractionOutcome, ExtractionRequest};
use crate::metrics::{compute_metrics, EngineMetrics, RunMetrics};
use crate::object_store::ObjectStoreAdapter;
use crate::report::ReportSink;
use crate::store::{
    CaseId, CheckpointReader, EmailLogStore, FileRegistry, ManifestStore, ResumeStateStore,
    RunStore, Status, SyncHistoryStore,
};
use crate::sync_engine::{self, BucketSyncOutcome, SyncRequest};

pub type OnUpdate = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub case_id: CaseId,
    pub pairs: Vec<(String, String)>,
    pub retry_failed: bool,
    pub concurrency: Option<usize>,
    pub requests_per_second: Option<u32>,
    pub skip_completed: bool,
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    RunId(String),
    Log(String),
    Progress {
        phase: &'static str,
        done: usize,
        total: usize,
    },
    ResumeSkip {
        already: usize,
        total: usize,
    },
    CumulativeMetrics {
        success: i64,
        failed: i64,
        total: i64,
    },
    Report(RunMetrics),
    Error(String),
}

/// Tracks non-terminal runs per case id so a second invocation for the same
/// case while one is in flight is rejected, mirroring a single-process
/// "only one active run per case" guarantee.
#[derive(Default)]
pub struct ActiveRunRegistry {
    inner: tokio::sync::Mutex<HashMap<&'static str, String>>,
}

impl ActiveRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, case_id: &'static str, run_id: &str) -> Result<()> {
        let mut guard = self.inner.lock().await;
        if guard.contains_key(case_id) {
            return Err(IntelliExtractError::Validation(format!(
                "a run is already active for case {case_id}"
            )));
        }
        guard.insert(case_id, run_id.to_string());
        Ok(())
    }

    async fn unregister(&self, case_id: &'static str) {
        self.inner.lock().await.remove(case_id);
    }
}

pub struct WorkflowCoordinator<S> {
    store: Arc<S>,
    object_store: Arc<dyn ObjectStoreAdapter>,
    extraction_client: Arc<dyn ExtractionClient>,
    report_sink: Arc<dyn ReportSink>,
    config: Config,
    registry: Arc<ActiveRunRegistry>,
    metrics: Arc<EngineMetrics>,
}

impl<S> WorkflowCoordinator<S>
where
    S: FileRegistry
        + ManifestStore
        + ResumeStateStore
        + SyncHistoryStore
        + EmailLogStore
        + CheckpointReader
        + crate::store::CheckpointWriter
        + crate::store::ExtractionLogStore
        + RunStore
        + Send
        + Sync
        + 'static,
{
    pub fn new(
        store: Arc<S>,
        object_store: Arc<dyn ObjectStoreAdapter>,
        extraction_client: Arc<dyn ExtractionClient>,
        report_sink: Arc<dyn ReportSink>,
        config: Config,
    ) -> Self {
        Self {
            store,
            object_store,
            extraction_client,
            report_sink,
            config,
            registry: Arc::new(ActiveRunRegistry::new()),
            metrics: Arc::new(EngineMetrics::default()),
        }
    }

    /// Exposes the ambient prometheus-backed collector so the (out-of-scope)
    /// admin surface can scrape a snapshot without reaching into run internals.
    pub fn metrics(&self) -> Arc<EngineMetrics> {
        self.metrics.clone()
    }

    pub async fn execute(&self, request: ExecuteRequest, on_update: OnUpdate) -> Result<()> {
        let case_label = request.case_id.as_str();
        let run_id = self.store.start_new_run(case_label, None).await?;
        self.registry.register(case_label, &run_id).await?;
        on_update(ProgressEvent::RunId(run_id.clone()));

        let result = self.execute_inner(&request, &run_id, &on_update).await;

        self.registry.unregister(case_label).await;

        match &result {
            Ok(()) => {
                self.store.mark_run_completed(&run_id).await?;
                on_update(ProgressEvent::Log(
                    "Operation completed successfully.".into(),
                ));
            }
            Err(e) => {
                self.store.mark_run_failed(&run_id).await?;
                on_update(ProgressEvent::Error(e.to_string()));
            }
        }

        result
    }

    async fn execute_inner(
        &self,
        request: &ExecuteRequest,
        run_id: &str,
        on_update: &OnUpdate,
    ) -> Result<()> {
        let buckets = self.resolve_buckets(&request.pairs);
        let mut failures = Vec::new();

        match request.case_id {
            CaseId::Sync | CaseId::P1 => {
                self.run_sync_phase(&buckets, on_update).await?;
            }
            CaseId::Extract | CaseId::P2 => {
                let files = self
                    .discover_staged_files(&buckets, request.retry_failed)
                    .await?;
                let outcome = self
                    .run_extraction_phase(files, request, run_id, on_update)
                    .await?;
                failures = outcome.failures;
            }
            CaseId::Pipe => {
                let outcomes = self.run_sync_phase(&buckets, on_update).await?;
                let synced_files: Vec<sync_engine::SyncedFile> =
                    outcomes.into_iter().flat_map(|o| o.synced_files).collect();

                let files: Vec<ExtractionInput> = if synced_files.is_empty() {
                    self.discover_staged_files(&buckets, request.retry_failed)
                        .await?
                } else {
                    synced_files
                        .iter()
                        .map(|f| ExtractionInput {
                            file_path: PathBuf::from(&f.full_path),
                            relative_path: f.relative_path.clone(),
                            brand: f.brand.clone(),
                            purchaser: f.purchaser.clone(),
                        })
                        .collect()
                };
                let outcome = self
                    .run_extraction_phase(files, request, run_id, on_update)
                    .await?;
                failures = outcome.failures;
            }
        }

        on_update(ProgressEvent::Log("Generating report...".into()));
        let checkpoints = self.store.get_checkpoints_for_run(run_id).await?;
        let metrics = compute_metrics(run_id, &checkpoints, Utc::now(), Utc::now());
        self.report_sink.submit(run_id, &metrics).await?;
        self.store
            .save_run_summary(run_id, &serde_json::to_string(&metrics).unwrap_or_default())
            .await?;

        if !failures.is_empty() {
            let subject = format!(
                "Extraction run {run_id} completed with {} failure(s)",
                failures.len()
            );
            let body = serde_json::json!({
                "run_id": run_id,
                "failures": failures,
                "metrics": metrics,
            })
            .to_string();
            if let Err(e) = self
                .store
                .record_email_intent(run_id, None, Some(&subject), Some(&body))
                .await
            {
                on_update(ProgressEvent::Log(format!(
                    "failed to record failure-notification intent: {e}"
                )));
            }
        }

        on_update(ProgressEvent::Report(metrics));

        Ok(())
    }

    async fn run_sync_phase(
        &self,
        buckets: &[BucketConfig],
        on_update: &OnUpdate,
    ) -> Result<Vec<BucketSyncOutcome>> {
        let already_extracted = self.store.get_completed_paths(None).await?;
        let on_update = on_update.clone();
        let progress_cb = move |done: usize, total: usize| {
            on_update(ProgressEvent::Progress {
                phase: "sync",
                done,
                total,
            });
        };

        sync_engine::run_sync(
            self.store.clone(),
            self.object_store.clone(),
            SyncRequest {
                buckets: buckets.to_vec(),
                staging_dir: self.config.staging_dir.clone(),
                concurrency: self.config.sync_concurrency,
                download_budget: self.config.download_budget,
                already_extracted_paths: already_extracted,
            },
            self.metrics.clone(),
            progress_cb,
        )
        .await
    }

    async fn run_extraction_phase(
        &self,
        files: Vec<ExtractionInput>,
        request: &ExecuteRequest,
        run_id: &str,
        on_update: &OnUpdate,
    ) -> Result<ExtractionOutcome> {
        let total_files = files.len();
        let completed = if request.skip_completed {
            self.store.get_completed_paths(None).await?
        } else {
            self.store.get_completed_paths(Some(run_id)).await?
        };
        let already = files
            .iter()
            .filter(|f| completed.contains(&f.relative_path))
            .count();
        on_update(ProgressEvent::ResumeSkip {
            already,
            total: total_files,
        });

        let progress_cb = {
            let on_update = on_update.clone();
            move |done: usize, total: usize| {
                on_update(ProgressEvent::Progress {
                    phase: "extract",
                    done,
                    total,
                });
            }
        };

        let outcome = extraction_engine::run_extraction(
            self.store.clone(),
            self.extraction_client.clone(),
            ExtractionRequest {
                files,
                run_id: run_id.to_string(),
                concurrency: match request.concurrency {
                    Some(c) if c > 0 => c,
                    _ => self.config.extraction_concurrency,
                },
                requests_per_second: request
                    .requests_per_second
                    .or(self.config.requests_per_second),
                skip_completed: request.skip_completed,
            },
            self.metrics.clone(),
            progress_cb,
        )
        .await?;

        let stats = self
            .store
            .get_cumulative_stats(&crate::store::CumulativeStatsFilter::default())
            .await?;
        on_update(ProgressEvent::CumulativeMetrics {
            success: stats.success,
            failed: stats.failed,
            total: stats.total,
        });

        Ok(outcome)
    }

    fn resolve_buckets(&self, pairs: &[(String, String)]) -> Vec<BucketConfig> {
        if pairs.is_empty() {
            return self.config.buckets.clone();
        }
        let wanted: HashSet<(String, String)> = pairs.iter().cloned().collect();
        self.config
            .buckets
            .iter()
            .filter(|b| wanted.contains(&(b.tenant.clone(), b.purchaser.clone())))
            .cloned()
            .collect()
    }

    /// A staged file is a candidate when the registry has no opinion on it
    /// yet, or when its last recorded status is `error` and the caller asked
    /// to retry failures; anything already `done`/`running`/`skipped` in the
    /// registry is left alone.
    async fn discover_staged_files(
        &self,
        buckets: &[BucketConfig],
        retry_failed: bool,
    ) -> Result<Vec<ExtractionInput>> {
        let mut out = Vec::new();

        for bucket in buckets {
            let dir = self
                .config
                .staging_dir
                .join(&bucket.tenant)
                .join(&bucket.purchaser);
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                let base_name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                let relative_path =
                    format!("{}/{}/{}", bucket.tenant, bucket.purchaser, base_name);

                let full_path = path.display().to_string();
                let registered = self.store.get_file_by_full_path(&full_path).await?;
                let eligible = match registered.as_ref().map(|e| e.status) {
                    None | Some(Status::Pending) => true,
                    Some(Status::Error) => retry_failed,
                    Some(Status::Done) | Some(Status::Running) | Some(Status::Skipped) => false,
                };
                if !eligible {
                    continue;
                }

                out.push(ExtractionInput {
                    file_path: path,
                    relative_path,
                    brand: bucket.tenant.clone(),
                    purchaser: bucket.purchaser.clone(),
                });
            }
        }
        Ok(out)
    }
}
