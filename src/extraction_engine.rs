use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::Result;
use crate::extraction_client::ExtractionClient;
use crate::metrics::EngineMetrics;
use crate::store::{
    Checkpoint, CheckpointReader, CheckpointWriter, ExtractionLogStore, FileRegistry, Status,
};

#[derive(Debug, Clone)]
pub struct ExtractionInput {
    pub file_path: PathBuf,
    pub relative_path: String,
    pub brand: String,
    pub purchaser: String,
}

/// Fallback used when `ExtractionRequest::concurrency` is unspecified or <=0.
const DEFAULT_CONCURRENCY: usize = 5;

pub struct ExtractionRequest {
    pub files: Vec<ExtractionInput>,
    pub run_id: String,
    pub concurrency: usize,
    pub requests_per_second: Option<u32>,
    pub skip_completed: bool,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ExtractionFailure {
    pub relative_path: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionOutcome {
    pub processed: usize,
    pub skipped: usize,
    pub aborted: bool,
    pub failures: Vec<ExtractionFailure>,
}

/// Strict per-interval token bucket: `capacity` tokens are available each
/// `interval`, and unused tokens never roll over (matching a non-accumulating
/// `requestsPerSecond` ceiling rather than a leaky/accumulating bucket).
struct TokenBucket {
    capacity: u32,
    interval: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    remaining: u32,
    window_started: tokio::time::Instant,
}

impl TokenBucket {
    fn new(capacity: u32, interval: Duration) -> Self {
        Self {
            capacity,
            interval,
            state: Mutex::new(BucketState {
                remaining: capacity,
                window_started: tokio::time::Instant::now(),
            }),
        }
    }

    async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.window_started.elapsed();
                if elapsed >= self.interval {
                    state.remaining = self.capacity;
                    state.window_started = tokio::time::Instant::now();
                }
                if state.remaining > 0 {
                    state.remaining -= 1;
                    None
                } else {
                    Some(self.interval.saturating_sub(elapsed))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

/// Drives `files` through `client` under bounded concurrency, writing a
/// `running` checkpoint immediately before and a terminal checkpoint
/// immediately after each call. A `NetworkAbortError` from the client sets a
/// shared cancellation token; in-flight tasks finish and write their terminal
/// checkpoint, not-yet-started tasks short-circuit without writing one.
pub async fn run_extraction<S>(
    store: Arc<S>,
    client: Arc<dyn ExtractionClient>,
    request: ExtractionRequest,
    metrics: Arc<EngineMetrics>,
    on_progress: impl Fn(usize, usize) + Send + Sync + 'static,
) -> Result<ExtractionOutcome>
where
    S: CheckpointWriter + CheckpointReader + ExtractionLogStore + FileRegistry + Send + Sync + 'static,
{
    let completed = if request.skip_completed {
        store.get_completed_paths(None).await?
    } else {
        store.get_completed_paths(Some(&request.run_id)).await?
    };

    let (to_process, skipped_now): (Vec<_>, Vec<_>) = request
        .files
        .into_iter()
        .partition(|f| !completed.contains(&f.relative_path));

    let mut outcome = ExtractionOutcome {
        skipped: skipped_now.len(),
        ..Default::default()
    };

    if !skipped_now.is_empty() {
        let now = Utc::now();
        let checkpoints: Vec<Checkpoint> = skipped_now
            .iter()
            .map(|f| Checkpoint {
                run_id: request.run_id.clone(),
                relative_path: f.relative_path.clone(),
                file_path: f.file_path.display().to_string(),
                brand: f.brand.clone(),
                purchaser: f.purchaser.clone(),
                status: Status::Skipped,
                started_at: Some(now),
                finished_at: Some(now),
                latency_ms: None,
                status_code: None,
                error_message: None,
                pattern_key: None,
                full_response: None,
            })
            .collect();
        store.upsert_checkpoints(&checkpoints).await?;
    }

    if to_process.is_empty() {
        return Ok(outcome);
    }

    // `concurrency` defaults to 5 if unspecified or <=0; callers are expected to
    // resolve this themselves, but the engine enforces it too so the invariant
    // holds regardless of what a caller passes through.
    let concurrency = if request.concurrency > 0 {
        request.concurrency
    } else {
        DEFAULT_CONCURRENCY
    };

    let total = to_process.len();
    let done_counter = Arc::new(AtomicUsize::new(0));
    let on_progress = Arc::new(on_progress);
    let cancel = CancellationToken::new();
    let rate_limiter = request
        .requests_per_second
        .filter(|&r| r > 0)
        .map(|r| Arc::new(TokenBucket::new(r, Duration::from_millis(1000))));
    let failures: Arc<Mutex<Vec<ExtractionFailure>>> = Arc::new(Mutex::new(Vec::new()));
    let aborted = Arc::new(std::sync::atomic::AtomicBool::new(false));

    stream::iter(to_process.into_iter())
        .map(|file| {
            let store = store.clone();
            let client = client.clone();
            let run_id = request.run_id.clone();
            let done_counter = done_counter.clone();
            let on_progress = on_progress.clone();
            let cancel = cancel.clone();
            let rate_limiter = rate_limiter.clone();
            let failures = failures.clone();
            let aborted = aborted.clone();
            let metrics = metrics.clone();

            async move {
                if cancel.is_cancelled() {
                    return;
                }

                if let Some(bucket) = &rate_limiter {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        _ = bucket.acquire() => {}
                    }
                }

                let started = Utc::now();
                if let Err(e) = store
                    .upsert_checkpoint(&Checkpoint {
                        run_id: run_id.clone(),
                        relative_path: file.relative_path.clone(),
                        file_path: file.file_path.display().to_string(),
                        brand: file.brand.clone(),
                        purchaser: file.purchaser.clone(),
                        status: Status::Running,
                        started_at: Some(started),
                        finished_at: None,
                        latency_ms: None,
                        status_code: None,
                        error_message: None,
                        pattern_key: None,
                        full_response: None,
                    })
                    .await
                {
                    warn!(path = %file.relative_path, error = %e, "failed to write running checkpoint");
                }

                let call_started = std::time::Instant::now();
                let extraction = client
                    .extract(&file.file_path, &file.brand, &file.purchaser)
                    .await;
                metrics
                    .extraction_duration_seconds
                    .observe(call_started.elapsed().as_secs_f64());

                let finished = Utc::now();
                let (status, status_code, latency_ms, error_message, pattern_key, full_response) =
                    match extraction {
                        Ok(result) => (
                            if result.success { Status::Done } else { Status::Error },
                            Some(result.status_code),
                            Some(result.latency_ms),
                            result.error_message,
                            result.pattern_key,
                            result.full_response,
                        ),
                        Err(e) if e.is_network_abort() => {
                            aborted.store(true, Ordering::SeqCst);
                            cancel.cancel();
                            (
                                Status::Error,
                                Some(0),
                                Some((finished - started).num_milliseconds()),
                                Some(e.to_string()),
                                None,
                                None,
                            )
                        }
                        Err(e) => (
                            Status::Error,
                            Some(0),
                            Some((finished - started).num_milliseconds()),
                            Some(e.to_string()),
                            None,
                            None,
                        ),
                    };

                let checkpoint = Checkpoint {
                    run_id: run_id.clone(),
                    relative_path: file.relative_path.clone(),
                    file_path: file.file_path.display().to_string(),
                    brand: file.brand.clone(),
                    purchaser: file.purchaser.clone(),
                    status,
                    started_at: Some(started),
                    finished_at: Some(finished),
                    latency_ms,
                    status_code,
                    error_message: error_message.clone(),
                    pattern_key,
                    full_response,
                };

                if status == Status::Error {
                    metrics.extractions_failed_total.inc();
                    failures.lock().await.push(ExtractionFailure {
                        relative_path: file.relative_path.clone(),
                        error_message: error_message.clone(),
                    });
                } else {
                    metrics.extractions_done_total.inc();
                }

                if let Err(e) = store.upsert_checkpoint(&checkpoint).await {
                    warn!(path = %file.relative_path, error = %e, "failed to write terminal checkpoint");
                }

                match store
                    .get_file_by_full_path(&file.file_path.display().to_string())
                    .await
                {
                    Ok(Some(entry)) => {
                        if let Err(e) = store.update_status(&entry.id, status, &run_id).await {
                            warn!(path = %file.relative_path, error = %e, "failed to update registry status");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(path = %file.relative_path, error = %e, "failed to look up registry entry");
                    }
                }

                let log_json = serde_json::json!({
                    "relative_path": file.relative_path,
                    "status": status.as_str(),
                    "latency_ms": latency_ms,
                    "status_code": status_code,
                })
                .to_string();
                let level = if status == Status::Error { "warn" } else { "info" };
                let _ = store.append_extraction_log(&run_id, level, &log_json).await;

                let done = done_counter.fetch_add(1, Ordering::SeqCst) + 1;
                on_progress(done, total);
            }
        })
        .buffer_unordered(concurrency)
        .collect::<Vec<()>>()
        .await;

    outcome.processed = done_counter.load(Ordering::SeqCst);
    outcome.aborted = aborted.load(Ordering::SeqCst);
    outcome.failures = Arc::try_unwrap(failures)
        .map(|m| m.into_inner())
        .unwrap_or_default();

    if outcome.aborted {
        info!(run_id = %request.run_id, processed = outcome.processed, total, "extraction aborted: network unreachable");
    }

    Ok(outcome)
}

pub fn completed_path_set(checkpoints: &[Checkpoint]) -> HashSet<String> {
    checkpoints
        .iter()
        .filter(|c| c.status == Status::Done)
        .map(|c| c.relative_path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capacity_tokens_are_granted_without_waiting() {
        let bucket = TokenBucket::new(3, Duration::from_millis(200));
        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            bucket.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn exhausted_bucket_waits_for_the_next_window() {
        let bucket = TokenBucket::new(1, Duration::from_millis(100));
        bucket.acquire().await;
        let started = tokio::time::Instant::now();
        bucket.acquire().await;
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn unused_tokens_do_not_roll_over_into_the_next_window() {
        let bucket = TokenBucket::new(2, Duration::from_millis(80));
        bucket.acquire().await; // 1 token left in this window, deliberately unused
        tokio::time::sleep(Duration::from_millis(120)).await;
        // a fresh window has started; both tokens should be available again,
        // not 3 (1 carried over + 2 new) and not blocked on the stale window.
        let started = tokio::time::Instant::now();
        bucket.acquire().await;
        bucket.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn zero_concurrency_falls_back_to_the_default_instead_of_serialising() {
        use crate::extraction_client::MockExtractionClient;
        use crate::store::SqliteRecordStore;
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            SqliteRecordStore::open(&dir.path().join("db.sqlite"))
                .await
                .unwrap(),
        );
        let client: Arc<dyn ExtractionClient> = Arc::new(MockExtractionClient::default());
        let files: Vec<ExtractionInput> = (0..3)
            .map(|i| ExtractionInput {
                file_path: dir.path().join(format!("f{i}.csv")),
                relative_path: format!("acme/retailx/f{i}.csv"),
                brand: "acme".into(),
                purchaser: "retailx".into(),
            })
            .collect();

        let outcome = run_extraction(
            store,
            client,
            ExtractionRequest {
                files,
                run_id: "RUN-zero-concurrency".into(),
                concurrency: 0,
                requests_per_second: None,
                skip_completed: false,
            },
            Arc::new(EngineMetrics::default()),
            |_, _| {},
        )
        .await
        .unwrap();

        assert_eq!(outcome.processed, 3);
        assert!(outcome.failures.is_empty());
    }
}
