use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::store::{Checkpoint, Status};

#[derive(Debug, Clone, Serialize, Default)]
pub struct FailureBreakdown {
    pub timeout: i64,
    pub read_error: i64,
    pub server_error: i64,
    pub client_error: i64,
    pub other: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlowFile {
    pub relative_path: String,
    pub latency_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrandFailures {
    pub brand: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Anomaly {
    pub relative_path: String,
    pub kind: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_id: String,
    pub total_files: i64,
    pub success: i64,
    pub failed: i64,
    pub skipped: i64,
    pub processed: i64,
    pub total_processing_time_ms: i64,
    pub throughput_per_second: f64,
    pub throughput_per_minute: f64,
    pub avg_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub error_rate: f64,
    pub failure_breakdown: FailureBreakdown,
    pub top_slowest: Vec<SlowFile>,
    pub failures_by_brand: Vec<BrandFailures>,
    pub anomalies: Vec<Anomaly>,
}

/// Pure function over a run's checkpoint rows. No I/O: callers fetch the
/// rows from the record store and pass the already-loaded slice in.
pub fn compute_metrics(
    run_id: &str,
    records: &[Checkpoint],
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> RunMetrics {
    let _ = (started_at, finished_at);

    let success = records.iter().filter(|r| r.status == Status::Done).count() as i64;
    let failed = records.iter().filter(|r| r.status == Status::Error).count() as i64;
    let skipped = records.iter().filter(|r| r.status == Status::Skipped).count() as i64;
    let total_files = records.len() as i64;
    let processed = success + failed;

    let mut latencies: Vec<i64> = records
        .iter()
        .filter(|r| matches!(r.status, Status::Done | Status::Error))
        .filter_map(|r| r.latency_ms)
        .filter(|&l| l >= 0)
        .collect();
    latencies.sort_unstable();

    let total_processing_time_ms: i64 = latencies.iter().sum();
    let throughput_per_second = if total_processing_time_ms > 0 {
        processed as f64 / (total_processing_time_ms as f64 / 1000.0)
    } else {
        0.0
    };
    let throughput_per_minute = throughput_per_second * 60.0;

    let avg_latency_ms = if !latencies.is_empty() {
        total_processing_time_ms as f64 / latencies.len() as f64
    } else {
        0.0
    };

    let p50_latency_ms = percentile(&latencies, 0.50);
    let p95_latency_ms = percentile(&latencies, 0.95);
    let p99_latency_ms = percentile(&latencies, 0.99);

    let error_rate = if processed > 0 {
        failed as f64 / processed as f64
    } else {
        0.0
    };

    let failure_breakdown = classify_failures(records);

    let mut slow: Vec<SlowFile> = records
        .iter()
        .filter(|r| r.status == Status::Done)
        .filter_map(|r| {
            r.latency_ms.filter(|&l| l >= 0).map(|l| SlowFile {
                relative_path: r.relative_path.clone(),
                latency_ms: l,
            })
        })
        .collect();
    slow.sort_by(|a, b| b.latency_ms.cmp(&a.latency_ms));
    slow.truncate(5);

    let mut by_brand: HashMap<String, i64> = HashMap::new();
    for r in records.iter().filter(|r| r.status == Status::Error) {
        *by_brand.entry(r.brand.clone()).or_insert(0) += 1;
    }
    let mut failures_by_brand: Vec<BrandFailures> = by_brand
        .into_iter()
        .map(|(brand, count)| BrandFailures { brand, count })
        .collect();
    failures_by_brand.sort_by(|a, b| b.count.cmp(&a.count));

    let mut anomalies = Vec::new();
    let high_latency_threshold = 2.0 * p95_latency_ms;
    for r in records.iter().filter(|r| r.status == Status::Done) {
        if let Some(latency) = r.latency_ms {
            if high_latency_threshold > 0.0 && latency as f64 > high_latency_threshold {
                anomalies.push(Anomaly {
                    relative_path: r.relative_path.clone(),
                    kind: "high_latency".into(),
                    detail: Some(format!("{latency}ms > 2x p95 ({high_latency_threshold:.0}ms)")),
                });
            }
        }
    }
    for r in records.iter().filter(|r| r.status == Status::Error) {
        anomalies.push(Anomaly {
            relative_path: r.relative_path.clone(),
            kind: "unexpected_status".into(),
            detail: r.error_message.clone(),
        });
    }

    RunMetrics {
        run_id: run_id.to_string(),
        total_files,
        success,
        failed,
        skipped,
        processed,
        total_processing_time_ms,
        throughput_per_second,
        throughput_per_minute,
        avg_latency_ms,
        p50_latency_ms,
        p95_latency_ms,
        p99_latency_ms,
        error_rate,
        failure_breakdown,
        top_slowest: slow,
        failures_by_brand,
        anomalies,
    }
}

fn percentile(sorted: &[i64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (q * (sorted.len() as f64 - 1.0)).round() as usize;
    sorted[rank.min(sorted.len() - 1)] as f64
}

fn classify_failures(records: &[Checkpoint]) -> FailureBreakdown {
    let timeout_re = Regex::new(r"(?i)timeout|abort|etimedout|econnaborted").unwrap();
    let read_error_re = Regex::new(r"(?i)^read file:").unwrap();

    let mut breakdown = FailureBreakdown::default();
    for r in records.iter().filter(|r| r.status == Status::Error) {
        let status_code = r.status_code.unwrap_or(0);
        let message = r.error_message.as_deref().unwrap_or("");
        if status_code == 0 {
            if timeout_re.is_match(message) {
                breakdown.timeout += 1;
            } else if read_error_re.is_match(message) {
                breakdown.read_error += 1;
            } else {
                breakdown.other += 1;
            }
        } else if status_code >= 500 {
            breakdown.server_error += 1;
        } else if (400..500).contains(&status_code) {
            breakdown.client_error += 1;
        } else {
            breakdown.other += 1;
        }
    }
    breakdown
}

/// Ambient instrumentation mirroring the per-file counters/histograms the
/// admin surface scrapes; distinct from `compute_metrics`, which is pure.
pub struct EngineMetrics {
    pub registry: Registry,
    pub objects_synced_total: IntCounter,
    pub objects_skipped_total: IntCounter,
    pub objects_sync_failed_total: IntCounter,
    pub extractions_done_total: IntCounter,
    pub extractions_failed_total: IntCounter,
    pub objects_in_flight: IntGauge,
    pub download_duration_seconds: Histogram,
    pub extraction_duration_seconds: Histogram,
}

impl EngineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let objects_synced_total = IntCounter::new("objects_synced_total", "objects downloaded")?;
        let objects_skipped_total = IntCounter::new("objects_skipped_total", "objects skipped during sync")?;
        let objects_sync_failed_total = IntCounter::new("objects_sync_failed_total", "objects that failed to sync")?;
        let extractions_done_total = IntCounter::new("extractions_done_total", "files extracted successfully")?;
        let extractions_failed_total = IntCounter::new("extractions_failed_total", "files that failed extraction")?;
        let objects_in_flight = IntGauge::new("objects_in_flight", "downloads currently in progress")?;
        let download_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("download_duration_seconds", "object download duration")
                .buckets(vec![0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
        )?;
        let extraction_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("extraction_duration_seconds", "extraction request duration")
                .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
        )?;

        registry.register(Box::new(objects_synced_total.clone()))?;
        registry.register(Box::new(objects_skipped_total.clone()))?;
        registry.register(Box::new(objects_sync_failed_total.clone()))?;
        registry.register(Box::new(extractions_done_total.clone()))?;
        registry.register(Box::new(extractions_failed_total.clone()))?;
        registry.register(Box::new(objects_in_flight.clone()))?;
        registry.register(Box::new(download_duration_seconds.clone()))?;
        registry.register(Box::new(extraction_duration_seconds.clone()))?;

        Ok(Self {
            registry,
            objects_synced_total,
            objects_skipped_total,
            objects_sync_failed_total,
            extractions_done_total,
            extractions_failed_total,
            objects_in_flight,
            download_duration_seconds,
            extraction_duration_seconds,
        })
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new().expect("static metric definitions are well-formed")
    }
}

impl EngineMetrics {
    /// Renders the current snapshot in Prometheus text exposition format,
    /// for the out-of-scope admin surface to scrape.
    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|e| crate::error::IntelliExtractError::Validation(e.to_string()))?;
        Ok(String::from_utf8(buffer).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn checkpoint(relative_path: &str, status: Status, latency_ms: Option<i64>, status_code: Option<i32>, error: Option<&str>) -> Checkpoint {
        Checkpoint {
            run_id: "RUN-1".into(),
            relative_path: relative_path.into(),
            file_path: format!("/staging/{relative_path}"),
            brand: "acme".into(),
            purchaser: "retailx".into(),
            status,
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            latency_ms,
            status_code,
            error_message: error.map(|s| s.to_string()),
            pattern_key: None,
            full_response: None,
        }
    }

    #[test]
    fn counts_and_rates() {
        let records = vec![
            checkpoint("a.csv", Status::Done, Some(100), Some(200), None),
            checkpoint("b.csv", Status::Done, Some(200), Some(200), None),
            checkpoint("c.csv", Status::Error, Some(50), Some(500), Some("boom")),
            checkpoint("d.csv", Status::Skipped, None, None, None),
        ];
        let metrics = compute_metrics("RUN-1", &records, Utc::now(), Utc::now());
        assert_eq!(metrics.success, 2);
        assert_eq!(metrics.failed, 1);
        assert_eq!(metrics.skipped, 1);
        assert_eq!(metrics.processed, 3);
        assert_eq!(metrics.failure_breakdown.server_error, 1);
        assert!((metrics.error_rate - (1.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn empty_latencies_do_not_divide_by_zero() {
        let records = vec![checkpoint("a.csv", Status::Skipped, None, None, None)];
        let metrics = compute_metrics("RUN-1", &records, Utc::now(), Utc::now());
        assert_eq!(metrics.avg_latency_ms, 0.0);
        assert_eq!(metrics.throughput_per_second, 0.0);
    }

    #[test]
    fn timeout_classification() {
        let records = vec![checkpoint(
            "a.csv",
            Status::Error,
            Some(60000),
            Some(0),
            Some("connect ETIMEDOUT"),
        )];
        let metrics = compute_metrics("RUN-1", &records, Utc::now(), Utc::now());
        assert_eq!(metrics.failure_breakdown.timeout, 1);
    }
}
