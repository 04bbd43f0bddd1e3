use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{IntelliExtractError, Result};
use crate::metrics::RunMetrics;

/// The seam the Workflow Coordinator calls through after computing a run's
/// metrics. HTML/CSS dashboard rendering and the admin HTTP surface that
/// would consume this are out of scope; only the interface is implemented here.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn submit(&self, run_id: &str, metrics: &RunMetrics) -> Result<()>;
}

pub struct JsonFileReportSink {
    report_dir: PathBuf,
}

impl JsonFileReportSink {
    pub fn new(report_dir: PathBuf) -> Self {
        Self { report_dir }
    }
}

#[async_trait]
impl ReportSink for JsonFileReportSink {
    async fn submit(&self, run_id: &str, metrics: &RunMetrics) -> Result<()> {
        tokio::fs::create_dir_all(&self.report_dir)
            .await
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Io(e)))?;
        let path = self.report_dir.join(format!("{run_id}.json"));
        let body = serde_json::to_vec_pretty(metrics)
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Encode(Box::new(e))))?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| IntelliExtractError::Store(sqlx::Error::Io(e)))?;
        Ok(())
    }
}

/// No-op sink for runs with no configured report directory.
pub struct NullReportSink;

#[async_trait]
impl ReportSink for NullReportSink {
    async fn submit(&self, _run_id: &str, _metrics: &RunMetrics) -> Result<()> {
        Ok(())
    }
}
