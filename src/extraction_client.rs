use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::multipart;

use crate::config::ExtractionAuth;
use crate::error::{IntelliExtractError, Result};
use crate::object_store::infer_mime;

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub success: bool,
    pub status_code: i32,
    pub latency_ms: i64,
    pub pattern_key: Option<String>,
    pub error_message: Option<String>,
    pub full_response: Option<String>,
}

/// Single-file submission to the remote extraction API. Implementations
/// distinguish a connection-level failure (DNS/refused/dropped socket) by
/// returning `Err(IntelliExtractError::NetworkAbort(..))` rather than an
/// `Ok(ExtractionResult { success: false, .. })`, so the engine can tell
/// "this one file failed" apart from "the API is unreachable".
#[async_trait]
pub trait ExtractionClient: Send + Sync {
    async fn extract(&self, file_path: &Path, brand: &str, purchaser: &str) -> Result<ExtractionResult>;
}

pub struct HttpExtractionClient {
    client: reqwest::Client,
    base_url: String,
    auth: ExtractionAuth,
}

impl HttpExtractionClient {
    pub fn new(base_url: String, auth: ExtractionAuth, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| IntelliExtractError::Config(e.to_string()))?;
        Ok(Self {
            client,
            base_url,
            auth,
        })
    }
}

#[async_trait]
impl ExtractionClient for HttpExtractionClient {
    async fn extract(&self, file_path: &Path, _brand: &str, _purchaser: &str) -> Result<ExtractionResult> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|e| IntelliExtractError::ExtractionHttp(format!("read file: {e}")))?;

        let file_name = file_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let mime = infer_mime(file_path);

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| IntelliExtractError::ExtractionHttp(e.to_string()))?;

        let form = multipart::Form::new()
            .part("file", part)
            .text("pattern_key", "")
            .text("request_metadata", "");

        let url = format!("{}/api/v1/spreadsheet/extract/upload", self.base_url);
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .header("X-Access-Key", &self.auth.access_key)
            .header("X-Secret-Message", &self.auth.secret_message)
            .header("X-Signature", &self.auth.signature)
            .multipart(form)
            .send()
            .await;

        let latency_ms = started.elapsed().as_millis() as i64;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                if e.is_connect() || e.is_timeout() || e.is_request() {
                    return Err(IntelliExtractError::NetworkAbort(e.to_string()));
                }
                return Ok(ExtractionResult {
                    success: false,
                    status_code: 0,
                    latency_ms,
                    pattern_key: None,
                    error_message: Some(e.to_string()),
                    full_response: None,
                });
            }
        };

        let status_code = response.status().as_u16() as i32;
        let body_text = response.text().await.unwrap_or_default();

        if (200..300).contains(&status_code) {
            let pattern_key = serde_json::from_str::<serde_json::Value>(&body_text)
                .ok()
                .and_then(|v| v.get("pattern_key").and_then(|p| p.as_str()).map(|s| s.to_string()));
            Ok(ExtractionResult {
                success: true,
                status_code,
                latency_ms,
                pattern_key,
                error_message: None,
                full_response: Some(body_text),
            })
        } else {
            Ok(ExtractionResult {
                success: false,
                status_code,
                latency_ms,
                pattern_key: None,
                error_message: Some(format!("HTTP {status_code}: {body_text}")),
                full_response: Some(body_text),
            })
        }
    }
}

/// Deterministic synthetic client for integration tests and local dev
/// (`ENTELLIEXTRACT_USE_MOCK=1`): always succeeds, never touches the network.
pub struct MockExtractionClient {
    pub latency_ms: i64,
}

impl Default for MockExtractionClient {
    fn default() -> Self {
        Self { latency_ms: 5 }
    }
}

#[async_trait]
impl ExtractionClient for MockExtractionClient {
    async fn extract(&self, file_path: &Path, _brand: &str, _purchaser: &str) -> Result<ExtractionResult> {
        tokio::time::sleep(Duration::from_millis(self.latency_ms as u64)).await;
        Ok(ExtractionResult {
            success: true,
            status_code: 200,
            latency_ms: self.latency_ms,
            pattern_key: Some("mock-pattern".into()),
            error_message: None,
            full_response: Some(format!(
                "{{\"mock\":true,\"file\":\"{}\"}}",
                file_path.display()
            )),
        })
    }
}
