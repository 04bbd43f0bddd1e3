use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use backoff::ExponentialBackoff;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{IntelliExtractError, Result};

#[derive(Debug, Clone)]
pub struct ObjectSummary {
    pub key: String,
    pub size: i64,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub bytes_written: u64,
    pub etag: String,
}

#[derive(Debug, Clone)]
pub struct HeadResult {
    pub etag: String,
    pub size: i64,
}

/// List/get capability the Sync Engine needs. `list` paginates internally so
/// callers always see the full prefix in one call.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>>;
    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<DownloadOutcome>;
    async fn head_if_exists(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>>;
}

pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self {
            client: Client::new(&config),
        }
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStoreAdapter for S3ObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let list_once = || async {
                let mut req = self
                    .client
                    .list_objects_v2()
                    .bucket(bucket)
                    .prefix(prefix);
                if let Some(token) = continuation_token.clone() {
                    req = req.continuation_token(token);
                }
                req.send()
                    .await
                    .map_err(|e| backoff::Error::transient(e.into_service_error().to_string()))
            };

            let page = backoff::future::retry(ExponentialBackoff::default(), list_once)
                .await
                .map_err(IntelliExtractError::ObjectStore)?;

            for obj in page.contents() {
                let key = obj.key().unwrap_or_default().to_string();
                let size = obj.size().unwrap_or(0);
                let etag = obj.e_tag().unwrap_or_default().trim_matches('"').to_string();
                out.push(ObjectSummary { key, size, etag });
            }

            if page.is_truncated().unwrap_or(false) {
                continuation_token = page.next_continuation_token().map(|s| s.to_string());
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        debug!(bucket, prefix, count = out.len(), "listed objects");
        Ok(out)
    }

    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<DownloadOutcome> {
        let resp = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| IntelliExtractError::ObjectStore(e.into_service_error().to_string()))?;

        let etag = resp.e_tag().unwrap_or_default().trim_matches('"').to_string();
        let mut body = resp.body.into_async_read();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;

        let bytes_written = tokio::io::copy(&mut body, &mut file)
            .await
            .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;

        file.flush()
            .await
            .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;

        Ok(DownloadOutcome { bytes_written, etag })
    }

    async fn head_if_exists(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(resp) => Ok(Some(HeadResult {
                etag: resp.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                size: resp.content_length().unwrap_or(0),
            })),
            Err(e) => {
                let svc = e.into_service_error();
                if svc.is_not_found() {
                    Ok(None)
                } else {
                    warn!(bucket, key, error = %svc, "head_object failed");
                    Err(IntelliExtractError::ObjectStore(svc.to_string()))
                }
            }
        }
    }
}

/// MIME inference by extension, used when building the multipart upload.
pub fn infer_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
        Some(ref ext) if ext == "xlsx" => {
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        }
        Some(ref ext) if ext == "xls" => "application/vnd.ms-excel",
        Some(ref ext) if ext == "csv" => "text/csv",
        _ => "application/octet-stream",
    }
}

pub fn read_timeout() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone)]
struct MockObject {
    bytes: Vec<u8>,
    etag: String,
}

/// In-memory object store for integration tests: objects are registered with
/// `put`, `list`/`get`/`head_if_exists` serve them back, and `fail_gets_for`
/// lets a test simulate a download that errors out partway through a bucket.
#[derive(Default)]
pub struct MockObjectStore {
    objects: tokio::sync::Mutex<std::collections::HashMap<(String, String), MockObject>>,
    fail_gets: tokio::sync::Mutex<std::collections::HashSet<(String, String)>>,
}

impl MockObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, bucket: &str, key: &str, bytes: Vec<u8>, etag: &str) {
        self.objects.lock().await.insert(
            (bucket.to_string(), key.to_string()),
            MockObject {
                bytes,
                etag: etag.to_string(),
            },
        );
    }

    pub async fn fail_gets_for(&self, bucket: &str, key: &str) {
        self.fail_gets
            .lock()
            .await
            .insert((bucket.to_string(), key.to_string()));
    }
}

#[async_trait]
impl ObjectStoreAdapter for MockObjectStore {
    async fn list(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .iter()
            .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|((_, key), obj)| ObjectSummary {
                key: key.clone(),
                size: obj.bytes.len() as i64,
                etag: obj.etag.clone(),
            })
            .collect())
    }

    async fn get(&self, bucket: &str, key: &str, dest: &Path) -> Result<DownloadOutcome> {
        if self
            .fail_gets
            .lock()
            .await
            .contains(&(bucket.to_string(), key.to_string()))
        {
            return Err(IntelliExtractError::ObjectStore(format!(
                "simulated failure fetching {bucket}/{key}"
            )));
        }

        let objects = self.objects.lock().await;
        let object = objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| IntelliExtractError::ObjectStore(format!("no such object {bucket}/{key}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;
        }
        tokio::fs::write(dest, &object.bytes)
            .await
            .map_err(|e| IntelliExtractError::ObjectStore(e.to_string()))?;

        Ok(DownloadOutcome {
            bytes_written: object.bytes.len() as u64,
            etag: object.etag.clone(),
        })
    }

    async fn head_if_exists(&self, bucket: &str, key: &str) -> Result<Option<HeadResult>> {
        let objects = self.objects.lock().await;
        Ok(objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|obj| HeadResult {
                etag: obj.etag.clone(),
                size: obj.bytes.len() as i64,
            }))
    }
}
