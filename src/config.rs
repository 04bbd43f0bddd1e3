use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{IntelliExtractError, Result};

/// One configured bucket slice: a tenant/purchaser pair mapped onto a remote
/// bucket + prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub bucket: String,
    #[serde(default)]
    pub prefix: String,
    pub tenant: String,
    pub purchaser: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionAuth {
    pub access_key: String,
    pub secret_message: String,
    pub signature: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Where the embedded record store database lives.
    pub checkpoint_path: PathBuf,
    /// Local root under which synced files are mirrored as `<tenant>/<purchaser>/<file>`.
    pub staging_dir: PathBuf,
    /// Base URL of the extraction API, e.g. `https://api.example.com`.
    pub extraction_base_url: String,
    pub auth: ExtractionAuth,
    pub buckets: Vec<BucketConfig>,

    #[serde(default = "default_concurrency")]
    pub extraction_concurrency: usize,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default = "default_sync_concurrency")]
    pub sync_concurrency: usize,
    #[serde(default)]
    pub download_budget: Option<usize>,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    #[serde(default)]
    pub use_mock_extraction: bool,
}

fn default_concurrency() -> usize {
    5
}

fn default_sync_concurrency() -> usize {
    10
}

fn default_timeout_secs() -> u64 {
    60
}

impl Config {
    /// Assembles configuration from (in increasing precedence) an optional
    /// file at `CONFIG_PATH` and `ENTELLIEXTRACT_*` / `S3_TENANT_PURCHASERS`
    /// environment variables. This is the only place in the crate that reads
    /// `std::env` directly — engines receive an already-built `Config`.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Ok(path) = std::env::var("CONFIG_PATH") {
            builder = builder.add_source(config::File::with_name(&path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ENTELLIEXTRACT")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder
            .build()
            .map_err(|e| IntelliExtractError::Config(e.to_string()))?;

        let mut cfg: Config = raw
            .try_deserialize()
            .map_err(|e| IntelliExtractError::Config(e.to_string()))?;

        if let Ok(key) = std::env::var("ENTELLIEXTRACT_ACCESS_KEY") {
            cfg.auth.access_key = key;
        }
        if let Ok(secret) = std::env::var("ENTELLIEXTRACT_SECRET_MESSAGE") {
            cfg.auth.secret_message = secret;
        }
        if let Ok(sig) = std::env::var("ENTELLIEXTRACT_SIGNATURE") {
            cfg.auth.signature = sig;
        }
        if std::env::var("ENTELLIEXTRACT_USE_MOCK").as_deref() == Ok("1") {
            cfg.use_mock_extraction = true;
        }
        if let Ok(pairs_json) = std::env::var("S3_TENANT_PURCHASERS") {
            cfg.buckets = parse_tenant_purchasers(&pairs_json, &cfg.buckets)?;
        }

        if cfg.extraction_base_url.is_empty() {
            return Err(IntelliExtractError::Config(
                "extraction_base_url must be set".into(),
            ));
        }

        Ok(cfg)
    }
}

/// `S3_TENANT_PURCHASERS` is `{brand: [purchaser, ...]}`; each pair is matched
/// against `buckets` already loaded from file to pick up its `bucket`/`prefix`,
/// falling back to `<tenant>/<purchaser>` conventions when no file entry exists.
fn parse_tenant_purchasers(
    raw: &str,
    existing: &[BucketConfig],
) -> Result<Vec<BucketConfig>> {
    let parsed: std::collections::HashMap<String, Vec<String>> = serde_json::from_str(raw)
        .map_err(|e| IntelliExtractError::Config(format!("S3_TENANT_PURCHASERS: {e}")))?;

    let mut out = Vec::new();
    for (tenant, purchasers) in parsed {
        for purchaser in purchasers {
            if let Some(found) = existing
                .iter()
                .find(|b| b.tenant == tenant && b.purchaser == purchaser)
            {
                out.push(found.clone());
            } else {
                out.push(BucketConfig {
                    bucket: tenant.clone(),
                    prefix: format!("{tenant}/{purchaser}/"),
                    tenant: tenant.clone(),
                    purchaser,
                });
            }
        }
    }
    Ok(out)
}
