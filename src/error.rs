use thiserror::Error;

/// Tagged error kinds surfaced across the pipeline. Per-file failures inside
/// the sync and extraction engines are captured and recorded rather than
/// propagated; only engine-fatal conditions escape as one of these.
#[derive(Debug, Error)]
pub enum IntelliExtractError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("record store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("extraction API error: {0}")]
    ExtractionHttp(String),

    #[error("network unreachable: {0}")]
    NetworkAbort(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl IntelliExtractError {
    pub fn is_network_abort(&self) -> bool {
        matches!(self, IntelliExtractError::NetworkAbort(_))
    }
}

pub type Result<T> = std::result::Result<T, IntelliExtractError>;
