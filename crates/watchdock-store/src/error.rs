use thiserror::Error;
use watchdock_model::ValidationError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch failed: {0}")]
    Watch(String),

    #[error("kv request failed: {0}")]
    Kv(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(#[from] ValidationError),
}

impl From<notify::Error> for StoreError {
    fn from(e: notify::Error) -> Self {
        StoreError::Watch(e.to_string())
    }
}
