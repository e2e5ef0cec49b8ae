use thiserror::Error;
use watchdock_store::StoreError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("image not present locally: {0}")]
    ImageMissing(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid image reference: {0}")]
    InvalidImage(String),
    #[error("pull of {0} failed")]
    PullFailed(String),
    #[error("engine api error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("engine transport error: {0}")]
    Transport(String),
}

impl EngineError {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("startup failed: {0}")]
    Startup(EngineError),
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error("task join failed: {0}")]
    Join(String),
}
