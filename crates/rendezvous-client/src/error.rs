// Error type returned by every client operation.
use rendezvous_store::StoreError;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(thiserror::Error, Debug)]
pub enum SyncError {
    /// A generic client was used outside a [`crate::with_run_params`] scope.
    #[error("no run parameters provided")]
    NoRunParameters,
    #[error("operation cancelled")]
    Cancelled,
    #[error("sync client is closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("encode payload: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("decode payload: {0}")]
    Decode(#[source] serde_json::Error),
}

impl SyncError {
    /// Errors that end an operation because the client or caller gave up.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SyncError::Cancelled | SyncError::Closed)
    }
}
