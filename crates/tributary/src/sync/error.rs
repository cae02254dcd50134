use thiserror::Error;

use crate::dedup::DedupError;
use crate::download::DownloadError;
use crate::sink::SinkError;

/// Errors raised while running a sync.
///
/// `ContextLoad`, `ContextDecode`, `ContextSave`, `Sink` and `Consumer` are
/// fatal: the run stops and no run context is written. The rest are
/// attributed to one resource and only decide the run's outcome.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to load run context: {0}")]
    ContextLoad(#[source] SinkError),

    #[error("failed to decode run context: {0}")]
    ContextDecode(#[source] serde_json::Error),

    #[error("failed to save run context: {0}")]
    ContextSave(#[source] SinkError),

    #[error("sink write failed: {0}")]
    Sink(#[source] SinkError),

    #[error("consumer for {collection} failed: {message}")]
    Consumer { collection: String, message: String },

    #[error(transparent)]
    Download(#[from] DownloadError),

    #[error(transparent)]
    Dedup(#[from] DedupError),

    #[error("{failures} bundle worker(s) failed")]
    BundleFailed { failures: usize },

    #[error(
        "sync run failed: {producer_failures} producer failure(s), {collection_errors} collection error(s)"
    )]
    RunFailed {
        producer_failures: usize,
        collection_errors: usize,
    },

    #[error("worker panicked: {0}")]
    WorkerPanic(String),
}

impl SyncError {
    /// Whether this error stops the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ContextLoad(_)
                | Self::ContextDecode(_)
                | Self::ContextSave(_)
                | Self::Sink(_)
                | Self::Consumer { .. }
                | Self::Dedup(_)
                | Self::WorkerPanic(_)
        )
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
