//! Run context: when the previous run started.
//!
//! The context is stored by the sink as opaque JSON bytes:
//!
//! ```json
//! {"version": 1, "previous_run_timestamp": "2024-05-01T12:00:00Z"}
//! ```
//!
//! A context with a different version, no timestamp, or a timestamp older
//! than [`STALE_AFTER_DAYS`] is ignored and the run does a full sync.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::error::{Result, SyncError};
use crate::sink::{Sink, SinkError};

/// Schema version written by this engine.
pub const CONTEXT_VERSION: u32 = 1;

/// Contexts older than this force a full sync.
pub const STALE_AFTER_DAYS: i64 = 30;

/// Hours before the previous run at which incremental event downloads start.
pub const LOOKBACK_HOURS: i64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub previous_run_timestamp: Option<DateTime<Utc>>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::full()
    }
}

impl RunContext {
    /// A context that selects full sync.
    pub fn full() -> Self {
        Self {
            version: CONTEXT_VERSION,
            previous_run_timestamp: None,
        }
    }

    /// A context that selects incremental sync since `previous_run`.
    pub fn incremental(previous_run: DateTime<Utc>) -> Self {
        Self {
            version: CONTEXT_VERSION,
            previous_run_timestamp: Some(previous_run),
        }
    }

    pub fn is_incremental(&self) -> bool {
        self.previous_run_timestamp.is_some()
    }

    /// Lower bound for incremental event downloads.
    pub fn events_since(&self) -> Option<DateTime<Utc>> {
        self.previous_run_timestamp
            .map(|ts| ts - Duration::hours(LOOKBACK_HOURS))
    }

    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Apply the version and staleness rules as of `now`.
    #[must_use]
    pub fn validated(self, now: DateTime<Utc>) -> Self {
        if self.version != CONTEXT_VERSION {
            tracing::info!(
                found = self.version,
                expected = CONTEXT_VERSION,
                "run context version mismatch, doing a full sync"
            );
            return Self::full();
        }

        match self.previous_run_timestamp {
            None => {
                tracing::info!("run context has no timestamp, doing a full sync");
                Self::full()
            }
            Some(ts) if now - ts > Duration::days(STALE_AFTER_DAYS) => {
                tracing::info!(previous_run = %ts, "run context is stale, doing a full sync");
                Self::full()
            }
            Some(_) => self,
        }
    }
}

/// Load and validate the stored run context.
pub async fn load(sink: &dyn Sink, now: DateTime<Utc>) -> Result<RunContext> {
    let bytes = sink.load_run_context().await.map_err(SyncError::ContextLoad)?;
    let Some(bytes) = bytes.filter(|b| !b.is_empty()) else {
        tracing::info!("no previous run context, doing a full sync");
        return Ok(RunContext::full());
    };

    let context = RunContext::decode(&bytes).map_err(SyncError::ContextDecode)?;
    Ok(context.validated(now))
}

/// Store a context stamped with `started_at`.
pub async fn save(sink: &dyn Sink, started_at: DateTime<Utc>) -> Result<()> {
    let bytes = RunContext::incremental(started_at)
        .encode()
        .map_err(|e| SyncError::ContextSave(SinkError::Context(e.to_string())))?;
    sink.save_run_context(&bytes)
        .await
        .map_err(SyncError::ContextSave)
}
