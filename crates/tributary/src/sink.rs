//! The downstream sink collaborator.
//!
//! A sink accepts normalized records keyed by collection and id, stores the
//! opaque run context between runs, and receives collection-level error
//! reports. Implementations must be safe for concurrent calls from many
//! consumer workers.

mod jsonl;
mod memory;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::record::Record;

pub use jsonl::JsonlSink;
pub use memory::MemorySink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write {collection}/{id}: {message}")]
    Write {
        collection: String,
        id: String,
        message: String,
    },

    #[error("run context storage failed: {0}")]
    Context(String),

    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A normalized record produced by a consumer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputRecord {
    pub collection: String,
    pub id: String,
    pub properties: Record,
}

impl OutputRecord {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, properties: Record) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            properties,
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Insert or replace the record `id` in `collection`.
    async fn upsert(&self, collection: &str, id: &str, properties: &Record) -> Result<(), SinkError>;

    /// The bytes stored by the previous run, if any.
    async fn load_run_context(&self) -> Result<Option<Vec<u8>>, SinkError>;

    async fn save_run_context(&self, context: &[u8]) -> Result<(), SinkError>;

    async fn report_collection_error(&self, message: &str, collection: &str) -> Result<(), SinkError>;
}
