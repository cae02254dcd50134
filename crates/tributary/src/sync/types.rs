//! Resource, consumer and routing-side types.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use super::context::RunContext;
use super::error::Result;
use crate::download::PostProcessor;
use crate::record::Record;
use crate::sink::OutputRecord;

/// Capacity of each resource's raw record queue.
pub const RECORD_BUFFER_SIZE: usize = 1000;

/// Capacity of each subscription's delivery queue.
pub const DELIVERY_BUFFER_SIZE: usize = 1000;

/// Capacity of each consumer's output queue toward the sink.
pub const MESSAGE_BUFFER_SIZE: usize = 100;

/// A non-fatal failure attributed to one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    pub collection: String,
    pub message: String,
}

impl CollectionError {
    pub fn new(collection: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            message: message.into(),
        }
    }
}

/// Where a producer sends raw records and collection errors.
///
/// Cloning hands out another sender on the same queues. The queues close once
/// every clone is dropped.
#[derive(Debug, Clone)]
pub struct ProducerOutput {
    pub records: mpsc::Sender<Record>,
    pub errors: mpsc::UnboundedSender<CollectionError>,
}

impl ProducerOutput {
    pub fn new(
        records: mpsc::Sender<Record>,
        errors: mpsc::UnboundedSender<CollectionError>,
    ) -> Self {
        Self { records, errors }
    }

    /// Report a collection error. A closed error queue is ignored.
    pub fn report(&self, collection: impl Into<String>, message: impl Into<String>) {
        let _ = self.errors.send(CollectionError::new(collection, message));
    }
}

/// Transforms routed records into normalized output.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Output collection, also used for error attribution.
    fn collection(&self) -> &str;

    /// Object kinds routed to this consumer.
    fn desired_objects(&self) -> &[String];

    /// Event types routed to this consumer.
    fn desired_events(&self) -> &[String];

    /// Transform every record from `input` until it closes.
    ///
    /// Records are shared with other subscribers; clone before editing.
    async fn start_consumer(
        &self,
        input: mpsc::Receiver<Arc<Record>>,
        output: mpsc::Sender<OutputRecord>,
    ) -> Result<()>;
}

/// A named unit of synchronization.
#[async_trait]
pub trait Resource: Send + Sync {
    fn name(&self) -> &str;

    fn consumers(&self) -> Vec<Arc<dyn Consumer>>;

    /// Post-processors applied to events downloaded on this resource's
    /// behalf.
    fn event_processors(&self) -> Vec<Arc<dyn PostProcessor>>;

    /// Emit this run's raw records. Returning drops `output`.
    async fn start_producer(&self, run_context: &RunContext, output: ProducerOutput) -> Result<()>;

    /// Release run-scoped state such as dedup stores.
    fn close(&self);
}

/// Summary of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Start of the run; saved as the next run's previous timestamp.
    pub started_at: DateTime<Utc>,
    /// Whether producers ran their incremental branch.
    pub incremental: bool,
    /// Records written to the sink.
    pub upserted: usize,
    /// Registered resources.
    pub resources: usize,
}
