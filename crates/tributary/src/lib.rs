//! Tributary - an incremental sync engine for cursor-paginated APIs.
//!
//! Resources pull objects from listing endpoints (full sync) or change events
//! from `/v1/events` (incremental sync). A [`Dispatcher`] routes every raw
//! record to the consumers subscribed to its kind, and consumers hand
//! normalized records to a [`Sink`]. The sink also stores the run context
//! that decides whether the next run is full or incremental.
//!
//! # Features
//!
//! - `http-client` (default) - [`HttpApiClient::with_reqwest`], a reqwest
//!   transport for the upstream API.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tributary::{ApiClientOptions, Dispatcher, Downloader, EventSource, HttpApiClient,
//!                 JsonlSink, StandardResource};
//!
//! let options = ApiClientOptions { secret, ..ApiClientOptions::default() };
//! let client = HttpApiClient::with_reqwest(options, DEFAULT_CALL_TIMEOUT)?;
//! let downloader = Downloader::new(Arc::new(client));
//! let sink = Arc::new(JsonlSink::create("out").await?);
//!
//! let mut dispatcher = Dispatcher::new(sink);
//! dispatcher.register(Arc::new(StandardResource::new(config, downloader, EventSource::Own)?));
//! let report = dispatcher.run().await;
//! dispatcher.close();
//! ```

pub mod api;
pub mod dedup;
pub mod download;
pub mod http;
pub mod rate_limit;
pub mod record;
pub mod resource;
pub mod retry;
pub mod sink;
pub mod sync;

pub use api::{ApiClient, ApiClientOptions, ApiError, HttpApiClient, ObjectList, Request};
pub use dedup::{DedupError, DedupStore, MemoryDedupStore, RedbDedupStore};
pub use download::{DownloadError, Downloader, PostProcessor, Task};
pub use rate_limit::ApiRateLimiter;
pub use record::Record;
pub use resource::{EventSource, FieldMapping, RelatedConfig, ResourceConfig, StandardResource};
pub use sink::{JsonlSink, MemorySink, OutputRecord, Sink, SinkError};
pub use sync::{
    CollectionError, Consumer, Dispatcher, ProducerOutput, Resource, ResourceBundle, RunContext,
    RunReport, SyncError,
};
