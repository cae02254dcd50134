//! Sync orchestration.
//!
//! # Module Structure
//!
//! - [`types`] - `Resource` and `Consumer` traits, queue sizes, `CollectionError`
//! - [`context`] - `RunContext` load/validate/save
//! - [`routing`] - kind → subscription routing table
//! - [`incremental`] - the shared `/v1/events` task
//! - [`bundle`] - `ResourceBundle`
//! - [`dispatcher`] - `Dispatcher`, the run lifecycle
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use tributary::sink::MemorySink;
//! use tributary::sync::Dispatcher;
//!
//! let mut dispatcher = Dispatcher::new(Arc::new(MemorySink::new()));
//! dispatcher.register(customers);
//! let report = dispatcher.run().await;
//! dispatcher.close();
//! ```

mod bundle;
pub mod context;
mod dispatcher;
mod error;
pub mod incremental;
mod routing;
mod types;

pub use bundle::ResourceBundle;
pub use context::{CONTEXT_VERSION, LOOKBACK_HOURS, RunContext, STALE_AFTER_DAYS};
pub use dispatcher::Dispatcher;
pub use error::{Result, SyncError};
pub use incremental::{EVENTS_PATH, events_request, incremental_task};
pub use routing::{RoutingIndex, RoutingTable};
pub use types::{
    CollectionError, Consumer, DELIVERY_BUFFER_SIZE, MESSAGE_BUFFER_SIZE, ProducerOutput,
    RECORD_BUFFER_SIZE, Resource, RunReport,
};
