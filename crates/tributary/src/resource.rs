//! Configurable resources.
//!
//! - [`mapping`] - `FieldMapping`, a data-driven record transform
//! - [`standard`] - `StandardResource`, one listing endpoint plus its events

pub mod mapping;
pub mod standard;

pub use mapping::FieldMapping;
pub use standard::{EventSource, RelatedConfig, ResourceConfig, StandardConsumer, StandardResource};
