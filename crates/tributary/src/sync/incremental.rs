//! The incremental `/events` task shared by resources and bundles.

use std::collections::BTreeSet;

use super::context::RunContext;
use super::types::{ProducerOutput, Resource};
use crate::api::Request;
use crate::download::{PAGE_LIMIT, Task};

/// Listing endpoint of change events.
pub const EVENTS_PATH: &str = "/v1/events";

/// Build the request for events of `types` created after `since`.
///
/// Types are de-duplicated and sorted so one request covers every consumer.
pub fn events_request<'a>(
    types: impl IntoIterator<Item = &'a str>,
    since: chrono::DateTime<chrono::Utc>,
) -> Request {
    let types: BTreeSet<&str> = types.into_iter().collect();
    let mut request = Request::new(EVENTS_PATH)
        .with_query("limit", PAGE_LIMIT)
        .with_query("created[gt]", since.timestamp().to_string());
    for event_type in types {
        request.append("types[]", event_type);
    }
    request
}

/// The events task for `resource`, or `None` when the run is a full sync or
/// no consumer wants events.
pub fn incremental_task<R: Resource + ?Sized>(
    resource: &R,
    run_context: &RunContext,
    output: &ProducerOutput,
) -> Option<Task> {
    let since = run_context.events_since()?;
    let consumers = resource.consumers();
    let types: Vec<&str> = consumers
        .iter()
        .flat_map(|c| c.desired_events().iter().map(String::as_str))
        .collect();
    if types.is_empty() {
        return None;
    }

    let request = events_request(types, since).with_log_collection(resource.name());
    Some(Task::new(request, output.records.clone()).with_post_processors(resource.event_processors()))
}
