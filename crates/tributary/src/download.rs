//! Paginating downloader.
//!
//! A [`Task`] names the first page of a cursor-paginated listing, where its
//! items go, where failures are reported, and the post-processors each item
//! passes through. [`Downloader::run`] walks every page exactly once:
//!
//! ```text
//! request ──retry──▶ page ──post-processors──▶ output queue
//!    ▲                 │
//!    └─ starting_after ┘ (while has_more and a last id exists)
//! ```
//!
//! The first fetch or post-processor failure aborts the task. When the task
//! names a collection, that failure is also reported on the error queue.

mod processors;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::{ApiClient, ApiError, Request};
use crate::record::{self, Record};
use crate::retry::fetch_list_with_retry;
use crate::sync::CollectionError;

pub use processors::{DeletionTagger, ListExpander, RelatedRecords};

/// Page size requested from listing endpoints.
pub const PAGE_LIMIT: &str = "100";

/// Message reported when a page cannot be fetched.
pub const FETCH_FAILED_MESSAGE: &str = "HTTP request failed";

/// Errors that abort a download task.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("failed to fetch object list: {0}")]
    Api(#[from] ApiError),

    #[error("post-processor {processor} failed: {message}")]
    Processor { processor: String, message: String },

    #[error("download output closed before the task finished")]
    OutputClosed,
}

/// A function applied to each downloaded item before it is emitted.
///
/// Processors may edit the item in place and may push extra records to the
/// task output through [`Task::emit`].
#[async_trait]
pub trait PostProcessor: Send + Sync {
    /// Name used in logs and error messages.
    fn name(&self) -> &str;

    async fn process(&self, record: &mut Record, task: &Task) -> Result<(), DownloadError>;
}

/// A unit of download work.
pub struct Task {
    /// First page to fetch.
    pub request: Request,
    /// Receives every downloaded item.
    pub output: mpsc::Sender<Record>,
    /// Receives a collection error when the task fails.
    pub errors: Option<mpsc::UnboundedSender<CollectionError>>,
    /// Applied to every item, in order.
    pub post_processors: Vec<Arc<dyn PostProcessor>>,
    /// Collection failures are attributed to.
    pub collection: Option<String>,
}

impl Task {
    pub fn new(request: Request, output: mpsc::Sender<Record>) -> Self {
        Self {
            request,
            output,
            errors: None,
            post_processors: Vec::new(),
            collection: None,
        }
    }

    #[must_use]
    pub fn with_collection(
        mut self,
        collection: impl Into<String>,
        errors: mpsc::UnboundedSender<CollectionError>,
    ) -> Self {
        self.collection = Some(collection.into());
        self.errors = Some(errors);
        self
    }

    #[must_use]
    pub fn with_post_processors(mut self, processors: Vec<Arc<dyn PostProcessor>>) -> Self {
        self.post_processors = processors;
        self
    }

    /// Push a record to the task output.
    pub async fn emit(&self, record: Record) -> Result<(), DownloadError> {
        self.output
            .send(record)
            .await
            .map_err(|_| DownloadError::OutputClosed)
    }

    /// Report a collection error, if the task is attributed to a collection.
    pub fn report_error(&self, message: impl Into<String>) {
        if let (Some(collection), Some(errors)) = (&self.collection, &self.errors) {
            let _ = errors.send(CollectionError::new(collection.clone(), message));
        }
    }
}

/// Downloads every page of a task.
#[derive(Clone)]
pub struct Downloader {
    client: Arc<dyn ApiClient>,
}

impl Downloader {
    pub fn new(client: Arc<dyn ApiClient>) -> Self {
        Self { client }
    }

    /// The client this downloader fetches with.
    pub fn client(&self) -> &Arc<dyn ApiClient> {
        &self.client
    }

    /// Fetch all pages of `task`, returning the number of items emitted.
    #[tracing::instrument(skip_all, fields(collection = task.collection.as_deref().unwrap_or_default(), path = %task.request.path))]
    pub async fn run(&self, task: &Task) -> Result<usize, DownloadError> {
        let mut next = Some(task.request.clone());
        let mut page = 0u32;
        let mut emitted = 0usize;

        while let Some(request) = next.take() {
            page += 1;
            tracing::debug!(page, cursor = request.query_value(crate::api::CURSOR_PARAM), "fetching page");

            let list = match fetch_list_with_retry(self.client.as_ref(), &request).await {
                Ok(list) => list,
                Err(e) => {
                    task.report_error(FETCH_FAILED_MESSAGE);
                    return Err(e.into());
                }
            };

            let mut last_id: Option<String> = None;
            for mut item in list.items {
                for processor in &task.post_processors {
                    if let Err(e) = processor.process(&mut item, task).await {
                        tracing::warn!(processor = processor.name(), error = %e, "post-processor failed");
                        task.report_error(format!("post-processor {} failed", processor.name()));
                        return Err(DownloadError::Processor {
                            processor: processor.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                }

                if let Some(id) = record::get_str(&item, "id") {
                    last_id = Some(id.to_string());
                }
                task.emit(item).await?;
                emitted += 1;
            }

            if list.has_more {
                match last_id {
                    Some(id) => next = Some(request.next_page(&id)),
                    None => tracing::warn!(page, "more pages reported but no item carried an id"),
                }
            }
        }

        tracing::debug!(pages = page, emitted, "download complete");
        Ok(emitted)
    }
}

/// Run `task` while draining its output concurrently, returning what it emitted.
///
/// Used by post-processors that run nested downloads.
pub(crate) async fn collect(
    downloader: &Downloader,
    request: Request,
) -> (Result<usize, DownloadError>, Vec<Record>) {
    let (tx, mut rx) = mpsc::channel(64);
    let task = Task::new(request, tx);

    let fetch = async move { downloader.run(&task).await };
    let drain = async {
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        items
    };

    tokio::join!(fetch, drain)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted API client for download tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;
    use crate::api::ObjectList;

    /// Key a request by path and query, in order.
    pub fn request_key(request: &Request) -> String {
        let query: Vec<String> = request
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if query.is_empty() {
            request.path.clone()
        } else {
            format!("{}?{}", request.path, query.join("&"))
        }
    }

    #[derive(Default)]
    pub struct ScriptedClient {
        pages: Mutex<HashMap<String, VecDeque<Result<ObjectList, ApiError>>>>,
        pub requests: Mutex<Vec<Request>>,
    }

    impl ScriptedClient {
        pub fn page(self, key: &str, items: Vec<serde_json::Value>, has_more: bool) -> Self {
            let items = items
                .into_iter()
                .filter_map(|v| v.as_object().cloned())
                .collect();
            self.respond(key, Ok(ObjectList { items, has_more }))
        }

        pub fn respond(self, key: &str, response: Result<ObjectList, ApiError>) -> Self {
            self.pages
                .lock()
                .unwrap()
                .entry(key.to_string())
                .or_default()
                .push_back(response);
            self
        }

        pub fn request_keys(&self) -> Vec<String> {
            self.requests.lock().unwrap().iter().map(request_key).collect()
        }
    }

    #[async_trait]
    impl ApiClient for ScriptedClient {
        async fn fetch_list(&self, request: &Request) -> Result<ObjectList, ApiError> {
            self.requests.lock().unwrap().push(request.clone());
            let key = request_key(request);
            self.pages
                .lock()
                .unwrap()
                .get_mut(&key)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Err(ApiError::from_status(404, format!("no page for {key}").as_bytes())))
        }

        async fn fetch_one(&self, request: &Request) -> Result<Record, ApiError> {
            Err(ApiError::from_status(404, request.path.as_bytes()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedClient;
    use super::*;
    use serde_json::json;

    fn ids(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|r| record::get_str(r, "id"))
            .collect()
    }

    #[tokio::test]
    async fn walks_pages_with_starting_after_cursor() {
        let client = Arc::new(
            ScriptedClient::default()
                .page(
                    "/v1/widgets?limit=2",
                    vec![json!({"id": "a1", "object": "widget"}), json!({"id": "a2", "object": "widget"})],
                    true,
                )
                .page(
                    "/v1/widgets?limit=2&starting_after=a2",
                    vec![json!({"id": "a3", "object": "widget"}), json!({"id": "a4", "object": "widget"})],
                    true,
                )
                .page(
                    "/v1/widgets?limit=2&starting_after=a4",
                    vec![json!({"id": "a5", "object": "widget"})],
                    false,
                ),
        );
        let downloader = Downloader::new(client.clone());

        let (result, items) = collect(
            &downloader,
            Request::new("/v1/widgets").with_query("limit", "2"),
        )
        .await;

        assert_eq!(result.expect("download"), 5);
        assert_eq!(ids(&items), vec!["a1", "a2", "a3", "a4", "a5"]);
        assert_eq!(
            client.request_keys(),
            vec![
                "/v1/widgets?limit=2",
                "/v1/widgets?limit=2&starting_after=a2",
                "/v1/widgets?limit=2&starting_after=a4",
            ]
        );
    }

    #[tokio::test]
    async fn has_more_without_any_id_ends_pagination() {
        let client = Arc::new(ScriptedClient::default().page(
            "/v1/widgets",
            vec![json!({"object": "widget"})],
            true,
        ));
        let downloader = Downloader::new(client.clone());

        let (result, items) = collect(&downloader, Request::new("/v1/widgets")).await;

        assert_eq!(result.expect("download"), 1);
        assert_eq!(items.len(), 1);
        assert_eq!(client.request_keys().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_reports_one_collection_error_and_aborts() {
        let client = Arc::new(
            ScriptedClient::default()
                .page("/v1/widgets", vec![json!({"id": "a1", "object": "widget"})], true)
                .respond(
                    "/v1/widgets?starting_after=a1",
                    Err(ApiError::from_status(400, b"")),
                ),
        );
        let downloader = Downloader::new(client.clone());
        let (tx, mut rx) = mpsc::channel(10);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let task = Task::new(Request::new("/v1/widgets"), tx).with_collection("widgets", err_tx);
        let err = downloader.run(&task).await.expect_err("should abort");
        drop(task);

        assert!(matches!(err, DownloadError::Api(ref e) if e.is_permanent()));
        assert_eq!(rx.recv().await.and_then(|r| r.get("id").cloned()), Some(json!("a1")));
        assert!(rx.recv().await.is_none());

        let reported = err_rx.recv().await.expect("collection error");
        assert_eq!(reported.collection, "widgets");
        assert_eq!(reported.message, FETCH_FAILED_MESSAGE);
        assert!(err_rx.recv().await.is_none());
    }

    struct Failing;

    #[async_trait]
    impl PostProcessor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn process(&self, _record: &mut Record, _task: &Task) -> Result<(), DownloadError> {
            Err(DownloadError::OutputClosed)
        }
    }

    struct Stamp;

    #[async_trait]
    impl PostProcessor for Stamp {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn process(&self, record: &mut Record, _task: &Task) -> Result<(), DownloadError> {
            record.insert("stamped".to_string(), json!(true));
            Ok(())
        }
    }

    #[tokio::test]
    async fn post_processors_edit_items_in_order_before_emission() {
        let client = Arc::new(ScriptedClient::default().page(
            "/v1/widgets",
            vec![json!({"id": "a1", "object": "widget"})],
            false,
        ));
        let downloader = Downloader::new(client);
        let (tx, mut rx) = mpsc::channel(10);

        let task = Task::new(Request::new("/v1/widgets"), tx)
            .with_post_processors(vec![Arc::new(Stamp)]);
        downloader.run(&task).await.expect("download");

        let item = rx.recv().await.expect("item");
        assert!(record::get_bool(&item, "stamped"));
    }

    #[tokio::test]
    async fn post_processor_failure_aborts_and_reports() {
        let client = Arc::new(ScriptedClient::default().page(
            "/v1/widgets",
            vec![json!({"id": "a1", "object": "widget"})],
            false,
        ));
        let downloader = Downloader::new(client);
        let (tx, mut rx) = mpsc::channel(10);
        let (err_tx, mut err_rx) = mpsc::unbounded_channel();

        let task = Task::new(Request::new("/v1/widgets"), tx)
            .with_collection("widgets", err_tx)
            .with_post_processors(vec![Arc::new(Stamp), Arc::new(Failing)]);
        let err = downloader.run(&task).await.expect_err("processor failure");
        drop(task);

        assert!(matches!(err, DownloadError::Processor { ref processor, .. } if processor == "failing"));
        assert!(rx.recv().await.is_none());
        assert_eq!(err_rx.recv().await.map(|e| e.collection), Some("widgets".to_string()));
    }

    #[tokio::test]
    async fn closed_output_is_an_error() {
        let client = Arc::new(ScriptedClient::default().page(
            "/v1/widgets",
            vec![json!({"id": "a1", "object": "widget"})],
            false,
        ));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let err = Downloader::new(client)
            .run(&Task::new(Request::new("/v1/widgets"), tx))
            .await
            .expect_err("closed output");
        assert!(matches!(err, DownloadError::OutputClosed));
    }
}
