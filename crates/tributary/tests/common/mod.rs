//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tributary::{
    ApiClient, ApiError, Consumer, ObjectList, OutputRecord, PostProcessor, ProducerOutput,
    Record, Request, Resource, RunContext,
};

/// Maximum time a run should take in tests.
/// If exceeded, there's likely a hang/deadlock.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(10);

pub fn record(value: Value) -> Record {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// A previous run one day ago, as stored bytes.
pub fn recent_context() -> (DateTime<Utc>, Vec<u8>) {
    let previous = Utc::now() - chrono::Duration::days(1);
    let bytes = RunContext::incremental(previous).encode().expect("encode context");
    (previous, bytes)
}

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
        .single()
        .expect("valid date")
}

/// An API client that serves scripted pages per path, in FIFO order.
#[derive(Default)]
pub struct ScriptedClient {
    pages: Mutex<HashMap<String, VecDeque<Result<ObjectList, ApiError>>>>,
    requests: Mutex<Vec<Request>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page(self, path: &str, items: Vec<Value>, has_more: bool) -> Self {
        let items = items.into_iter().map(record).collect();
        self.respond(path, Ok(ObjectList { items, has_more }))
    }

    pub fn fail(self, path: &str, status: u16) -> Self {
        self.respond(path, Err(ApiError::from_status(status, b"")))
    }

    fn respond(self, path: &str, response: Result<ObjectList, ApiError>) -> Self {
        self.pages
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|r| r.path == path)
            .collect()
    }
}

#[async_trait]
impl ApiClient for ScriptedClient {
    async fn fetch_list(&self, request: &Request) -> Result<ObjectList, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        self.pages
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(ObjectList::default()))
    }

    async fn fetch_one(&self, request: &Request) -> Result<Record, ApiError> {
        Err(ApiError::from_status(404, request.path.as_bytes()))
    }
}

/// A resource whose producer emits a fixed list of records.
pub struct FixedResource {
    pub name: String,
    pub records: Vec<Record>,
    pub consumers: Vec<Arc<dyn Consumer>>,
    pub fail: bool,
    pub started: Mutex<Vec<bool>>,
}

impl FixedResource {
    pub fn new(name: &str, records: Vec<Value>, consumers: Vec<Arc<dyn Consumer>>) -> Self {
        Self {
            name: name.to_string(),
            records: records.into_iter().map(record).collect(),
            consumers,
            fail: false,
            started: Mutex::new(Vec::new()),
        }
    }

    /// The incremental flag of every producer start.
    pub fn starts(&self) -> Vec<bool> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl Resource for FixedResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.consumers.clone()
    }

    fn event_processors(&self) -> Vec<Arc<dyn PostProcessor>> {
        Vec::new()
    }

    async fn start_producer(
        &self,
        run_context: &RunContext,
        output: ProducerOutput,
    ) -> tributary::sync::Result<()> {
        self.started
            .lock()
            .unwrap()
            .push(run_context.is_incremental());
        for record in &self.records {
            if output.records.send(record.clone()).await.is_err() {
                return Ok(());
            }
        }
        if self.fail {
            output.report(self.name.as_str(), "producer gave up");
            let rejected = ApiError::from_status(400, b"");
            return Err(tributary::DownloadError::Api(rejected).into());
        }
        Ok(())
    }

    fn close(&self) {}
}

/// A consumer that emits `{id, collection}` for every routed record.
pub struct EchoConsumer {
    pub collection: String,
    pub objects: Vec<String>,
    pub events: Vec<String>,
}

impl EchoConsumer {
    pub fn objects(collection: &str, kinds: &[&str]) -> Self {
        Self {
            collection: collection.to_string(),
            objects: kinds.iter().map(|k| k.to_string()).collect(),
            events: Vec::new(),
        }
    }
}

#[async_trait]
impl Consumer for EchoConsumer {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn desired_objects(&self) -> &[String] {
        &self.objects
    }

    fn desired_events(&self) -> &[String] {
        &self.events
    }

    async fn start_consumer(
        &self,
        mut input: mpsc::Receiver<Arc<Record>>,
        output: mpsc::Sender<OutputRecord>,
    ) -> tributary::sync::Result<()> {
        while let Some(record) = input.recv().await {
            let Some(id) = record.get("id").and_then(Value::as_str) else {
                continue;
            };
            let mut properties = Record::new();
            properties.insert("id".to_string(), Value::String(id.to_string()));
            properties.insert(
                "collection".to_string(),
                Value::String(self.collection.clone()),
            );
            if output
                .send(OutputRecord::new(self.collection.as_str(), id, properties))
                .await
                .is_err()
            {
                break;
            }
        }
        Ok(())
    }
}
