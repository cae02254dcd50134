//! A resource described entirely by configuration.
//!
//! A full sync pages through the resource's listing endpoint. An incremental
//! sync downloads the resource's change events, either itself or through the
//! bundle it belongs to. Its single consumer maps objects of the resource's
//! kind, and event payloads of that kind, through a [`FieldMapping`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::mapping::FieldMapping;
use crate::api::Request;
use crate::dedup::{DedupError, DedupStore, MemoryDedupStore, RedbDedupStore};
use crate::download::{
    DeletionTagger, Downloader, ListExpander, PAGE_LIMIT, PostProcessor, RelatedRecords, Task,
};
use crate::record::{self, Record};
use crate::sink::OutputRecord;
use crate::sync::{
    Consumer, ProducerOutput, Resource, Result, RunContext, SyncError, incremental_task,
};

/// One `[[resources]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceConfig {
    /// Resource and output collection name.
    pub name: String,
    /// Object kind (`object` discriminator) this resource maps.
    pub kind: String,
    /// Listing endpoint for full syncs.
    pub path: String,
    /// Extra query parameters for full syncs.
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    /// Event types delivered to the consumer on incremental runs.
    #[serde(default)]
    pub event_types: Vec<String>,
    /// Event types whose payloads are tagged as deleted.
    #[serde(default)]
    pub deletion_events: Vec<String>,
    /// Nested lists to page out completely, e.g. `sources`.
    #[serde(default)]
    pub expand: Vec<String>,
    #[serde(default)]
    pub mapping: FieldMapping,
    /// Resources naming the same bundle share one event download.
    #[serde(default)]
    pub bundle: Option<String>,
    /// Listings downloaded once per object of this resource.
    #[serde(default)]
    pub related: Vec<RelatedConfig>,
}

/// A related listing filtered by the parent's id, e.g. the balance
/// transactions of a transfer.
///
/// ```toml
/// [[resources.related]]
/// path = "/v1/balance/history"
/// filter_param = "transfer"
/// parent_key = "transfer_id"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelatedConfig {
    /// Listing endpoint of the related records.
    pub path: String,
    /// Query parameter that carries the parent id.
    pub filter_param: String,
    /// Key set to the parent id on every related record.
    pub parent_key: String,
    /// Parent object kind, the resource's own kind when absent.
    #[serde(default)]
    pub parent_kind: Option<String>,
}

/// Who downloads a resource's events on incremental runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSource {
    /// The resource runs its own `/v1/events` task.
    Own,
    /// A [`ResourceBundle`](crate::sync::ResourceBundle) downloads them.
    Bundle,
}

pub struct StandardResource {
    config: ResourceConfig,
    events: EventSource,
    downloader: Downloader,
    dedup: Arc<dyn DedupStore>,
    // Parents whose related listings were already downloaded from events.
    related_dedup: Arc<dyn DedupStore>,
    consumer: Arc<StandardConsumer>,
}

impl StandardResource {
    /// Build a resource with on-disk dedup stores.
    pub fn new(
        config: ResourceConfig,
        downloader: Downloader,
        events: EventSource,
    ) -> std::result::Result<Self, DedupError> {
        let dedup: Arc<dyn DedupStore> = Arc::new(RedbDedupStore::open()?);
        let related_dedup: Arc<dyn DedupStore> = if config.related.is_empty() {
            Arc::new(MemoryDedupStore::new())
        } else {
            Arc::new(RedbDedupStore::open()?)
        };
        Ok(Self::with_dedup(config, downloader, events, dedup).with_related_dedup(related_dedup))
    }

    pub fn with_dedup(
        config: ResourceConfig,
        downloader: Downloader,
        events: EventSource,
        dedup: Arc<dyn DedupStore>,
    ) -> Self {
        let consumer = Arc::new(StandardConsumer::new(&config, Arc::clone(&dedup)));
        Self {
            config,
            events,
            downloader,
            dedup,
            related_dedup: Arc::new(MemoryDedupStore::new()),
            consumer,
        }
    }

    /// Use `store` to skip event parents whose related records were already
    /// downloaded. It is never shared with the consumer's store.
    #[must_use]
    pub fn with_related_dedup(mut self, store: Arc<dyn DedupStore>) -> Self {
        self.related_dedup = store;
        self
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    fn related(&self) -> impl Iterator<Item = RelatedRecords> + '_ {
        self.config.related.iter().map(move |related| {
            RelatedRecords::new(
                self.downloader.clone(),
                related.parent_kind.as_deref().unwrap_or(&self.config.kind),
                related.path.as_str(),
                related.filter_param.as_str(),
                related.parent_key.as_str(),
            )
        })
    }

    fn full_sync_task(&self, output: &ProducerOutput) -> Task {
        let mut request = Request::new(self.config.path.as_str())
            .with_query("limit", PAGE_LIMIT)
            .with_log_collection(self.config.name.as_str());
        for (key, value) in &self.config.query {
            request.set(key.as_str(), value.as_str());
        }

        let mut processors: Vec<Arc<dyn PostProcessor>> = self
            .config
            .expand
            .iter()
            .map(|path| Arc::new(ListExpander::new(path, self.downloader.clone())) as Arc<dyn PostProcessor>)
            .collect();
        for related in self.related() {
            processors.push(Arc::new(related));
        }

        Task::new(request, output.records.clone())
            .with_collection(self.config.name.as_str(), output.errors.clone())
            .with_post_processors(processors)
    }
}

#[async_trait]
impl Resource for StandardResource {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        vec![Arc::clone(&self.consumer) as Arc<dyn Consumer>]
    }

    fn event_processors(&self) -> Vec<Arc<dyn PostProcessor>> {
        let mut processors: Vec<Arc<dyn PostProcessor>> = Vec::new();
        if !self.config.deletion_events.is_empty() {
            processors.push(Arc::new(DeletionTagger::new(
                self.config.deletion_events.iter().cloned(),
            )));
        }
        for path in &self.config.expand {
            processors.push(Arc::new(ListExpander::new(
                &format!("data.object.{path}"),
                self.downloader.clone(),
            )));
        }
        for related in self.related() {
            processors.push(Arc::new(related.from_events(Arc::clone(&self.related_dedup))));
        }
        processors
    }

    #[tracing::instrument(skip_all, fields(resource = %self.config.name))]
    async fn start_producer(&self, run_context: &RunContext, output: ProducerOutput) -> Result<()> {
        let task = if run_context.is_incremental() {
            if self.events == EventSource::Bundle {
                tracing::debug!("events are downloaded by the bundle");
                return Ok(());
            }
            match incremental_task(self, run_context, &output) {
                Some(task) => task.with_collection(self.config.name.as_str(), output.errors.clone()),
                None => return Ok(()),
            }
        } else {
            self.full_sync_task(&output)
        };
        drop(output);

        let emitted = self.downloader.run(&task).await?;
        tracing::info!(emitted, incremental = run_context.is_incremental(), "producer finished");
        Ok(())
    }

    fn close(&self) {
        self.dedup.close();
        self.related_dedup.close();
    }
}

/// Maps one kind of object into the resource's collection.
pub struct StandardConsumer {
    collection: String,
    kind: String,
    objects: Vec<String>,
    events: Vec<String>,
    mapping: FieldMapping,
    dedup: Arc<dyn DedupStore>,
}

impl StandardConsumer {
    pub fn new(config: &ResourceConfig, dedup: Arc<dyn DedupStore>) -> Self {
        let mut events = config.event_types.clone();
        for event_type in &config.deletion_events {
            if !events.contains(event_type) {
                events.push(event_type.clone());
            }
        }

        Self {
            collection: config.name.clone(),
            kind: config.kind.clone(),
            objects: vec![config.kind.clone()],
            events,
            mapping: config.mapping.clone(),
            dedup,
        }
    }

    /// The object to map out of `record` and whether it came from an event.
    fn subject<'a>(&self, record: &'a Record) -> Option<(&'a Record, bool)> {
        if record::is_event(record) {
            record::event_payload(record, &[self.kind.as_str()]).map(|payload| (payload, true))
        } else if record::kind(record) == Some(self.kind.as_str()) {
            Some((record, false))
        } else {
            None
        }
    }
}

#[async_trait]
impl Consumer for StandardConsumer {
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
    ) -> Result<()> {
        let mut emitted = 0usize;
        let mut suppressed = 0usize;

        while let Some(record) = input.recv().await {
            let Some((object, from_event)) = self.subject(&record) else {
                continue;
            };
            let Some((id, properties)) = self.mapping.apply(object) else {
                continue;
            };
            if from_event && self.dedup.seen_before(&id).await? {
                suppressed += 1;
                continue;
            }

            output
                .send(OutputRecord::new(self.collection.as_str(), id, properties))
                .await
                .map_err(|_| SyncError::Consumer {
                    collection: self.collection.clone(),
                    message: "output queue closed".to_string(),
                })?;
            emitted += 1;
        }

        tracing::debug!(collection = %self.collection, emitted, suppressed, "consumer finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::MemoryDedupStore;
    use serde_json::json;

    fn config() -> ResourceConfig {
        ResourceConfig {
            name: "customers".into(),
            kind: "customer".into(),
            path: "/v1/customers".into(),
            query: BTreeMap::new(),
            event_types: vec!["customer.created".into(), "customer.updated".into()],
            deletion_events: vec!["customer.deleted".into()],
            expand: vec!["sources".into()],
            mapping: FieldMapping {
                fields: vec!["email".into()],
                ..FieldMapping::default()
            },
            bundle: None,
            related: Vec::new(),
        }
    }

    fn record(value: serde_json::Value) -> Arc<Record> {
        Arc::new(value.as_object().cloned().expect("object"))
    }

    #[test]
    fn consumer_subscribes_to_kind_and_all_event_types() {
        let consumer = StandardConsumer::new(&config(), Arc::new(MemoryDedupStore::new()));

        assert_eq!(consumer.collection(), "customers");
        assert_eq!(consumer.desired_objects(), ["customer".to_string()]);
        assert_eq!(
            consumer.desired_events(),
            ["customer.created", "customer.updated", "customer.deleted"].map(String::from)
        );
    }

    #[tokio::test]
    async fn consumer_dedups_event_payloads_but_not_full_sync_objects() {
        let consumer = StandardConsumer::new(&config(), Arc::new(MemoryDedupStore::new()));
        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let inputs = [
            json!({"id": "cus_1", "object": "customer", "email": "a@example.com"}),
            json!({"id": "cus_1", "object": "customer", "email": "a@example.com"}),
            json!({"object": "event", "type": "customer.updated",
                   "data": {"object": {"id": "cus_2", "object": "customer", "email": "new@example.com"}}}),
            json!({"object": "event", "type": "customer.created",
                   "data": {"object": {"id": "cus_2", "object": "customer", "email": "old@example.com"}}}),
            json!({"object": "event", "type": "customer.updated",
                   "data": {"object": {"id": "ch_1", "object": "charge"}}}),
            json!({"id": "ch_2", "object": "charge"}),
        ];
        for input in inputs {
            in_tx.send(record(input)).await.expect("send");
        }
        drop(in_tx);

        consumer.start_consumer(in_rx, out_tx).await.expect("consume");

        let mut outputs = Vec::new();
        while let Some(out) = out_rx.recv().await {
            outputs.push((out.id, out.properties.get("email").cloned()));
        }
        assert_eq!(
            outputs,
            vec![
                ("cus_1".to_string(), Some(json!("a@example.com"))),
                ("cus_1".to_string(), Some(json!("a@example.com"))),
                ("cus_2".to_string(), Some(json!("new@example.com"))),
            ]
        );
    }

    #[tokio::test]
    async fn closed_dedup_store_fails_the_consumer() {
        let dedup = Arc::new(MemoryDedupStore::new());
        dedup.close();
        let consumer = StandardConsumer::new(&config(), dedup);
        let (in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);

        in_tx
            .send(record(json!({"object": "event", "type": "customer.updated",
                                "data": {"object": {"id": "cus_1", "object": "customer"}}})))
            .await
            .expect("send");
        drop(in_tx);

        let err = consumer.start_consumer(in_rx, out_tx).await.expect_err("dedup closed");
        assert!(matches!(err, SyncError::Dedup(DedupError::Closed)));
    }

    #[test]
    fn event_processors_tag_deletions_and_expand_payload_lists() {
        let downloader = Downloader::new(Arc::new(crate::download::testing::ScriptedClient::default()));
        let resource = StandardResource::with_dedup(
            config(),
            downloader,
            EventSource::Own,
            Arc::new(MemoryDedupStore::new()),
        );

        let names: Vec<String> = resource
            .event_processors()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["deletion-tagger", "list-expander"]);
    }

    #[test]
    fn config_deserializes_with_defaults() {
        let config: ResourceConfig = serde_json::from_value(json!({
            "name": "charges",
            "kind": "charge",
            "path": "/v1/charges"
        }))
        .expect("config");

        assert!(config.event_types.is_empty());
        assert_eq!(config.mapping, FieldMapping::default());
        assert_eq!(config.bundle, None);
        assert!(config.related.is_empty());
    }

    fn transfer_config() -> ResourceConfig {
        serde_json::from_value(json!({
            "name": "transfers",
            "kind": "transfer",
            "path": "/v1/transfers",
            "related": [{
                "path": "/v1/balance/history",
                "filter_param": "transfer",
                "parent_key": "transfer_id"
            }]
        }))
        .expect("config")
    }

    #[test]
    fn related_listings_run_after_expansion_and_on_events() {
        let downloader = Downloader::new(Arc::new(crate::download::testing::ScriptedClient::default()));
        let mut config = transfer_config();
        config.expand = vec!["reversals".into()];
        let resource = StandardResource::with_dedup(
            config,
            downloader,
            EventSource::Bundle,
            Arc::new(MemoryDedupStore::new()),
        );

        let (records_tx, _records_rx) = mpsc::channel(1);
        let (errors_tx, _errors_rx) = mpsc::unbounded_channel();
        let task = resource.full_sync_task(&ProducerOutput::new(records_tx, errors_tx));
        let names = |processors: &[Arc<dyn PostProcessor>]| -> Vec<String> {
            processors.iter().map(|p| p.name().to_string()).collect()
        };

        assert_eq!(names(&task.post_processors), vec!["list-expander", "related-records"]);
        assert_eq!(
            names(&resource.event_processors()),
            vec!["list-expander", "related-records"]
        );
    }

    #[tokio::test]
    async fn close_releases_the_related_store_separately() {
        let downloader = Downloader::new(Arc::new(crate::download::testing::ScriptedClient::default()));
        let consumer_store = Arc::new(MemoryDedupStore::new());
        let related_store = Arc::new(MemoryDedupStore::new());
        let resource = StandardResource::with_dedup(
            transfer_config(),
            downloader,
            EventSource::Own,
            consumer_store.clone(),
        )
        .with_related_dedup(related_store.clone());

        assert!(!related_store.seen_before("tr_1").await.expect("open"));
        assert!(!consumer_store.seen_before("tr_1").await.expect("independent"));

        resource.close();
        assert!(matches!(related_store.seen_before("tr_2").await, Err(DedupError::Closed)));
        assert!(matches!(consumer_store.seen_before("tr_2").await, Err(DedupError::Closed)));
    }
}
