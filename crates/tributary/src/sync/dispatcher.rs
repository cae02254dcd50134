//! The dispatcher: one sync run from context load to context save.
//!
//! # Architecture
//!
//! ```text
//!                       ┌── router ──▶ delivery queue ──▶ consumer ──▶ sink worker ──▶ Sink
//! producer ──records──▶ │                 (per subscription)
//!          ──errors───▶ error forwarder ──▶ Sink::report_collection_error
//! ```
//!
//! Workers join in two phases. Phase 1 waits for every producer, router and
//! error forwarder; the routing table is then dropped, which closes every
//! delivery queue. Phase 2 waits for every consumer and sink worker.
//!
//! A sink write failure (or a consumer failing on its own) is fatal: every
//! worker is aborted and the run context is left untouched. Producer failures
//! and collection errors only decide the outcome once all work is done.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use super::context::{self, RunContext};
use super::error::{Result, SyncError};
use super::routing::{RoutingIndex, RoutingTable};
use super::types::{
    CollectionError, Consumer, DELIVERY_BUFFER_SIZE, MESSAGE_BUFFER_SIZE, ProducerOutput,
    RECORD_BUFFER_SIZE, Resource, RunReport,
};
use crate::record::{self, Record};
use crate::sink::{OutputRecord, Sink};

struct Subscription {
    resource: String,
    consumer: Arc<dyn Consumer>,
}

#[derive(Default)]
struct RunCounters {
    producer_failures: AtomicUsize,
    collection_errors: AtomicUsize,
    upserted: AtomicUsize,
}

pub struct Dispatcher {
    sink: Arc<dyn Sink>,
    resources: Vec<Arc<dyn Resource>>,
    subscriptions: Vec<Subscription>,
    index: RoutingIndex,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            resources: Vec::new(),
            subscriptions: Vec::new(),
            index: RoutingIndex::default(),
        }
    }

    /// Register a resource and subscribe each of its consumers.
    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        for consumer in resource.consumers() {
            let position = self.subscriptions.len();
            self.index
                .insert(position, consumer.desired_objects(), consumer.desired_events());
            tracing::debug!(
                resource = resource.name(),
                collection = consumer.collection(),
                objects = ?consumer.desired_objects(),
                events = ?consumer.desired_events(),
                "registered subscription"
            );
            self.subscriptions.push(Subscription {
                resource: resource.name().to_string(),
                consumer,
            });
        }
        self.resources.push(resource);
    }

    pub fn resources(&self) -> &[Arc<dyn Resource>] {
        &self.resources
    }

    /// Close every registered resource.
    pub fn close(&self) {
        for resource in &self.resources {
            resource.close();
        }
    }

    /// Run every registered resource once.
    #[tracing::instrument(skip_all, fields(resources = self.resources.len(), subscriptions = self.subscriptions.len()))]
    pub async fn run(&self) -> Result<RunReport> {
        let started_at = Utc::now();
        let run_context = context::load(self.sink.as_ref(), started_at).await?;
        let incremental = run_context.is_incremental();
        tracing::info!(
            incremental,
            previous_run = ?run_context.previous_run_timestamp,
            "starting sync run"
        );

        let counters = Arc::new(RunCounters::default());
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<SyncError>();

        let mut consumer_side = JoinSet::new();
        let mut delivery = Vec::with_capacity(self.subscriptions.len());
        for subscription in &self.subscriptions {
            let (deliver_tx, deliver_rx) = mpsc::channel(DELIVERY_BUFFER_SIZE);
            let (message_tx, message_rx) = mpsc::channel(MESSAGE_BUFFER_SIZE);
            delivery.push(deliver_tx);

            consumer_side.spawn(consume(
                Arc::clone(&subscription.consumer),
                deliver_rx,
                message_tx,
                fatal_tx.clone(),
            ));
            consumer_side.spawn(write_to_sink(
                subscription.resource.clone(),
                Arc::clone(&self.sink),
                message_rx,
                Arc::clone(&counters),
                fatal_tx.clone(),
            ));
        }
        let table = Arc::new(self.index.bind(&delivery));
        drop(delivery);

        let mut producer_side = JoinSet::new();
        for resource in &self.resources {
            let (records_tx, records_rx) = mpsc::channel(RECORD_BUFFER_SIZE);
            let (errors_tx, errors_rx) = mpsc::unbounded_channel();

            producer_side.spawn(route(
                resource.name().to_string(),
                records_rx,
                Arc::clone(&table),
            ));
            producer_side.spawn(forward_errors(
                Arc::clone(&self.sink),
                errors_rx,
                Arc::clone(&counters),
            ));
            producer_side.spawn(produce(
                Arc::clone(resource),
                run_context.clone(),
                ProducerOutput::new(records_tx, errors_tx),
                Arc::clone(&counters),
            ));
        }
        drop(fatal_tx);

        let joined = async {
            join_phase(&mut producer_side, &mut fatal_rx).await?;
            tracing::debug!("producers finished, closing delivery queues");
            drop(table);
            join_phase(&mut consumer_side, &mut fatal_rx).await
        }
        .await;

        if let Err(e) = joined {
            tracing::error!(error = %e, "aborting sync run");
            producer_side.abort_all();
            consumer_side.abort_all();
            return Err(e);
        }

        context::save(self.sink.as_ref(), started_at).await?;

        let producer_failures = counters.producer_failures.load(Ordering::SeqCst);
        let collection_errors = counters.collection_errors.load(Ordering::SeqCst);
        let upserted = counters.upserted.load(Ordering::SeqCst);

        if producer_failures > 0 || collection_errors > 0 {
            tracing::error!(producer_failures, collection_errors, upserted, "sync run failed");
            return Err(SyncError::RunFailed {
                producer_failures,
                collection_errors,
            });
        }

        tracing::info!(upserted, "sync run complete");
        Ok(RunReport {
            started_at,
            incremental,
            upserted,
            resources: self.resources.len(),
        })
    }
}

/// Join every worker in `set`, stopping at the first fatal error.
async fn join_phase(
    set: &mut JoinSet<()>,
    fatal: &mut mpsc::UnboundedReceiver<SyncError>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            Some(err) = fatal.recv() => return Err(err),

            joined = set.join_next() => match joined {
                None => return Ok(()),
                Some(Ok(())) => {}
                Some(Err(e)) if e.is_panic() => return Err(SyncError::WorkerPanic(e.to_string())),
                Some(Err(_)) => {}
            },
        }
    }
}

async fn produce(
    resource: Arc<dyn Resource>,
    run_context: RunContext,
    output: ProducerOutput,
    counters: Arc<RunCounters>,
) {
    let name = resource.name().to_string();
    tracing::debug!(resource = %name, "producer started");

    match resource.start_producer(&run_context, output).await {
        Ok(()) => tracing::debug!(resource = %name, "producer finished"),
        Err(e) => {
            counters.producer_failures.fetch_add(1, Ordering::SeqCst);
            tracing::error!(resource = %name, error = %e, "producer failed");
        }
    }
}

async fn route(resource: String, mut records: mpsc::Receiver<Record>, table: Arc<RoutingTable>) {
    let mut routed = 0usize;
    let mut dropped = 0usize;

    while let Some(record) = records.recv().await {
        let targets = table.targets(&record);
        if targets.is_empty() {
            dropped += 1;
            tracing::trace!(resource = %resource, kind = ?record::kind(&record), "no subscription for record");
            continue;
        }

        let record = Arc::new(record);
        for target in targets {
            if target.send(Arc::clone(&record)).await.is_err() {
                tracing::debug!(resource = %resource, "subscription stopped receiving");
            }
        }
        routed += 1;
    }

    tracing::debug!(resource = %resource, routed, dropped, "router finished");
}

async fn forward_errors(
    sink: Arc<dyn Sink>,
    mut errors: mpsc::UnboundedReceiver<CollectionError>,
    counters: Arc<RunCounters>,
) {
    while let Some(error) = errors.recv().await {
        counters.collection_errors.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(collection = %error.collection, message = %error.message, "collection error");

        if let Err(e) = sink
            .report_collection_error(&error.message, &error.collection)
            .await
        {
            tracing::warn!(collection = %error.collection, error = %e, "failed to report collection error");
        }
    }
}

async fn consume(
    consumer: Arc<dyn Consumer>,
    input: mpsc::Receiver<Arc<Record>>,
    output: mpsc::Sender<OutputRecord>,
    fatal: mpsc::UnboundedSender<SyncError>,
) {
    if let Err(e) = consumer.start_consumer(input, output).await {
        tracing::error!(collection = consumer.collection(), error = %e, "consumer failed");
        let _ = fatal.send(e);
    }
}

async fn write_to_sink(
    resource: String,
    sink: Arc<dyn Sink>,
    mut messages: mpsc::Receiver<OutputRecord>,
    counters: Arc<RunCounters>,
    fatal: mpsc::UnboundedSender<SyncError>,
) {
    while let Some(message) = messages.recv().await {
        if let Err(e) = sink
            .upsert(&message.collection, &message.id, &message.properties)
            .await
        {
            tracing::error!(
                resource = %resource,
                collection = %message.collection,
                id = %message.id,
                error = %e,
                "sink write failed"
            );
            let _ = fatal.send(SyncError::Sink(e));
            return;
        }
        counters.upserted.fetch_add(1, Ordering::SeqCst);
    }
}
