//! Resource bundles: several resources sharing one event stream.
//!
//! Registering members through a bundle routes them exactly as if they were
//! registered one by one, but an incremental run downloads `/v1/events` once
//! for all of them, filtered to the union of their event types, instead of
//! once per member.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinSet;

use super::context::RunContext;
use super::error::{Result, SyncError};
use super::incremental::incremental_task;
use super::types::{Consumer, ProducerOutput, Resource};
use crate::download::{Downloader, FETCH_FAILED_MESSAGE, PostProcessor};

/// Worker label used for the shared events download.
const EVENTS_WORKER: &str = "events";

pub struct ResourceBundle {
    name: String,
    members: Vec<Arc<dyn Resource>>,
    downloader: Downloader,
}

impl ResourceBundle {
    pub fn new(name: impl Into<String>, downloader: Downloader) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            downloader,
        }
    }

    /// Add a member. Members should leave event downloads to the bundle.
    #[must_use]
    pub fn with_member(mut self, member: Arc<dyn Resource>) -> Self {
        self.members.push(member);
        self
    }

    pub fn members(&self) -> &[Arc<dyn Resource>] {
        &self.members
    }
}

#[async_trait]
impl Resource for ResourceBundle {
    fn name(&self) -> &str {
        &self.name
    }

    fn consumers(&self) -> Vec<Arc<dyn Consumer>> {
        self.members.iter().flat_map(|m| m.consumers()).collect()
    }

    fn event_processors(&self) -> Vec<Arc<dyn PostProcessor>> {
        self.members
            .iter()
            .flat_map(|m| m.event_processors())
            .collect()
    }

    #[tracing::instrument(skip_all, fields(bundle = %self.name))]
    async fn start_producer(&self, run_context: &RunContext, output: ProducerOutput) -> Result<()> {
        let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();

        for member in &self.members {
            let member = Arc::clone(member);
            let run_context = run_context.clone();
            let output = output.clone();
            workers.spawn(async move {
                let result = member.start_producer(&run_context, output).await;
                (member.name().to_string(), result)
            });
        }

        if let Some(task) = incremental_task(self, run_context, &output) {
            let downloader = self.downloader.clone();
            let collections: Vec<String> = self
                .consumers()
                .iter()
                .map(|c| c.collection().to_string())
                .collect();
            let errors = output.clone();
            tracing::info!(members = self.members.len(), "downloading shared events");

            workers.spawn(async move {
                let result = downloader.run(&task).await;
                if result.is_err() {
                    for collection in collections {
                        errors.report(collection, FETCH_FAILED_MESSAGE);
                    }
                }
                (EVENTS_WORKER.to_string(), result.map(drop).map_err(SyncError::from))
            });
        }
        drop(output);

        let mut failures = 0usize;
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((worker, Err(e))) => {
                    failures += 1;
                    tracing::error!(worker = %worker, error = %e, "bundle worker failed");
                }
                Err(e) => {
                    failures += 1;
                    tracing::error!(error = %e, "bundle worker panicked");
                }
            }
        }

        if failures > 0 {
            return Err(SyncError::BundleFailed { failures });
        }
        Ok(())
    }

    fn close(&self) {
        for member in &self.members {
            member.close();
        }
    }
}
