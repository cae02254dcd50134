use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use super::{OutputRecord, Sink, SinkError};
use crate::record::Record;
use crate::sync::CollectionError;

#[derive(Default)]
struct MemoryState {
    upserts: Vec<OutputRecord>,
    run_context: Option<Vec<u8>>,
    errors: Vec<CollectionError>,
}

/// A sink that keeps everything in memory.
///
/// Used by tests and dry runs. Failures can be switched on to exercise the
/// engine's fatal paths.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<MemoryState>,
    fail_upserts: AtomicBool,
    fail_context_load: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a stored run context.
    #[must_use]
    pub fn with_run_context(self, context: impl Into<Vec<u8>>) -> Self {
        self.lock().run_context = Some(context.into());
        self
    }

    /// Make every later upsert fail.
    pub fn fail_upserts(&self) {
        self.fail_upserts.store(true, Ordering::SeqCst);
    }

    /// Make every later context load fail.
    pub fn fail_context_load(&self) {
        self.fail_context_load.store(true, Ordering::SeqCst);
    }

    /// Every upsert received so far, in arrival order.
    pub fn upserts(&self) -> Vec<OutputRecord> {
        self.lock().upserts.clone()
    }

    /// Upserts received for one collection, in arrival order.
    pub fn collection(&self, collection: &str) -> Vec<OutputRecord> {
        self.lock()
            .upserts
            .iter()
            .filter(|r| r.collection == collection)
            .cloned()
            .collect()
    }

    pub fn run_context(&self) -> Option<Vec<u8>> {
        self.lock().run_context.clone()
    }

    pub fn collection_errors(&self) -> Vec<CollectionError> {
        self.lock().errors.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upsert(&self, collection: &str, id: &str, properties: &Record) -> Result<(), SinkError> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(SinkError::Write {
                collection: collection.to_string(),
                id: id.to_string(),
                message: "sink rejected the write".to_string(),
            });
        }
        self.lock()
            .upserts
            .push(OutputRecord::new(collection, id, properties.clone()));
        Ok(())
    }

    async fn load_run_context(&self) -> Result<Option<Vec<u8>>, SinkError> {
        if self.fail_context_load.load(Ordering::SeqCst) {
            return Err(SinkError::Context("sink unavailable".to_string()));
        }
        Ok(self.lock().run_context.clone())
    }

    async fn save_run_context(&self, context: &[u8]) -> Result<(), SinkError> {
        self.lock().run_context = Some(context.to_vec());
        Ok(())
    }

    async fn report_collection_error(&self, message: &str, collection: &str) -> Result<(), SinkError> {
        self.lock()
            .errors
            .push(CollectionError::new(collection, message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn records_upserts_and_context() {
        let sink = MemorySink::new().with_run_context(b"{}".to_vec());
        let props = json!({"id": "a1"}).as_object().cloned().expect("object");

        sink.upsert("widgets", "a1", &props).await.expect("upsert");
        sink.upsert("gadgets", "g1", &props).await.expect("upsert");

        assert_eq!(sink.upserts().len(), 2);
        assert_eq!(sink.collection("widgets")[0].id, "a1");
        assert_eq!(sink.load_run_context().await.expect("load"), Some(b"{}".to_vec()));
    }

    #[tokio::test]
    async fn injected_failures() {
        let sink = MemorySink::new();
        sink.fail_upserts();
        sink.fail_context_load();

        let err = sink
            .upsert("widgets", "a1", &Record::new())
            .await
            .expect_err("upsert should fail");
        assert!(matches!(err, SinkError::Write { ref id, .. } if id == "a1"));
        assert!(sink.load_run_context().await.is_err());
        assert!(sink.upserts().is_empty());
    }
}
