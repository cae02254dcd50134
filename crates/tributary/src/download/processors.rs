//! Post-processors shipped with the downloader.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{DownloadError, Downloader, PAGE_LIMIT, PostProcessor, Task, collect};
use crate::api::{CURSOR_PARAM, Request};
use crate::dedup::DedupStore;
use crate::record::{self, DELETED_KEY, Record};

/// Marks the payload of deletion events with `is_deleted = true`.
#[derive(Debug, Clone)]
pub struct DeletionTagger {
    event_types: Vec<String>,
}

impl DeletionTagger {
    pub fn new<I, S>(event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_types: event_types.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PostProcessor for DeletionTagger {
    fn name(&self) -> &str {
        "deletion-tagger"
    }

    async fn process(&self, record: &mut Record, _task: &Task) -> Result<(), DownloadError> {
        if !record::is_event(record) {
            return Ok(());
        }
        let Some(event_type) = record::get_str(record, "type") else {
            return Ok(());
        };
        if !self.event_types.iter().any(|t| t == event_type) {
            return Ok(());
        }

        if let Some(payload) = record::event_payload_mut(record, &[]) {
            payload.insert(DELETED_KEY.to_string(), Value::Bool(true));
        }
        Ok(())
    }
}

/// Completes a truncated nested list by paging its own `url`.
///
/// The list is found by following a dot-separated path of keys, e.g.
/// `sources` or `data.object.sources` for event payloads. Lists that are
/// absent, complete, or empty are left alone.
#[derive(Clone)]
pub struct ListExpander {
    path: Vec<String>,
    downloader: Downloader,
}

impl ListExpander {
    pub fn new(path: &str, downloader: Downloader) -> Self {
        Self {
            path: path.split('.').map(str::to_string).collect(),
            downloader,
        }
    }

    fn locate<'a>(&self, record: &'a Record) -> Option<&'a Record> {
        self.path
            .iter()
            .try_fold(record, |current, key| record::get_map(current, key))
    }

    fn locate_mut<'a>(&self, record: &'a mut Record) -> Option<&'a mut Record> {
        self.path
            .iter()
            .try_fold(record, |current, key| record::get_map_mut(current, key))
    }
}

#[async_trait]
impl PostProcessor for ListExpander {
    fn name(&self) -> &str {
        "list-expander"
    }

    async fn process(&self, record: &mut Record, _task: &Task) -> Result<(), DownloadError> {
        let Some(list) = self.locate(record) else {
            return Ok(());
        };
        if !record::get_bool(list, "has_more") {
            return Ok(());
        }
        let Some(url) = record::get_str(list, "url") else {
            return Ok(());
        };
        let Some(last_id) = record::get_map_list(list, "data")
            .last()
            .and_then(|item| record::get_str(item, "id"))
        else {
            return Ok(());
        };

        let request = Request::new(url)
            .with_query("limit", PAGE_LIMIT)
            .with_query(CURSOR_PARAM, last_id);
        let (result, extra) = collect(&self.downloader, request).await;
        result?;

        tracing::debug!(path = %self.path.join("."), appended = extra.len(), "expanded nested list");
        if let Some(Value::Array(data)) = self
            .locate_mut(record)
            .and_then(|list| list.get_mut("data"))
        {
            data.extend(extra.into_iter().map(Value::Object));
        }
        Ok(())
    }
}

/// Downloads a related listing for each parent and emits its items, tagged
/// with the parent's id, into the same task output.
///
/// In event mode the parent is the payload of an event, and parents already
/// handled during this run are skipped.
#[derive(Clone)]
pub struct RelatedRecords {
    parent_kind: String,
    path: String,
    filter_param: String,
    parent_key: String,
    downloader: Downloader,
    seen: Option<Arc<dyn DedupStore>>,
}

impl RelatedRecords {
    /// Download `path?<filter_param>=<parent id>` for every `parent_kind`
    /// object and tag each item with `parent_key`.
    pub fn new(
        downloader: Downloader,
        parent_kind: impl Into<String>,
        path: impl Into<String>,
        filter_param: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        Self {
            parent_kind: parent_kind.into(),
            path: path.into(),
            filter_param: filter_param.into(),
            parent_key: parent_key.into(),
            downloader,
            seen: None,
        }
    }

    /// Read parents out of event payloads, once per parent id.
    #[must_use]
    pub fn from_events(mut self, seen: Arc<dyn DedupStore>) -> Self {
        self.seen = Some(seen);
        self
    }

    fn parent_id<'a>(&self, record: &'a Record) -> Option<&'a str> {
        let parent = if self.seen.is_some() {
            record::event_payload(record, &[self.parent_kind.as_str()])?
        } else {
            (record::kind(record) == Some(self.parent_kind.as_str())).then_some(record)?
        };
        record::get_str(parent, "id").filter(|id| !id.is_empty())
    }
}

#[async_trait]
impl PostProcessor for RelatedRecords {
    fn name(&self) -> &str {
        "related-records"
    }

    async fn process(&self, record: &mut Record, task: &Task) -> Result<(), DownloadError> {
        let Some(parent_id) = self.parent_id(record).map(str::to_string) else {
            return Ok(());
        };

        if let Some(seen) = &self.seen {
            let already = seen
                .seen_before(&parent_id)
                .await
                .map_err(|e| DownloadError::Processor {
                    processor: self.name().to_string(),
                    message: e.to_string(),
                })?;
            if already {
                return Ok(());
            }
        }

        let request = Request::new(self.path.as_str())
            .with_query("limit", PAGE_LIMIT)
            .with_query(self.filter_param.as_str(), parent_id.as_str());
        let (result, related) = collect(&self.downloader, request).await;
        result?;

        for mut item in related {
            item.insert(self.parent_key.clone(), Value::String(parent_id.clone()));
            task.emit(item).await?;
        }
        Ok(())
    }
}
