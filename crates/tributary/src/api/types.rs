use async_trait::async_trait;

use crate::http::HttpHeaders;
use crate::record::Record;

use super::error::ApiError;

/// Query parameter carrying the pagination cursor.
pub const CURSOR_PARAM: &str = "starting_after";

/// A request against the upstream API.
///
/// Query parameters form an ordered multimap, so list-valued filters such as
/// `types[]` can repeat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Path relative to the API base URL (or an absolute URL).
    pub path: String,
    /// Query parameters in insertion order.
    pub query: Vec<(String, String)>,
    /// Extra request headers.
    pub headers: HttpHeaders,
    /// Collection the request is made on behalf of, for logging only.
    pub log_collection: Option<String>,
}

impl Request {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Append a query value, keeping existing values for the same key.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.append(key, value);
        self
    }

    #[must_use]
    pub fn with_log_collection(mut self, collection: impl Into<String>) -> Self {
        self.log_collection = Some(collection.into());
        self
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.query.push((key.into(), value.into()));
    }

    /// Replace every value of `key` with a single value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.query.retain(|(k, _)| *k != key);
        self.query.push((key, value.into()));
    }

    /// First value of `key`.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values of `key`, in order.
    pub fn query_values(&self, key: &str) -> Vec<&str> {
        self.query
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The request for the page after the item with id `last_id`.
    ///
    /// Path, headers and every query parameter carry over; the cursor is
    /// set (not appended).
    #[must_use]
    pub fn next_page(&self, last_id: &str) -> Self {
        let mut next = self.clone();
        next.set(CURSOR_PARAM, last_id);
        next
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectList {
    pub items: Vec<Record>,
    pub has_more: bool,
}

/// The upstream API collaborator.
#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Fetch one page of a listing endpoint.
    async fn fetch_list(&self, request: &Request) -> Result<ObjectList, ApiError>;

    /// Fetch a single object.
    async fn fetch_one(&self, request: &Request) -> Result<Record, ApiError>;
}
