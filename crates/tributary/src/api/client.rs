//! HTTP implementation of the upstream API client.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;
use uuid::Uuid;

use crate::http::{HttpHeaders, HttpRequest, HttpTransport};
use crate::rate_limit::{ApiRateLimiter, DEFAULT_RPS};
use crate::record::Record;

use super::error::ApiError;
use super::types::{ApiClient, ObjectList, Request};

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.stripe.com";

/// API version pinned on every request unless overridden.
pub const DEFAULT_API_VERSION: &str = "2016-07-06";

/// Header carrying the pinned API version.
pub const API_VERSION_HEADER: &str = "Stripe-Version";

/// Connection options for [`HttpApiClient`].
#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    /// Base URL prefixed to relative request paths.
    pub base_url: String,
    /// Secret key sent as a bearer token.
    pub secret: String,
    /// API version header value; `None` sends no version header.
    pub api_version: Option<String>,
    /// Maximum request starts per second; `None` disables throttling.
    pub max_rps: Option<u32>,
}

impl Default for ApiClientOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            secret: String::new(),
            api_version: Some(DEFAULT_API_VERSION.to_string()),
            max_rps: Some(DEFAULT_RPS),
        }
    }
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    data: Vec<Record>,
    #[serde(default)]
    has_more: bool,
}

/// API client that talks to the upstream over an [`HttpTransport`].
///
/// Every call waits on the shared rate limiter before it starts, so all
/// clones of one client share a single request budget.
#[derive(Clone)]
pub struct HttpApiClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    secret: String,
    api_version: Option<String>,
    rate_limiter: Option<ApiRateLimiter>,
}

impl HttpApiClient {
    /// Create a client. Must be called inside a tokio runtime when throttling
    /// is enabled.
    pub fn new(transport: Arc<dyn HttpTransport>, options: ApiClientOptions) -> Self {
        Self {
            transport,
            base_url: options.base_url.trim_end_matches('/').to_string(),
            secret: options.secret,
            api_version: options.api_version,
            rate_limiter: options.max_rps.map(ApiRateLimiter::per_second),
        }
    }

    /// Build the reqwest-backed client used in production.
    #[cfg(feature = "http-client")]
    pub fn with_reqwest(
        options: ApiClientOptions,
        timeout: std::time::Duration,
    ) -> Result<Self, ApiError> {
        let transport = crate::http::reqwest_transport::ReqwestTransport::with_timeout(timeout)?;
        Ok(Self::new(Arc::new(transport), options))
    }

    /// Resolve the full URL of a request.
    ///
    /// Query parameters already present in the path are kept unless the
    /// request sets the same key.
    pub fn resolve_url(&self, request: &Request) -> Result<String, ApiError> {
        let raw = if request.path.starts_with('/') {
            format!("{}{}", self.base_url, request.path)
        } else {
            request.path.clone()
        };

        let mut url = Url::parse(&raw)
            .map_err(|e| ApiError::InvalidRequest(format!("{}: {e}", request.path)))?;

        let mut pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| !request.query.iter().any(|(rk, _)| rk == k))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.extend(request.query.iter().cloned());

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }

        Ok(url.into())
    }

    fn headers(&self, request: &Request) -> HttpHeaders {
        let mut headers: HttpHeaders = Vec::with_capacity(request.headers.len() + 2);
        if let Some(version) = &self.api_version {
            headers.push((API_VERSION_HEADER.to_string(), version.clone()));
        }
        for (name, value) in &request.headers {
            headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
            headers.push((name.clone(), value.clone()));
        }
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("authorization"));
        headers.push((
            "Authorization".to_string(),
            format!("Bearer {}", self.secret),
        ));
        headers
    }

    async fn get<T: DeserializeOwned>(&self, request: &Request) -> Result<T, ApiError> {
        let url = self.resolve_url(request)?;
        let request_id = Uuid::new_v4();
        let collection = request.log_collection.as_deref().unwrap_or_default();

        if let Some(limiter) = &self.rate_limiter {
            limiter.wait().await;
        }

        tracing::info!(%request_id, %url, collection, "http request");
        let started = Instant::now();

        let response = self
            .transport
            .get(HttpRequest {
                url,
                headers: self.headers(request),
            })
            .await?;

        tracing::debug!(
            %request_id,
            collection,
            status = response.status,
            bytes = response.body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "http response"
        );

        if !(200..300).contains(&response.status) {
            return Err(ApiError::from_status(response.status, &response.body));
        }

        serde_json::from_slice(&response.body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn fetch_list(&self, request: &Request) -> Result<ObjectList, ApiError> {
        let page: ListResponse = self.get(request).await?;
        Ok(ObjectList {
            items: page.data,
            has_more: page.has_more,
        })
    }

    async fn fetch_one(&self, request: &Request) -> Result<Record, ApiError> {
        self.get(request).await
    }
}
