//! Upstream API collaborator.
//!
//! The engine only needs two calls from the remote API: fetch one page of a
//! cursor-paginated listing, and fetch one object. [`ApiClient`] abstracts
//! both so tests can substitute scripted clients; [`HttpApiClient`] is the
//! real implementation.
//!
//! # Example
//!
//! ```ignore
//! use tributary::api::{ApiClient, ApiClientOptions, HttpApiClient, Request};
//!
//! let client = HttpApiClient::with_reqwest(options, DEFAULT_CALL_TIMEOUT)?;
//! let page = client.fetch_list(&Request::new("/v1/customers").with_query("limit", "100")).await?;
//! for item in page.items {
//!     println!("{:?}", item.get("id"));
//! }
//! ```

mod client;
mod error;
mod types;

pub use client::{
    API_VERSION_HEADER, ApiClientOptions, DEFAULT_API_VERSION, DEFAULT_BASE_URL, HttpApiClient,
};
pub use error::ApiError;
pub use types::{ApiClient, CURSOR_PARAM, ObjectList, Request};

/// Issue one probe request to check the configured credentials.
///
/// The caller decides what to do with the error; an error with
/// [`ApiError::is_auth_related`] means the credentials were rejected and no
/// sync should be attempted.
pub async fn verify_credentials<C: ApiClient + ?Sized>(
    client: &C,
    probe: &Request,
) -> Result<(), ApiError> {
    match client.fetch_list(probe).await {
        Ok(_) => Ok(()),
        Err(e) => {
            if e.is_auth_related() {
                tracing::error!(error = %e, "API credentials were rejected");
            } else {
                tracing::error!(error = %e, "credential probe request failed");
            }
            Err(e)
        }
    }
}
