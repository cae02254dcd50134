use thiserror::Error;

use crate::http::HttpError;

/// Errors returned by the upstream API client.
///
/// Rate limiting, server-side failures and network trouble are transient and
/// worth retrying. Anything else the API rejects is permanent.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Rate limited (429) or a server-side failure (5xx).
    #[error("transient API failure (status {status}): {message}")]
    Transient { status: u16, message: String },

    /// The API rejected the request and retrying cannot help.
    #[error("API request rejected (status {status}): {message}")]
    Permanent {
        status: u16,
        message: String,
        auth_related: bool,
    },

    /// Network or connection error.
    #[error("network error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("failed to decode API response: {0}")]
    Decode(String),

    /// The request could not be turned into a URL.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// Classify a non-2xx response.
    pub fn from_status(status: u16, body: &[u8]) -> Self {
        let message = error_message(body);
        if status == 429 || status >= 500 {
            Self::Transient { status, message }
        } else {
            Self::Permanent {
                status,
                message,
                auth_related: status == 401,
            }
        }
    }

    /// Whether retrying cannot fix this error.
    #[inline]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. } | Self::InvalidRequest(_))
    }

    /// Whether this is a permanent credential failure.
    #[inline]
    pub fn is_auth_related(&self) -> bool {
        matches!(
            self,
            Self::Permanent {
                auth_related: true,
                ..
            }
        )
    }
}

impl From<HttpError> for ApiError {
    fn from(e: HttpError) -> Self {
        Self::Transport(e.to_string())
    }
}

/// Pull `error.message` out of an API error body, if there is one.
fn error_message(body: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "unexpected response status code".to_string())
}
