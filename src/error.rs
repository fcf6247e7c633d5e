//! Error types for the object cache
//!
//! `FetchError` is recorded on cache entries and handed back to callers;
//! `ApiError` is what the admin HTTP endpoints turn into responses.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::models::ErrorResponse;

// == Fetch Error Enum ==
/// Failure to produce an object for a URL.
///
/// Errors are stored on the cache entry (shared as `Arc<FetchError>`) so that
/// later cache hits can still see the most recent failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The calling task is already downloading this URL
    #[error("Recursive or circular fetch of URL: {url}")]
    Recursive { url: String },

    /// Network or protocol failure talking to the origin
    #[error("Transport error: {0}")]
    Transport(String),

    /// The origin did not answer in time
    #[error("Timed out fetching {url}")]
    Timeout { url: String },

    /// The origin answered with an error status
    #[error("Unexpected HTTP status {status} from {url}")]
    Status { url: String, status: u16 },

    /// The response body is larger than the configured maximum
    #[error("Response from {url} exceeds the maximum size of {limit} bytes")]
    TooLarge { url: String, limit: usize },

    /// The object factory declined the response
    #[error("Response from {url} was not accepted for caching")]
    Rejected { url: String },

    /// The object factory could not parse the response body
    #[error("Parse error: {0}")]
    Parse(String),

    /// Another error with added context
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<FetchError>,
    },

    /// The download ended without reporting a result (panic or cancellation)
    #[error("Unexpected internal error while attempting to download external resource: {url}")]
    Internal { url: String },

    /// A waiting caller gave up on another caller's download
    #[error("Gave up after {waited:?} waiting for the download of {url}")]
    WaitTimeout { url: String, waited: Duration },

    /// Neither an object nor an error has been cached for the URL
    #[error("No object available for URL: {url}")]
    NothingAvailable { url: String },
}

impl FetchError {
    /// Wraps this error with a description of what was being attempted.
    pub fn context(self, context: impl Into<String>) -> Self {
        FetchError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Returns the innermost parse error in the wrapping chain, if any.
    pub fn parse_cause(&self) -> Option<&FetchError> {
        match self {
            FetchError::Parse(_) => Some(self),
            FetchError::Wrapped { source, .. } => source.parse_cause(),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            FetchError::Timeout { url }
        } else {
            FetchError::Transport(err.to_string())
        }
    }
}

// == Api Error Enum ==
/// Error type for the admin HTTP endpoints.
#[derive(Error, Debug)]
pub enum ApiError {
    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error
    #[allow(dead_code)]
    #[error("Internal error: {0}")]
    Internal(String),
}

// == IntoResponse Implementation ==
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(ErrorResponse::new(message));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the admin API.
pub type Result<T> = std::result::Result<T, ApiError>;
