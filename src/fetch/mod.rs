//! Fetch Module
//!
//! The download side of the cache: the `ResourceFetcher` trait the
//! coordinator calls, and its HTTP implementation.

mod http;
mod source;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::Validators;
use crate::error::FetchError;

pub use http::{HttpFetcher, DEFAULT_MAX_DOWNLOAD_SIZE};
pub use source::{ObjectFactory, ResponseSource, TextFactory};

// == Download ==
/// Result of one successful poll of a URL.
#[derive(Debug)]
pub struct Download<T> {
    /// The new object, or `None` when the origin reported no change
    pub object: Option<T>,
    /// Validators to send with the next poll
    pub validators: Validators,
}

impl<T> Download<T> {
    // == Modified ==
    /// A poll that produced a new object.
    pub fn modified(object: T, validators: Validators) -> Self {
        Self {
            object: Some(object),
            validators,
        }
    }

    // == Not Modified ==
    /// A poll the origin answered with "not modified".
    pub fn not_modified(validators: Validators) -> Self {
        Self {
            object: None,
            validators,
        }
    }
}

// == Resource Fetcher ==
/// Produces objects for URLs on behalf of the cache.
#[async_trait]
pub trait ResourceFetcher<T>: Send + Sync {
    /// Polls `url`.
    ///
    /// `validators` come from the previous successful poll and should be
    /// trusted over `last_poll_started`, which is the local time that poll
    /// began (Unix epoch if there never was one).
    async fn get(
        &self,
        url: &str,
        validators: &Validators,
        last_poll_started: DateTime<Utc>,
    ) -> Result<Download<T>, FetchError>;

    /// Runs on the downloading task just before a cached entry is refreshed.
    fn before_refresh(&self, _url: &str, _previous: Option<&Arc<T>>) {}
}
