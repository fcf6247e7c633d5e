//! url_object_cache - Single-flight cache for objects fetched from URLs
//!
//! Downloads each URL at most once at a time, revalidates with conditional
//! GETs and keeps the last good object when a refresh fails.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod fetch;
pub mod models;
pub mod tasks;

pub use api::AppState;
pub use cache::{CacheSettings, FetchOutcome, FetchResult, UrlObjectCache, WaitMode};
pub use config::Config;
pub use error::FetchError;
pub use fetch::{HttpFetcher, ResourceFetcher};
pub use tasks::spawn_refresh_task;
