//! Configuration Module
//!
//! Handles loading and managing cache server configuration from environment variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use reqwest::Client;

use crate::cache::{CacheSettings, WaitMode};
use crate::fetch::DEFAULT_MAX_DOWNLOAD_SIZE;

/// Server configuration parameters.
///
/// All values can be configured via environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of URLs the cache can hold
    pub max_entries: usize,
    /// Seconds after which cached state is polled again
    pub max_cache_age: u64,
    /// Seconds an object is still handed out after a failed refresh; `None` is forever
    pub max_stale_age: Option<u64>,
    /// Largest accepted response body in bytes
    pub max_download_size: usize,
    /// Per-request HTTP timeout in seconds
    pub http_timeout: u64,
    /// Seconds a caller waits on another caller's download; 0 waits forever
    pub wait_timeout: u64,
    /// Wait mode used when resolving URLs
    pub default_wait_mode: WaitMode,
    /// Proactive refresh interval in seconds; 0 disables it
    pub refresh_interval: u64,
    /// How far ahead of expiry the proactive refresh looks, in seconds
    pub refresh_pre_expiry: u64,
    /// Admin HTTP server port
    pub server_port: u16,
    /// URLs resolved once at startup
    pub prefetch_urls: Vec<String>,
}

impl Config {
    /// Creates a new Config by loading values from environment variables.
    ///
    /// # Environment Variables
    /// - `MAX_ENTRIES` - Maximum cached URLs (default: 100)
    /// - `MAX_CACHE_AGE` - Staleness threshold in seconds (default: 300)
    /// - `MAX_STALE_AGE` - Stale reuse bound in seconds (default: unset)
    /// - `MAX_DOWNLOAD_SIZE` - Body limit in bytes (default: 10 MiB)
    /// - `HTTP_TIMEOUT` - Request timeout in seconds (default: 30)
    /// - `WAIT_TIMEOUT` - Wait bound in seconds, 0 for none (default: 60)
    /// - `DEFAULT_WAIT_MODE` - `never`, `initial` or `latest` (default: initial)
    /// - `REFRESH_INTERVAL` - Proactive refresh period in seconds (default: 0, off)
    /// - `REFRESH_PRE_EXPIRY` - Refresh look-ahead in seconds (default: 60)
    /// - `SERVER_PORT` - Admin HTTP port (default: 3000)
    /// - `PREFETCH_URLS` - Comma-separated URLs to resolve at startup
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_entries: parsed("MAX_ENTRIES").unwrap_or(defaults.max_entries),
            max_cache_age: parsed("MAX_CACHE_AGE").unwrap_or(defaults.max_cache_age),
            max_stale_age: parsed("MAX_STALE_AGE").or(defaults.max_stale_age),
            max_download_size: parsed("MAX_DOWNLOAD_SIZE").unwrap_or(defaults.max_download_size),
            http_timeout: parsed("HTTP_TIMEOUT").unwrap_or(defaults.http_timeout),
            wait_timeout: parsed("WAIT_TIMEOUT").unwrap_or(defaults.wait_timeout),
            default_wait_mode: parsed("DEFAULT_WAIT_MODE").unwrap_or(defaults.default_wait_mode),
            refresh_interval: parsed("REFRESH_INTERVAL").unwrap_or(defaults.refresh_interval),
            refresh_pre_expiry: parsed("REFRESH_PRE_EXPIRY")
                .unwrap_or(defaults.refresh_pre_expiry),
            server_port: parsed("SERVER_PORT").unwrap_or(defaults.server_port),
            prefetch_urls: env::var("PREFETCH_URLS")
                .map(|v| split_urls(&v))
                .unwrap_or(defaults.prefetch_urls),
        }
    }

    /// Cache tuning derived from this configuration.
    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            resource_description: "remote resource".to_string(),
            max_age: Duration::from_secs(self.max_cache_age),
            max_stale_age: self.max_stale_age.map(Duration::from_secs),
            default_wait_mode: self.default_wait_mode,
            wait_timeout: (self.wait_timeout > 0).then(|| Duration::from_secs(self.wait_timeout)),
        }
    }

    /// Builds the shared HTTP client.
    pub fn http_client(&self) -> reqwest::Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.http_timeout))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
    }

    /// Proactive refresh interval, if enabled.
    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval > 0).then(|| Duration::from_secs(self.refresh_interval))
    }

    pub fn refresh_pre_expiry(&self) -> Duration {
        Duration::from_secs(self.refresh_pre_expiry)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_entries: 100,
            max_cache_age: 300,
            max_stale_age: None,
            max_download_size: DEFAULT_MAX_DOWNLOAD_SIZE,
            http_timeout: 30,
            wait_timeout: 60,
            default_wait_mode: WaitMode::Initial,
            refresh_interval: 0,
            refresh_pre_expiry: 60,
            server_port: 3000,
            prefetch_urls: Vec::new(),
        }
    }
}

fn parsed<V: FromStr>(name: &str) -> Option<V> {
    env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn split_urls(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}
