//! Request DTOs for the admin API
//!
//! Defines the structure of incoming query parameters.

use serde::Deserialize;

/// Query string for the evict operation (DELETE /entries?url=...)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EvictQuery {
    /// URL whose cache entry should be dropped
    #[serde(default)]
    pub url: Option<String>,
}

impl EvictQuery {
    /// Validates the query and returns the URL to evict.
    ///
    /// Returns an error message if the URL is missing or blank.
    pub fn validate(&self) -> Result<&str, String> {
        match self.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(url),
            _ => Err("Query parameter 'url' is required".to_string()),
        }
    }
}
