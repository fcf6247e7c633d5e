//! API Handlers
//!
//! HTTP request handlers for each admin endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    Json,
};
use tracing::info;

use crate::cache::CacheAdmin;
use crate::error::{ApiError, Result};
use crate::models::{EvictQuery, EvictResponse, HealthResponse, StatsResponse};

/// Application state shared across all handlers.
///
/// Holds the cache behind its object-type-erased admin view.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn CacheAdmin>,
}

impl AppState {
    pub fn new(cache: Arc<dyn CacheAdmin>) -> Self {
        Self { cache }
    }
}

/// Handler for DELETE /entries?url=...
///
/// Drops everything cached for a URL so the next fetch downloads it again.
pub async fn evict_handler(
    State(state): State<AppState>,
    Query(query): Query<EvictQuery>,
) -> Result<Json<EvictResponse>> {
    let url = query.validate().map_err(ApiError::InvalidRequest)?;

    let evicted = state.cache.evict(url).await;
    info!("Admin eviction of URL '{}' (present: {})", url, evicted);

    Ok(Json(EvictResponse::new(url, evicted)))
}

/// Handler for GET /stats
///
/// Returns current cache counters.
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::from(state.cache.stats().await))
}

/// Handler for GET /health
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}
