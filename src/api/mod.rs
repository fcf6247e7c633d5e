//! API Module
//!
//! Admin HTTP endpoints for inspecting and managing the cache.
//!
//! # Endpoints
//! - `GET /health` - Health check endpoint
//! - `GET /stats` - Cache statistics
//! - `DELETE /entries?url=...` - Evict a URL from the cache

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
