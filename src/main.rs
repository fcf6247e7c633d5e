//! url_object_cache - Caching server for remote resources
//!
//! Resolves configured URLs through the cache and exposes an admin API.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use url_object_cache::api::{create_router, AppState};
use url_object_cache::cache::LruEntryStore;
use url_object_cache::fetch::TextFactory;
use url_object_cache::{spawn_refresh_task, Config, HttpFetcher, UrlObjectCache};

/// Main entry point for the cache server.
///
/// # Startup Sequence
/// 1. Initialize tracing subscriber for logging
/// 2. Load configuration from environment variables
/// 3. Build the HTTP fetcher and the LRU-bounded cache
/// 4. Resolve prefetch URLs
/// 5. Start the proactive refresh task if enabled
/// 6. Serve the admin API until SIGINT/SIGTERM
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Defaults to "info" level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "url_object_cache=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting URL object cache server");

    let config = Config::from_env();
    info!(
        "Configuration loaded: max_entries={}, max_cache_age={}s, wait_mode={}, port={}",
        config.max_entries, config.max_cache_age, config.default_wait_mode, config.server_port
    );

    let client = config
        .http_client()
        .context("failed to build HTTP client")?;
    let fetcher: HttpFetcher<String, TextFactory> = HttpFetcher::new(client, TextFactory)
        .with_max_download_size(config.max_download_size);
    let cache = Arc::new(UrlObjectCache::new(
        fetcher,
        LruEntryStore::new(config.max_entries),
        config.cache_settings(),
    ));
    info!("Cache initialized");

    for url in &config.prefetch_urls {
        match cache.resolve(url).await {
            Ok(text) => info!("Prefetched {} ({} bytes)", url, text.len()),
            Err(err) => warn!("Prefetch of {} failed: {}", url, err),
        }
    }

    let refresh_handle = config.refresh_interval().map(|interval| {
        spawn_refresh_task(Arc::clone(&cache), interval, config.refresh_pre_expiry())
    });

    let app = create_router(AppState::new(cache));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(refresh_handle))
        .await
        .context("admin server failed")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Waits for shutdown signal (Ctrl+C or SIGTERM).
///
/// On shutdown signal, aborts the refresh task and allows graceful shutdown.
async fn shutdown_signal(refresh_handle: Option<JoinHandle<()>>) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    if let Some(handle) = refresh_handle {
        handle.abort();
        warn!("Refresh task aborted");
    }
}
