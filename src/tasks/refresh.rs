//! Proactive Refresh Task
//!
//! Background task that periodically refreshes cache entries which are read
//! and about to go stale, so readers rarely have to wait for a download.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cache::{EntryStore, UrlObjectCache};
use crate::fetch::ResourceFetcher;

/// Spawns a task that calls `refresh_expiring` every `interval`.
///
/// Entries that will be stale within `pre_expiry` are refreshed in the
/// background. Failed entries are left for the next caller to retry.
///
/// Returns a JoinHandle that can be aborted during graceful shutdown.
pub fn spawn_refresh_task<T, F, S>(
    cache: Arc<UrlObjectCache<T, F, S>>,
    interval: Duration,
    pre_expiry: Duration,
) -> JoinHandle<()>
where
    T: Send + Sync + 'static,
    F: ResourceFetcher<T> + 'static,
    S: EntryStore<T> + 'static,
{
    tokio::spawn(async move {
        info!(
            "Starting proactive refresh task every {:?} with {:?} look-ahead",
            interval, pre_expiry
        );

        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let scheduled = cache.refresh_expiring(pre_expiry).await;
            if scheduled == 0 {
                debug!("Proactive refresh: nothing expiring");
            }
        }
    })
}
