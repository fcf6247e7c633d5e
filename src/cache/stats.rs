//! Cache Statistics Module
//!
//! Counts how fetches were served: from cache, by downloading, or by waiting.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::FetchOutcome;

// == Cache Stats ==
/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Fetches answered from a fresh cached entry
    pub used_cached: u64,
    /// Downloads started
    pub downloads: u64,
    /// Downloads that ended in an error
    pub download_failures: u64,
    /// Fetches that returned without waiting on another caller's download
    pub downloading_now: u64,
    /// Fetches that waited on another caller's download
    pub waits: u64,
    /// Fetches refused because the caller already owned the download
    pub recursive_fetches: u64,
    /// Entries dropped by `evict` or by the store's capacity limit
    pub evictions: u64,
    /// Current number of entries in the store
    pub total_entries: usize,
}

impl CacheStats {
    // == Hit Rate ==
    /// Share of fetches answered without downloading.
    ///
    /// Returns 0.0 when nothing has been fetched yet.
    pub fn hit_rate(&self) -> f64 {
        let total = self.used_cached + self.downloads;
        if total == 0 {
            0.0
        } else {
            self.used_cached as f64 / total as f64
        }
    }
}

// == Stats Recorder ==
/// Lock-free counters updated by the coordinator.
#[derive(Debug, Default)]
pub(crate) struct StatsRecorder {
    used_cached: AtomicU64,
    downloads: AtomicU64,
    download_failures: AtomicU64,
    downloading_now: AtomicU64,
    waits: AtomicU64,
    recursive_fetches: AtomicU64,
    evictions: AtomicU64,
}

impl StatsRecorder {
    // == Record Download ==
    /// Counts a download attempt.
    pub fn record_download(&self) {
        self.downloads.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Download Outcome ==
    /// Records how a download ended.
    pub fn record_download_outcome(&self, outcome: FetchOutcome) {
        if outcome == FetchOutcome::DownloadFailed {
            self.download_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // == Record Used Cached ==
    pub fn record_used_cached(&self) {
        self.used_cached.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Downloading Now ==
    /// Counts a caller that did not wait on a running download.
    pub fn record_downloading_now(&self) {
        self.downloading_now.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Wait ==
    /// Counts a caller that waited on a running download.
    pub fn record_wait(&self) {
        self.waits.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Recursive ==
    pub fn record_recursive(&self) {
        self.recursive_fetches.fetch_add(1, Ordering::Relaxed);
    }

    // == Record Eviction ==
    /// Counts an explicit eviction.
    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    // == Snapshot ==
    /// Copies the counters, adding evictions the store performed on its own.
    pub fn snapshot(&self, total_entries: usize, capacity_evictions: u64) -> CacheStats {
        CacheStats {
            used_cached: self.used_cached.load(Ordering::Relaxed),
            downloads: self.downloads.load(Ordering::Relaxed),
            download_failures: self.download_failures.load(Ordering::Relaxed),
            downloading_now: self.downloading_now.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            recursive_fetches: self.recursive_fetches.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed) + capacity_evictions,
            total_entries,
        }
    }
}
