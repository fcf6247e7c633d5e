//! Cache Store Module
//!
//! The key→entry map the coordinator keeps its entries in, plus a bounded
//! implementation with least-recently-used eviction.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::cache::entry::CacheEntry;
use crate::cache::LruTracker;

// == Entry Store ==
/// Storage for cache entries keyed by URL.
///
/// Every method is called with the coordinator's store lock held, so
/// implementations need no synchronization of their own. Capacity and
/// eviction policy belong to the implementation.
pub trait EntryStore<T>: Send {
    /// Looks up the entry for `url`, counting the lookup as a use.
    fn get(&mut self, url: &str) -> Option<Arc<CacheEntry<T>>>;

    /// Inserts an entry, replacing any entry already stored for `url`.
    fn put(&mut self, url: String, entry: Arc<CacheEntry<T>>);

    /// Removes and returns the entry for `url`.
    fn remove(&mut self, url: &str) -> Option<Arc<CacheEntry<T>>>;

    /// All stored entries, in no particular order.
    fn entries(&self) -> Vec<Arc<CacheEntry<T>>>;

    /// Number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries dropped by the store's own capacity policy so far.
    fn capacity_evictions(&self) -> u64 {
        0
    }
}

// == LRU Entry Store ==
/// Fixed-capacity entry store evicting the least recently used URL.
#[derive(Debug)]
pub struct LruEntryStore<T> {
    entries: HashMap<String, Arc<CacheEntry<T>>>,
    lru: LruTracker<String>,
    max_entries: usize,
    evictions: u64,
}

impl<T> LruEntryStore<T> {
    // == Constructor ==
    /// Creates a store holding at most `max_entries` URLs (at least one).
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            max_entries: max_entries.max(1),
            evictions: 0,
        }
    }

    // == Max Entries ==
    /// Returns the capacity of the store.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }
}

impl<T: Send + Sync> EntryStore<T> for LruEntryStore<T> {
    fn get(&mut self, url: &str) -> Option<Arc<CacheEntry<T>>> {
        let entry = self.entries.get(url)?;
        self.lru.touch(&url.to_string());
        Some(Arc::clone(entry))
    }

    fn put(&mut self, url: String, entry: Arc<CacheEntry<T>>) {
        if !self.entries.contains_key(&url) && self.lru.len() >= self.max_entries {
            if let Some(victim) = self.lru.evict_oldest() {
                self.entries.remove(&victim);
                self.evictions += 1;
                debug!(url = %victim, "Evicted least recently used cache entry");
            }
        }
        self.lru.touch(&url);
        self.entries.insert(url, entry);
    }

    fn remove(&mut self, url: &str) -> Option<Arc<CacheEntry<T>>> {
        let entry = self.entries.remove(url)?;
        self.lru.remove(&url.to_string());
        Some(entry)
    }

    fn entries(&self) -> Vec<Arc<CacheEntry<T>>> {
        self.entries.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn capacity_evictions(&self) -> u64 {
        self.evictions
    }
}
