//! LRU Tracker Module
//!
//! Recency order of cache keys, used to pick eviction victims.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

// == LRU Tracker ==
/// Tracks access order for LRU eviction.
///
/// Every touch stamps the key with an increasing tick; the smallest tick is
/// the least recently used key.
#[derive(Debug)]
pub struct LruTracker<K> {
    ticks: HashMap<K, u64>,
    order: BTreeMap<u64, K>,
    next_tick: u64,
}

impl<K> Default for LruTracker<K> {
    fn default() -> Self {
        Self {
            ticks: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
        }
    }
}

impl<K: Hash + Eq + Clone> LruTracker<K> {
    // == Constructor ==
    /// Creates a new empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    // == Touch ==
    /// Marks a key as most recently used, adding it if it is new.
    pub fn touch(&mut self, key: &K) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(previous) = self.ticks.insert(key.clone(), tick) {
            self.order.remove(&previous);
        }
        self.order.insert(tick, key.clone());
    }

    // == Remove ==
    /// Forgets a key. Unknown keys are ignored.
    pub fn remove(&mut self, key: &K) {
        if let Some(tick) = self.ticks.remove(key) {
            self.order.remove(&tick);
        }
    }

    // == Evict Oldest ==
    /// Removes and returns the least recently used key.
    pub fn evict_oldest(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.ticks.remove(&key);
        Some(key)
    }

    // == Length ==
    /// Returns the number of tracked keys.
    pub fn len(&self) -> usize {
        self.ticks.len()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(keys: &[&str]) -> LruTracker<String> {
        let mut lru = LruTracker::new();
        for key in keys {
            lru.touch(&key.to_string());
        }
        lru
    }

    #[test]
    fn test_lru_new() {
        let mut lru: LruTracker<String> = LruTracker::new();
        assert_eq!(lru.len(), 0);
        assert_eq!(lru.evict_oldest(), None);
    }

    #[test]
    fn test_first_touched_is_oldest() {
        let mut lru = tracker(&["a", "b", "c"]);
        assert_eq!(lru.len(), 3);
        assert_eq!(lru.evict_oldest().as_deref(), Some("a"));
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_retouch_moves_key_to_back_of_eviction_queue() {
        let mut lru = tracker(&["a", "b", "c"]);
        lru.touch(&"a".to_string());

        assert_eq!(lru.evict_oldest().as_deref(), Some("b"));
        assert_eq!(lru.evict_oldest().as_deref(), Some("c"));
        assert_eq!(lru.evict_oldest().as_deref(), Some("a"));
        assert_eq!(lru.evict_oldest(), None);
    }

    #[test]
    fn test_remove_forgets_key() {
        let mut lru = tracker(&["a", "b"]);
        lru.remove(&"a".to_string());
        lru.remove(&"missing".to_string());

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.evict_oldest().as_deref(), Some("b"));
        assert_eq!(lru.evict_oldest(), None);
    }

    #[test]
    fn test_repeated_touch_keeps_single_slot() {
        let mut lru = tracker(&["a", "a", "a"]);
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.evict_oldest().as_deref(), Some("a"));
        assert_eq!(lru.len(), 0);
    }
}
