//! Cache Entry Module
//!
//! Per-URL cache state and the monitor (mutex + notifier) that guards it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;

use crate::error::FetchError;

// == Caller Identity ==
/// Identity of a logical caller (an async call chain) that may own a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallerId(u64);

impl CallerId {
    // == Next ==
    /// Allocates an identity no other caller has used.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        CallerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// == Validators ==
/// Freshness token from the previous successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    /// `Last-Modified` as reported by the origin, kept verbatim
    pub last_modified: Option<String>,
    /// `ETag` as reported by the origin, kept verbatim
    pub etag: Option<String>,
}

// == Stamped ==
/// A value paired with the time it was produced.
#[derive(Debug)]
pub struct Stamped<V> {
    pub value: V,
    pub created_at: DateTime<Utc>,
}

impl<V: Clone> Clone for Stamped<V> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            created_at: self.created_at,
        }
    }
}

impl<V> Stamped<V> {
    // == Constructor ==
    /// Stamps `value` with the time it was produced.
    pub fn new(value: V, created_at: DateTime<Utc>) -> Self {
        Self { value, created_at }
    }

    fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.created_at >= max_age
    }
}

// == Cached Object ==
/// The last object a download produced.
#[derive(Debug)]
pub struct CachedObject<T> {
    pub value: Arc<T>,
    /// Start of the poll that produced `value`
    pub created_at: DateTime<Utc>,
    /// Start of the latest poll that produced or confirmed `value`. A "not
    /// modified" answer moves this forward but leaves `created_at` alone.
    pub verified_at: DateTime<Utc>,
}

impl<T> CachedObject<T> {
    // == Constructor ==
    /// Wraps an object downloaded by a poll that started at `created_at`.
    pub fn new(value: Arc<T>, created_at: DateTime<Utc>) -> Self {
        Self {
            value,
            created_at,
            verified_at: created_at,
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.verified_at >= max_age
    }
}

// == Entry State ==
/// Mutable fields of a cache entry. Only touched with the entry monitor held.
#[derive(Debug)]
pub struct EntryState<T> {
    /// Caller currently downloading this URL
    pub owner: Option<CallerId>,
    /// Last object produced
    pub object: Option<CachedObject<T>>,
    /// Last failure; always newer than `object` when both are present
    pub error: Option<Stamped<Arc<FetchError>>>,
    pub validators: Validators,
    /// Start of the last successful poll, used when no `Last-Modified` is held
    pub last_poll_started: DateTime<Utc>,
    /// Cache hits since the last download
    pub access_count: u32,
}

impl<T> Default for EntryState<T> {
    fn default() -> Self {
        Self {
            owner: None,
            object: None,
            error: None,
            validators: Validators::default(),
            last_poll_started: DateTime::<Utc>::UNIX_EPOCH,
            access_count: 0,
        }
    }
}

impl<T> EntryState<T> {
    // == Has Cached State ==
    /// Returns true if an object or an error is held.
    pub fn has_cached_state(&self) -> bool {
        self.object.is_some() || self.error.is_some()
    }

    // == Is Downloading ==
    /// Returns true while some caller owns the entry.
    pub fn is_downloading(&self) -> bool {
        self.owner.is_some()
    }

    // == Needs Poll ==
    /// Whether a new download is needed at `now`.
    ///
    /// Polls when nothing is cached, or when everything cached (object and
    /// error alike) is at least `max_age` old.
    pub fn needs_poll(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if !self.has_cached_state() {
            return true;
        }
        let object_stale = self
            .object
            .as_ref()
            .map_or(true, |o| o.is_stale(now, max_age));
        let error_stale = self
            .error
            .as_ref()
            .map_or(true, |e| e.is_stale(now, max_age));
        object_stale && error_stale
    }

    // == Accessed ==
    /// Counts a read that was served from this entry.
    pub fn accessed(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
    }
}

// == Cache Entry ==
/// One URL's cache entry: state behind a mutex plus a notifier that wakes
/// callers waiting for the current download to settle.
#[derive(Debug)]
pub struct CacheEntry<T> {
    url: String,
    state: Mutex<EntryState<T>>,
    settled: Notify,
}

impl<T> CacheEntry<T> {
    // == Constructor ==
    /// Creates an empty entry nobody is downloading.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_state(url, EntryState::default())
    }

    // == Claimed By ==
    /// Creates an empty entry already claimed by `owner`.
    pub fn claimed_by(url: impl Into<String>, owner: CallerId) -> Self {
        Self::with_state(
            url,
            EntryState {
                owner: Some(owner),
                ..EntryState::default()
            },
        )
    }

    fn with_state(url: impl Into<String>, state: EntryState<T>) -> Self {
        Self {
            url: url.into(),
            state: Mutex::new(state),
            settled: Notify::new(),
        }
    }

    // == Url ==
    /// The URL this entry caches.
    pub fn url(&self) -> &str {
        &self.url
    }

    // == Lock ==
    /// Locks the entry monitor.
    ///
    /// State is only ever changed in complete steps, so a poisoned lock still
    /// guards consistent fields.
    pub fn lock(&self) -> MutexGuard<'_, EntryState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Settled ==
    /// The notifier signalled whenever a download on this entry finishes.
    pub fn settled(&self) -> &Notify {
        &self.settled
    }

    // == Notify Settled ==
    /// Wakes every caller currently waiting on this entry.
    pub fn notify_settled(&self) {
        self.settled.notify_waiters();
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn state_with(object_at: Option<i64>, error_at: Option<i64>) -> EntryState<String> {
        EntryState {
            object: object_at.map(|t| CachedObject::new(Arc::new("obj".to_string()), at(t))),
            error: error_at.map(|t| {
                Stamped::new(Arc::new(FetchError::Transport("down".to_string())), at(t))
            }),
            ..EntryState::default()
        }
    }

    #[test]
    fn test_empty_entry_needs_poll() {
        let state = state_with(None, None);
        assert!(state.needs_poll(at(0), Duration::seconds(300)));
    }

    #[test]
    fn test_fresh_object_does_not_need_poll() {
        let state = state_with(Some(1000), None);
        assert!(!state.needs_poll(at(1299), Duration::seconds(300)));
    }

    #[test]
    fn test_stale_boundary_is_inclusive() {
        let state = state_with(Some(1000), None);
        assert!(state.needs_poll(at(1300), Duration::seconds(300)));
    }

    #[test]
    fn test_fresh_error_suppresses_poll_even_with_stale_object() {
        let state = state_with(Some(0), Some(1000));
        assert!(!state.needs_poll(at(1100), Duration::seconds(300)));
    }

    #[test]
    fn test_everything_stale_needs_poll() {
        let state = state_with(Some(0), Some(100));
        assert!(state.needs_poll(at(1000), Duration::seconds(300)));
    }

    #[test]
    fn test_verified_object_is_fresh_despite_old_creation() {
        let mut state = state_with(Some(0), None);
        if let Some(object) = state.object.as_mut() {
            object.verified_at = at(1000);
        }
        assert!(!state.needs_poll(at(1100), Duration::seconds(300)));
        assert_eq!(state.object.as_ref().map(|o| o.created_at), Some(at(0)));
    }

    #[test]
    fn test_access_count_saturates() {
        let mut state = state_with(None, None);
        state.access_count = u32::MAX;
        state.accessed();
        assert_eq!(state.access_count, u32::MAX);
    }

    #[test]
    fn test_claimed_entry_is_downloading() {
        let owner = CallerId::next();
        let entry: CacheEntry<String> = CacheEntry::claimed_by("http://a/", owner);
        assert_eq!(entry.lock().owner, Some(owner));
        assert!(entry.lock().is_downloading());
        assert_eq!(entry.url(), "http://a/");
    }

    #[test]
    fn test_caller_ids_are_unique() {
        assert_ne!(CallerId::next(), CallerId::next());
    }
}
