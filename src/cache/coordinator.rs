//! Cache Coordinator Module
//!
//! Single-flight download coordination for URL-keyed objects.
//!
//! At most one caller downloads a given URL at a time. Every other caller
//! either waits for that download or takes whatever is already cached,
//! depending on its [`WaitMode`]. Two locks are involved, always taken in
//! this order and never held across network I/O:
//!
//! 1. the store lock, held just long enough to look up, insert or remove an
//!    entry;
//! 2. the entry's own monitor, held while reading or publishing its fields.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::cache::entry::{CacheEntry, CachedObject, CallerId, EntryState, Stamped};
use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheStats, EntryStore, FetchOutcome, FetchResult, WaitMode};
use crate::error::FetchError;
use crate::fetch::{Download, ResourceFetcher};

tokio::task_local! {
    /// Identity of the caller whose download is running on this task.
    static CURRENT_CALLER: CallerId;
}

/// Identity of the logical caller making a fetch.
///
/// Fetches issued from inside a download inherit the downloader's identity.
fn current_caller() -> CallerId {
    CURRENT_CALLER
        .try_with(|caller| *caller)
        .unwrap_or_else(|_| CallerId::next())
}

/// Margin before expiry by which a proactive refresh must have started.
/// Look-aheads shorter than this use the whole look-ahead instead.
const REFRESH_START_SLACK: Duration = Duration::from_secs(30);

// == Cache Settings ==
/// Tuning knobs for a [`UrlObjectCache`].
#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Human-readable name of what is cached, used in log messages
    pub resource_description: String,
    /// Age after which cached state is polled again
    pub max_age: Duration,
    /// How long `resolve` keeps handing out an object after a failed refresh;
    /// `None` means forever
    pub max_stale_age: Option<Duration>,
    /// Wait mode used by `resolve`
    pub default_wait_mode: WaitMode,
    /// Longest a caller waits on someone else's download; `None` means forever
    pub wait_timeout: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            resource_description: "remote resource".to_string(),
            max_age: Duration::from_secs(300),
            max_stale_age: None,
            default_wait_mode: WaitMode::Initial,
            wait_timeout: Some(Duration::from_secs(60)),
        }
    }
}

/// What to do once Step 1 (store lookup) is over.
enum Claim<T> {
    /// This caller created the entry and must download it
    Created(Arc<CacheEntry<T>>),
    /// The entry already existed
    Existing(Arc<CacheEntry<T>>),
    /// This caller is already downloading the URL
    Recursive,
}

/// What to do once the entry itself has been inspected.
enum Decision<T> {
    Return(FetchResult<T>),
    Wait,
    Refresh,
}

// == Url Object Cache ==
/// A cache of objects downloaded from URLs.
pub struct UrlObjectCache<T, F, S> {
    fetcher: F,
    store: Mutex<S>,
    settings: CacheSettings,
    max_age: chrono::Duration,
    stats: StatsRecorder,
    _object: PhantomData<fn() -> T>,
}

impl<T, F, S> UrlObjectCache<T, F, S>
where
    T: Send + Sync + 'static,
    F: ResourceFetcher<T>,
    S: EntryStore<T>,
{
    // == Constructor ==
    /// Creates a cache that downloads through `fetcher` and keeps its
    /// entries in `store`.
    pub fn new(fetcher: F, store: S, settings: CacheSettings) -> Self {
        let max_age = chrono::Duration::from_std(settings.max_age)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        Self {
            fetcher,
            store: Mutex::new(store),
            settings,
            max_age,
            stats: StatsRecorder::default(),
            _object: PhantomData,
        }
    }

    // == Settings ==
    /// Returns the tuning this cache was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    // == Fetcher ==
    /// Returns the fetcher used for downloads.
    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    // == Fetch ==
    /// Fetches the object for `url`, using a cached copy when one is fresh.
    ///
    /// If a download is needed and nobody else is running one, it runs on
    /// this task. If another caller is already downloading, `wait_mode`
    /// decides whether to wait for it or return what is cached right now.
    pub async fn fetch(&self, url: &str, wait_mode: WaitMode) -> FetchResult<T> {
        let caller = current_caller();

        let claim = {
            let mut store = self.store.lock().await;
            match store.get(url) {
                None => {
                    let entry = Arc::new(CacheEntry::claimed_by(url, caller));
                    store.put(url.to_string(), Arc::clone(&entry));
                    Claim::Created(entry)
                }
                Some(entry) if entry.lock().owner == Some(caller) => Claim::Recursive,
                Some(entry) => Claim::Existing(entry),
            }
        };

        let entry = match claim {
            Claim::Created(entry) => {
                debug!("URL '{}' is not in the cache; contacting server", url);
                return self.download(entry, caller, false).await;
            }
            Claim::Recursive => {
                warn!("Recursive fetch of URL '{}' refused", url);
                self.stats.record_recursive();
                return FetchResult::unrecorded_failure(
                    FetchError::Recursive {
                        url: url.to_string(),
                    },
                    Utc::now(),
                    None,
                );
            }
            Claim::Existing(entry) => entry,
        };

        match self.inspect(&entry, caller, wait_mode) {
            Decision::Return(result) => result,
            Decision::Wait => self.wait_for_download(&entry).await,
            Decision::Refresh => {
                debug!("Cache entry for URL '{}' is too old; contacting server", url);
                self.download(entry, caller, true).await
            }
        }
    }

    // == Inspect ==
    /// Looks at an existing entry and either answers from it, decides to wait
    /// on the current download, or claims the entry for a new download.
    fn inspect(&self, entry: &CacheEntry<T>, caller: CallerId, wait_mode: WaitMode) -> Decision<T> {
        let mut state = entry.lock();

        if state.is_downloading() {
            if wait_mode.waits(state.has_cached_state()) {
                return Decision::Wait;
            }
            trace!(
                "Returning cached entry for URL '{}' without waiting for other download",
                entry.url()
            );
            self.stats.record_downloading_now();
            return Decision::Return(FetchResult::snapshot(FetchOutcome::DownloadingNow, &state));
        }

        if !state.needs_poll(Utc::now(), self.max_age) {
            state.accessed();
            self.stats.record_used_cached();
            let outcome = if state.error.is_some() {
                FetchOutcome::DownloadFailed
            } else {
                FetchOutcome::UsedCached
            };
            return Decision::Return(FetchResult::snapshot(outcome, &state));
        }

        state.owner = Some(caller);
        Decision::Refresh
    }

    // == Wait For Download ==
    /// Waits until nobody is downloading `entry`, then snapshots it.
    async fn wait_for_download(&self, entry: &CacheEntry<T>) -> FetchResult<T> {
        self.stats.record_wait();
        let started = Instant::now();
        let deadline = self
            .settings
            .wait_timeout
            .and_then(|timeout| started.checked_add(timeout));

        loop {
            let notified = entry.settled().notified();
            tokio::pin!(notified);
            // Register before checking so a completion in between is not missed
            notified.as_mut().enable();

            if let Some(result) = settled_snapshot(entry) {
                return result;
            }

            trace!("Waiting for other download of URL '{}'", entry.url());
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        let waited = started.elapsed();
                        warn!(
                            "Gave up after {:?} waiting for download of URL '{}'",
                            waited,
                            entry.url()
                        );
                        let object = {
                            let state = entry.lock();
                            state
                                .object
                                .as_ref()
                                .map(|o| (Arc::clone(&o.value), o.created_at))
                        };
                        return FetchResult::unrecorded_failure(
                            FetchError::WaitTimeout {
                                url: entry.url().to_string(),
                                waited,
                            },
                            Utc::now(),
                            object,
                        );
                    }
                }
            }
        }
    }

    // == Download ==
    /// Downloads `entry`, which `caller` has just claimed, and publishes the
    /// result to everyone waiting on it.
    async fn download(
        &self,
        entry: Arc<CacheEntry<T>>,
        caller: CallerId,
        refresh: bool,
    ) -> FetchResult<T> {
        self.stats.record_download();
        let guard = DownloadGuard::new(&entry);
        let poll_started = Utc::now();

        let (previous, validators, last_poll_started) = {
            let state = entry.lock();
            (
                state.object.as_ref().map(|o| Arc::clone(&o.value)),
                state.validators.clone(),
                state.last_poll_started,
            )
        };

        let url = entry.url();
        let polled = CURRENT_CALLER
            .scope(caller, async {
                if refresh {
                    self.fetcher.before_refresh(url, previous.as_ref());
                }
                self.fetcher.get(url, &validators, last_poll_started).await
            })
            .await;

        let result = match polled {
            Ok(download) => publish_success(&entry, poll_started, download),
            Err(err) => {
                warn!(
                    "Unable to download {} from '{}': {}",
                    self.settings.resource_description, url, err
                );
                publish_failure(&entry, err)
            }
        };
        guard.disarm();

        self.stats.record_download_outcome(result.outcome());
        if result.outcome() == FetchOutcome::DownloadSuccess {
            info!("Fetched {} from URL '{}'", self.settings.resource_description, url);
        }
        result
    }

    // == Resolve ==
    /// Resolves `url` to an object, preferring a cached object over a fresh
    /// failure.
    ///
    /// Uses the default wait mode. If the latest download failed but an older
    /// object is still within `max_stale_age`, that object is returned.
    /// Otherwise the latest error is returned, unwrapped to its parse error if
    /// it wraps one.
    pub async fn resolve(&self, url: &str) -> Result<Arc<T>, FetchError> {
        let result = self.fetch(url, self.settings.default_wait_mode).await;

        if let (Some(object), created_at) = (result.object(), result.object_created_at()) {
            match result.error() {
                None => return Ok(Arc::clone(object)),
                Some(err) => {
                    let within_stale_age = match (self.settings.max_stale_age, created_at) {
                        (None, _) => true,
                        (Some(max_stale_age), Some(created_at)) => {
                            (Utc::now() - created_at).to_std().unwrap_or_default() <= max_stale_age
                        }
                        (Some(_), None) => false,
                    };
                    if within_stale_age {
                        warn!(
                            "Reusing cached {} for URL '{}' after failed refresh: {}",
                            self.settings.resource_description, url, err
                        );
                        return Ok(Arc::clone(object));
                    }
                }
            }
        }

        match result.error() {
            Some(err) => Err(err.parse_cause().unwrap_or(err.as_ref()).clone()),
            None => Err(FetchError::NothingAvailable {
                url: url.to_string(),
            }),
        }
    }

    // == Evict ==
    /// Forgets everything cached for `url`, returning the object it held.
    ///
    /// A download already running on the evicted entry still finishes and
    /// wakes its waiters; its result is dropped with the entry.
    pub async fn evict(&self, url: &str) -> Option<Arc<T>> {
        let entry = self.remove_entry(url).await?;
        let object = entry.lock().object.as_ref().map(|o| Arc::clone(&o.value));
        object
    }

    /// Removes the entry for `url` from the store, counting the eviction.
    async fn remove_entry(&self, url: &str) -> Option<Arc<CacheEntry<T>>> {
        let entry = self.store.lock().await.remove(url)?;
        self.stats.record_eviction();
        debug!("Evicted URL '{}' from the cache", url);
        Some(entry)
    }

    // == Stats ==
    /// Returns a snapshot of the cache counters.
    pub async fn stats(&self) -> CacheStats {
        let store = self.store.lock().await;
        self.stats.snapshot(store.len(), store.capacity_evictions())
    }

    // == Length ==
    /// Returns the number of cached URLs.
    pub async fn len(&self) -> usize {
        self.store.lock().await.len()
    }

    // == Is Empty ==
    pub async fn is_empty(&self) -> bool {
        self.store.lock().await.is_empty()
    }
}

impl<T, F, S> UrlObjectCache<T, F, S>
where
    T: Send + Sync + 'static,
    F: ResourceFetcher<T> + 'static,
    S: EntryStore<T> + 'static,
{
    // == Refresh Expiring ==
    /// Starts background refreshes of entries that will be stale within
    /// `pre_expiry`.
    ///
    /// Only entries that hold an object, were read since their last
    /// download and whose last attempt succeeded are refreshed; failed
    /// entries wait for a caller to retry them. Returns the number of
    /// refreshes started.
    pub async fn refresh_expiring(self: &Arc<Self>, pre_expiry: Duration) -> usize {
        let refresh_time = chrono::Duration::from_std(pre_expiry)
            .ok()
            .and_then(|look_ahead| Utc::now().checked_add_signed(look_ahead))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let candidates: Vec<Arc<CacheEntry<T>>> = {
            let store = self.store.lock().await;
            store
                .entries()
                .into_iter()
                .filter(|entry| wants_refresh(&entry.lock(), refresh_time, self.max_age))
                .collect()
        };

        let start_window = if pre_expiry > REFRESH_START_SLACK {
            pre_expiry - REFRESH_START_SLACK
        } else {
            pre_expiry
        };
        let give_up_at = Instant::now().checked_add(start_window);
        let count = candidates.len();
        for entry in candidates {
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                cache.refresh_entry(entry, give_up_at).await;
            });
        }
        if count > 0 {
            debug!("Scheduled refresh of {} cache entries", count);
        }
        count
    }

    /// Claims `entry` and refreshes it unless it is already downloading or
    /// `give_up_at` has passed.
    async fn refresh_entry(&self, entry: Arc<CacheEntry<T>>, give_up_at: Option<Instant>) {
        if give_up_at.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!("Skipping late refresh of URL '{}'", entry.url());
            return;
        }

        let caller = CallerId::next();
        {
            let mut state = entry.lock();
            if state.is_downloading() {
                return;
            }
            state.owner = Some(caller);
        }

        info!("Cache entry for URL '{}' needs refresh; contacting server", entry.url());
        let result = self.download(entry, caller, true).await;
        if let Some(err) = result.error() {
            warn!("Background refresh failed: {}", err);
        }
    }
}

// == Cache Admin ==
/// Object-type-erased view of a cache for the admin API.
#[async_trait]
pub trait CacheAdmin: Send + Sync {
    /// Returns a snapshot of the cache counters.
    async fn stats(&self) -> CacheStats;

    /// Drops `url` from the cache. Returns whether an entry was present.
    async fn evict(&self, url: &str) -> bool;
}

#[async_trait]
impl<T, F, S> CacheAdmin for UrlObjectCache<T, F, S>
where
    T: Send + Sync + 'static,
    F: ResourceFetcher<T>,
    S: EntryStore<T>,
{
    async fn stats(&self) -> CacheStats {
        UrlObjectCache::stats(self).await
    }

    async fn evict(&self, url: &str) -> bool {
        self.remove_entry(url).await.is_some()
    }
}

/// Snapshot of `entry` once nobody is downloading it.
fn settled_snapshot<T>(entry: &CacheEntry<T>) -> Option<FetchResult<T>> {
    let state = entry.lock();
    if state.is_downloading() {
        return None;
    }
    let outcome = if state.error.is_some() {
        FetchOutcome::DownloadFailed
    } else {
        FetchOutcome::DownloadSuccess
    };
    Some(FetchResult::snapshot(outcome, &state))
}

fn wants_refresh<T>(state: &EntryState<T>, at: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    !state.is_downloading()
        && state.access_count > 0
        && state.object.is_some()
        && state.error.is_none()
        && state.needs_poll(at, max_age)
}

fn publish_success<T>(
    entry: &CacheEntry<T>,
    poll_started: DateTime<Utc>,
    download: Download<T>,
) -> FetchResult<T> {
    let Download {
        object,
        mut validators,
    } = download;

    let result = {
        let mut state = entry.lock();
        let mut last_poll_started = poll_started;

        match object {
            Some(object) => {
                state.object = Some(CachedObject::new(Arc::new(object), poll_started));
            }
            None => {
                if let Some(cached) = state.object.as_mut() {
                    cached.verified_at = poll_started;
                }
                // A different Last-Modified on a "not modified" answer means
                // our copy predates a change; make the next poll unconditional.
                let changed = matches!(
                    (&state.validators.last_modified, &validators.last_modified),
                    (Some(held), Some(reported)) if held != reported
                );
                if changed {
                    validators.last_modified = None;
                    last_poll_started = DateTime::<Utc>::UNIX_EPOCH;
                }
            }
        }

        state.validators = validators;
        state.last_poll_started = last_poll_started;
        state.error = None;
        state.access_count = 0;
        state.owner = None;
        FetchResult::snapshot(FetchOutcome::DownloadSuccess, &state)
    };

    entry.notify_settled();
    result
}

fn publish_failure<T>(entry: &CacheEntry<T>, err: FetchError) -> FetchResult<T> {
    let result = {
        let mut state = entry.lock();
        state.error = Some(Stamped::new(Arc::new(err), Utc::now()));
        state.access_count = 0;
        state.owner = None;
        FetchResult::snapshot(FetchOutcome::DownloadFailed, &state)
    };

    entry.notify_settled();
    result
}

// == Download Guard ==
/// Releases a claimed entry if its download never reports back, whether
/// because the fetcher panicked or because the owning future was dropped.
struct DownloadGuard<'a, T> {
    entry: &'a CacheEntry<T>,
    armed: bool,
}

impl<'a, T> DownloadGuard<'a, T> {
    fn new(entry: &'a CacheEntry<T>) -> Self {
        Self { entry, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<T> Drop for DownloadGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        {
            let mut state = self.entry.lock();
            state.access_count = 0;
            state.error = Some(Stamped::new(
                Arc::new(FetchError::Internal {
                    url: self.entry.url().to_string(),
                }),
                Utc::now(),
            ));
            state.owner = None;
        }
        self.entry.notify_settled();
        warn!("Download of URL '{}' ended unexpectedly", self.entry.url());
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{LruEntryStore, Validators};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Scripted fetcher: pops one reply per call, counting calls.
    struct ScriptedFetcher {
        replies: StdMutex<Vec<Result<Download<String>, FetchError>>>,
        calls: AtomicUsize,
        seen: StdMutex<Vec<(Validators, DateTime<Utc>)>>,
        delay: Duration,
    }

    impl ScriptedFetcher {
        fn new(mut replies: Vec<Result<Download<String>, FetchError>>) -> Self {
            replies.reverse();
            Self {
                replies: StdMutex::new(replies),
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceFetcher<String> for ScriptedFetcher {
        async fn get(
            &self,
            url: &str,
            validators: &Validators,
            last_poll_started: DateTime<Utc>,
        ) -> Result<Download<String>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen
                .lock()
                .unwrap()
                .push((validators.clone(), last_poll_started));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(FetchError::Transport(format!("no reply for {}", url))))
        }
    }

    type TestCache = UrlObjectCache<String, ScriptedFetcher, LruEntryStore<String>>;

    fn modified(body: &str, last_modified: Option<&str>) -> Result<Download<String>, FetchError> {
        Ok(Download::modified(
            body.to_string(),
            Validators {
                last_modified: last_modified.map(String::from),
                etag: None,
            },
        ))
    }

    fn not_modified(last_modified: Option<&str>) -> Result<Download<String>, FetchError> {
        Ok(Download::not_modified(Validators {
            last_modified: last_modified.map(String::from),
            etag: None,
        }))
    }

    fn cache_with(fetcher: ScriptedFetcher, max_age: Duration) -> TestCache {
        UrlObjectCache::new(
            fetcher,
            LruEntryStore::new(16),
            CacheSettings {
                max_age,
                ..CacheSettings::default()
            },
        )
    }

    const URL: &str = "http://example.com/schema.xsd";

    #[tokio::test]
    async fn test_first_fetch_downloads() {
        let cache = cache_with(ScriptedFetcher::new(vec![modified("v1", None)]), Duration::from_secs(60));

        let result = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(result.outcome(), FetchOutcome::DownloadSuccess);
        assert_eq!(result.object().map(|o| o.as_str()), Some("v1"));
        assert!(result.object_created_at().is_some());
        assert!(result.error().is_none());
        assert_eq!(cache.fetcher().calls(), 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_is_used_without_download() {
        let cache = cache_with(ScriptedFetcher::new(vec![modified("v1", None)]), Duration::from_secs(60));

        cache.fetch(URL, WaitMode::Latest).await;
        let result = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(result.outcome(), FetchOutcome::UsedCached);
        assert_eq!(result.object().map(|o| o.as_str()), Some("v1"));
        assert_eq!(cache.fetcher().calls(), 1);
        assert_eq!(cache.stats().await.used_cached, 1);
    }

    #[tokio::test]
    async fn test_fresh_error_is_reported_without_download() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![Err(FetchError::Transport("refused".to_string()))]),
            Duration::from_secs(60),
        );

        assert_eq!(cache.fetch(URL, WaitMode::Latest).await.outcome(), FetchOutcome::DownloadFailed);
        let result = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(result.outcome(), FetchOutcome::DownloadFailed);
        assert!(result.error().is_some());
        assert_eq!(cache.fetcher().calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_object() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![
                modified("v1", None),
                Err(FetchError::Transport("reset".to_string())),
            ]),
            Duration::ZERO,
        );

        let first = cache.fetch(URL, WaitMode::Latest).await;
        let second = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(second.outcome(), FetchOutcome::DownloadFailed);
        assert_eq!(second.object().map(|o| o.as_str()), Some("v1"));
        assert_eq!(second.object_created_at(), first.object_created_at());
        assert_eq!(
            second.error().map(|e| e.as_ref()),
            Some(&FetchError::Transport("reset".to_string()))
        );
    }

    #[tokio::test]
    async fn test_successful_refresh_clears_error() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![
                Err(FetchError::Transport("reset".to_string())),
                modified("v2", None),
            ]),
            Duration::ZERO,
        );

        cache.fetch(URL, WaitMode::Latest).await;
        let result = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(result.outcome(), FetchOutcome::DownloadSuccess);
        assert!(result.error().is_none());
        assert_eq!(result.object().map(|o| o.as_str()), Some("v2"));
    }

    #[tokio::test]
    async fn test_not_modified_keeps_object_and_creation_time() {
        let lm = "Sun, 06 Nov 1994 08:49:37 GMT";
        let cache = cache_with(
            ScriptedFetcher::new(vec![modified("v1", Some(lm)), not_modified(Some(lm))]),
            Duration::ZERO,
        );

        let first = cache.fetch(URL, WaitMode::Latest).await;
        let second = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(second.outcome(), FetchOutcome::DownloadSuccess);
        assert!(Arc::ptr_eq(second.object().unwrap(), first.object().unwrap()));
        assert_eq!(second.object_created_at(), first.object_created_at());

        let seen = cache.fetcher().seen.lock().unwrap().clone();
        assert_eq!(seen[0].0, Validators::default());
        assert_eq!(seen[0].1, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(seen[1].0.last_modified.as_deref(), Some(lm));
    }

    #[tokio::test]
    async fn test_not_modified_with_different_last_modified_forces_full_poll() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![
                modified("v1", Some("Mon, 01 Jan 2024 00:00:00 GMT")),
                not_modified(Some("Tue, 02 Jan 2024 00:00:00 GMT")),
                modified("v2", None),
            ]),
            Duration::ZERO,
        );

        cache.fetch(URL, WaitMode::Latest).await;
        cache.fetch(URL, WaitMode::Latest).await;
        let third = cache.fetch(URL, WaitMode::Latest).await;

        assert_eq!(third.object().map(|o| o.as_str()), Some("v2"));
        let seen = cache.fetcher().seen.lock().unwrap().clone();
        assert_eq!(seen[2].0.last_modified, None);
        assert_eq!(seen[2].1, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_last_poll_time_is_passed_when_no_last_modified() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![modified("v1", None), not_modified(None)]),
            Duration::ZERO,
        );

        let first = cache.fetch(URL, WaitMode::Latest).await;
        cache.fetch(URL, WaitMode::Latest).await;

        let seen = cache.fetcher().seen.lock().unwrap().clone();
        assert_eq!(Some(seen[1].1), first.object_created_at());
    }

    #[tokio::test]
    async fn test_evict_returns_object_and_forces_new_download() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![modified("v1", None), modified("v2", None)]),
            Duration::from_secs(60),
        );

        cache.fetch(URL, WaitMode::Latest).await;
        let evicted = cache.evict(URL).await;
        assert_eq!(evicted.as_deref().map(String::as_str), Some("v1"));
        assert!(cache.evict(URL).await.is_none());

        let result = cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(result.outcome(), FetchOutcome::DownloadSuccess);
        assert_eq!(result.object().map(|o| o.as_str()), Some("v2"));
        assert_eq!(cache.stats().await.evictions, 1);
    }

    #[tokio::test]
    async fn test_resolve_prefers_stale_object_over_error() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![
                modified("v1", None),
                Err(FetchError::Transport("reset".to_string())),
            ]),
            Duration::ZERO,
        );

        assert_eq!(cache.resolve(URL).await.unwrap().as_str(), "v1");
        assert_eq!(cache.resolve(URL).await.unwrap().as_str(), "v1");
    }

    #[tokio::test]
    async fn test_resolve_respects_max_stale_age() {
        let cache = UrlObjectCache::new(
            ScriptedFetcher::new(vec![
                modified("v1", None),
                Err(FetchError::Transport("reset".to_string())),
            ]),
            LruEntryStore::new(4),
            CacheSettings {
                max_age: Duration::ZERO,
                max_stale_age: Some(Duration::ZERO),
                ..CacheSettings::default()
            },
        );

        cache.resolve(URL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(
            cache.resolve(URL).await.unwrap_err(),
            FetchError::Transport("reset".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_unwraps_parse_error() {
        let cache = cache_with(
            ScriptedFetcher::new(vec![Err(FetchError::Parse("bad xml".to_string())
                .context("compiling schema"))]),
            Duration::from_secs(60),
        );

        assert_eq!(
            cache.resolve(URL).await.unwrap_err(),
            FetchError::Parse("bad xml".to_string())
        );
    }

    #[tokio::test]
    async fn test_recursive_fetch_fails_immediately() {
        struct RecursiveFetcher {
            cache: std::sync::OnceLock<std::sync::Weak<UrlObjectCache<String, RecursiveFetcher, LruEntryStore<String>>>>,
            inner: StdMutex<Option<FetchOutcome>>,
        }

        #[async_trait]
        impl ResourceFetcher<String> for RecursiveFetcher {
            async fn get(
                &self,
                url: &str,
                _validators: &Validators,
                _last_poll_started: DateTime<Utc>,
            ) -> Result<Download<String>, FetchError> {
                let cache = self.cache.get().and_then(|weak| weak.upgrade()).unwrap();
                let nested = cache.fetch(url, WaitMode::Latest).await;
                *self.inner.lock().unwrap() = Some(nested.outcome());
                Ok(Download::modified("outer".to_string(), Validators::default()))
            }
        }

        let cache = Arc::new(UrlObjectCache::new(
            RecursiveFetcher {
                cache: std::sync::OnceLock::new(),
                inner: StdMutex::new(None),
            },
            LruEntryStore::new(4),
            CacheSettings::default(),
        ));
        cache.fetcher().cache.set(Arc::downgrade(&cache)).ok();

        let result = tokio::time::timeout(Duration::from_secs(5), cache.fetch(URL, WaitMode::Latest))
            .await
            .expect("recursive fetch must not deadlock");

        assert_eq!(result.outcome(), FetchOutcome::DownloadSuccess);
        assert_eq!(*cache.fetcher().inner.lock().unwrap(), Some(FetchOutcome::DownloadFailed));
        assert_eq!(cache.stats().await.recursive_fetches, 1);
    }

    #[tokio::test]
    async fn test_never_returns_downloading_now_while_download_runs() {
        let cache = Arc::new(cache_with(
            ScriptedFetcher::new(vec![modified("v1", None)]).with_delay(Duration::from_millis(300)),
            Duration::from_secs(60),
        ));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let result = cache.fetch(URL, WaitMode::Never).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(result.outcome(), FetchOutcome::DownloadingNow);
        assert!(result.object().is_none());
        assert!(result.error().is_none());

        owner.await.unwrap();
        assert_eq!(cache.fetcher().calls(), 1);
    }

    #[tokio::test]
    async fn test_wait_timeout_leaves_entry_alone() {
        let cache = Arc::new(UrlObjectCache::new(
            ScriptedFetcher::new(vec![modified("v1", None)]).with_delay(Duration::from_millis(400)),
            LruEntryStore::new(4),
            CacheSettings {
                wait_timeout: Some(Duration::from_millis(50)),
                ..CacheSettings::default()
            },
        ));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(waiter.outcome(), FetchOutcome::DownloadFailed);
        assert!(matches!(
            waiter.error().map(|e| e.as_ref()),
            Some(FetchError::WaitTimeout { .. })
        ));

        let owned = owner.await.unwrap();
        assert_eq!(owned.outcome(), FetchOutcome::DownloadSuccess);
        assert!(owned.error().is_none());
    }

    #[tokio::test]
    async fn test_dropped_owner_releases_waiters_with_internal_error() {
        let cache = Arc::new(cache_with(
            ScriptedFetcher::new(vec![modified("v1", None)]).with_delay(Duration::from_secs(30)),
            Duration::from_secs(60),
        ));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        owner.abort();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter must be released")
            .unwrap();
        assert_eq!(result.outcome(), FetchOutcome::DownloadFailed);
        assert!(matches!(
            result.error().map(|e| e.as_ref()),
            Some(FetchError::Internal { .. })
        ));
    }

    #[tokio::test]
    async fn test_refresh_expiring_skips_unread_and_failed_entries() {
        let cache = Arc::new(cache_with(
            ScriptedFetcher::new(vec![
                modified("read", None),
                modified("unread", None),
                Err(FetchError::Transport("down".to_string())),
            ]),
            Duration::from_secs(60),
        ));

        cache.fetch("http://a/read", WaitMode::Latest).await;
        cache.fetch("http://a/unread", WaitMode::Latest).await;
        cache.fetch("http://a/failed", WaitMode::Latest).await;
        // Count one hit on the first and the failed entries
        cache.fetch("http://a/read", WaitMode::Latest).await;
        cache.fetch("http://a/failed", WaitMode::Latest).await;

        assert_eq!(cache.refresh_expiring(Duration::from_secs(10)).await, 0);
        assert_eq!(cache.refresh_expiring(Duration::from_secs(120)).await, 1);
    }

    #[tokio::test]
    async fn test_initial_returns_previous_object_while_refresh_runs() {
        let cache = Arc::new(cache_with(
            ScriptedFetcher::new(vec![modified("v1", None), modified("v2", None)])
                .with_delay(Duration::from_millis(300)),
            Duration::ZERO,
        ));
        let first = cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(first.object().map(|o| o.as_str()), Some("v1"));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        let current = cache.fetch(URL, WaitMode::Initial).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(current.outcome(), FetchOutcome::DownloadingNow);
        assert_eq!(current.object().map(|o| o.as_str()), Some("v1"));
        assert_eq!(current.object_created_at(), first.object_created_at());

        let latest = cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(latest.outcome(), FetchOutcome::DownloadSuccess);
        assert_eq!(latest.object().map(|o| o.as_str()), Some("v2"));

        let owned = owner.await.unwrap();
        assert_eq!(owned.object().map(|o| o.as_str()), Some("v2"));
        assert_eq!(cache.fetcher().calls(), 2);
    }

    #[tokio::test]
    async fn test_resolve_without_cached_state_reports_nothing_available() {
        let cache = Arc::new(UrlObjectCache::new(
            ScriptedFetcher::new(vec![modified("v1", None)]).with_delay(Duration::from_millis(300)),
            LruEntryStore::new(4),
            CacheSettings {
                default_wait_mode: WaitMode::Never,
                ..CacheSettings::default()
            },
        ));

        let owner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            cache.resolve(URL).await.unwrap_err(),
            FetchError::NothingAvailable {
                url: URL.to_string()
            }
        );

        owner.await.unwrap();
        assert_eq!(cache.resolve(URL).await.unwrap().as_str(), "v1");
    }

    /// Fetcher that counts `before_refresh` calls and can panic in the next one.
    struct HookedFetcher {
        calls: AtomicUsize,
        refreshes: AtomicUsize,
        saw_previous: AtomicBool,
        panic_next_refresh: AtomicBool,
    }

    impl HookedFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                refreshes: AtomicUsize::new(0),
                saw_previous: AtomicBool::new(false),
                panic_next_refresh: AtomicBool::new(false),
            }
        }

        fn refreshes(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceFetcher<String> for HookedFetcher {
        async fn get(
            &self,
            _url: &str,
            _validators: &Validators,
            _last_poll_started: DateTime<Utc>,
        ) -> Result<Download<String>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(Download::modified(format!("v{}", call), Validators::default()))
        }

        fn before_refresh(&self, _url: &str, previous: Option<&Arc<String>>) {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            self.saw_previous.store(previous.is_some(), Ordering::SeqCst);
            if self.panic_next_refresh.swap(false, Ordering::SeqCst) {
                panic!("refresh hook failed");
            }
        }
    }

    fn hooked_cache(max_age: Duration) -> Arc<UrlObjectCache<String, HookedFetcher, LruEntryStore<String>>> {
        Arc::new(UrlObjectCache::new(
            HookedFetcher::new(),
            LruEntryStore::new(4),
            CacheSettings {
                max_age,
                ..CacheSettings::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_before_refresh_runs_only_on_refresh() {
        let cache = hooked_cache(Duration::ZERO);

        cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(cache.fetcher().refreshes(), 0);

        let refreshed = cache.fetch(URL, WaitMode::Latest).await;
        assert_eq!(refreshed.object().map(|o| o.as_str()), Some("v2"));
        assert_eq!(cache.fetcher().refreshes(), 1);
        assert!(cache.fetcher().saw_previous.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_refresh_hook_releases_entry() {
        let cache = hooked_cache(Duration::ZERO);
        cache.fetch(URL, WaitMode::Latest).await;
        cache.fetcher().panic_next_refresh.store(true, Ordering::SeqCst);

        let failed = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.fetch(URL, WaitMode::Latest).await })
        };
        let join_err = failed.await.unwrap_err();
        assert!(join_err.is_panic());

        let result = tokio::time::timeout(Duration::from_secs(5), cache.fetch(URL, WaitMode::Latest))
            .await
            .expect("entry must not stay claimed after a panic");
        assert_eq!(result.outcome(), FetchOutcome::DownloadSuccess);
        assert_eq!(result.object().map(|o| o.as_str()), Some("v2"));
        assert!(result.error().is_none());
        assert_eq!(cache.fetcher().refreshes(), 2);
    }
}
