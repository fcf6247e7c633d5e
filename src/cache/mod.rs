//! Cache Module
//!
//! URL-keyed object cache with single-flight downloads, conditional
//! refreshes and LRU-bounded storage.

mod coordinator;
mod entry;
mod lru;
mod result;
mod stats;
mod store;
mod wait_mode;


// Re-export public types
pub use coordinator::{CacheAdmin, CacheSettings, UrlObjectCache};
pub use entry::{CacheEntry, CachedObject, CallerId, EntryState, Stamped, Validators};
pub use lru::LruTracker;
pub use result::{FetchOutcome, FetchResult};
pub use stats::CacheStats;
pub use store::{EntryStore, LruEntryStore};
pub use wait_mode::WaitMode;
