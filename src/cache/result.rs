//! Fetch Result Module
//!
//! Immutable snapshot handed back from a fetch.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::entry::EntryState;
use crate::error::FetchError;

// == Fetch Outcome ==
/// What happened during a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    /// A download was attempted by this or another caller and did not produce
    /// a new object. A previously cached object may still be present.
    DownloadFailed,
    /// Another caller is downloading right now and this caller chose not to
    /// wait. Whatever was cached before is returned.
    DownloadingNow,
    /// A download just completed, by this or another caller. A "not modified"
    /// answer from the origin also counts.
    DownloadSuccess,
    /// The cached object was fresh enough that no download was needed.
    UsedCached,
}

// == Fetch Result ==
/// Copy of an entry's object and error taken at the moment a fetch returned.
#[derive(Debug)]
pub struct FetchResult<T> {
    outcome: FetchOutcome,
    object: Option<Arc<T>>,
    object_created_at: Option<DateTime<Utc>>,
    error: Option<Arc<FetchError>>,
    error_created_at: Option<DateTime<Utc>>,
}

impl<T> Clone for FetchResult<T> {
    fn clone(&self) -> Self {
        Self {
            outcome: self.outcome,
            object: self.object.clone(),
            object_created_at: self.object_created_at,
            error: self.error.clone(),
            error_created_at: self.error_created_at,
        }
    }
}

impl<T> FetchResult<T> {
    // == Snapshot ==
    /// Snapshots `state`. Caller holds the entry monitor.
    pub(crate) fn snapshot(outcome: FetchOutcome, state: &EntryState<T>) -> Self {
        Self {
            outcome,
            object: state.object.as_ref().map(|o| Arc::clone(&o.value)),
            object_created_at: state.object.as_ref().map(|o| o.created_at),
            error: state.error.as_ref().map(|e| Arc::clone(&e.value)),
            error_created_at: state.error.as_ref().map(|e| e.created_at),
        }
    }

    // == Unrecorded Failure ==
    /// A failed result carrying `error` that was never recorded on any entry.
    pub(crate) fn unrecorded_failure(
        error: FetchError,
        now: DateTime<Utc>,
        object: Option<(Arc<T>, DateTime<Utc>)>,
    ) -> Self {
        let (object, object_created_at) = match object {
            Some((object, created_at)) => (Some(object), Some(created_at)),
            None => (None, None),
        };
        Self {
            outcome: FetchOutcome::DownloadFailed,
            object,
            object_created_at,
            error: Some(Arc::new(error)),
            error_created_at: Some(now),
        }
    }

    // == Outcome ==
    /// What happened during the fetch.
    pub fn outcome(&self) -> FetchOutcome {
        self.outcome
    }

    // == Object ==
    /// The most recent object for the URL, even if the latest download failed.
    pub fn object(&self) -> Option<&Arc<T>> {
        self.object.as_ref()
    }

    // == Object Created At ==
    /// When the returned object's poll started. `None` when there is no object.
    pub fn object_created_at(&self) -> Option<DateTime<Utc>> {
        self.object_created_at
    }

    // == Error ==
    /// The failure of the most recent download attempt, if it failed.
    pub fn error(&self) -> Option<&Arc<FetchError>> {
        self.error.as_ref()
    }

    // == Error Created At ==
    /// When the returned error was recorded.
    pub fn error_created_at(&self) -> Option<DateTime<Utc>> {
        self.error_created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CachedObject, Stamped};

    #[test]
    fn test_snapshot_is_independent_of_later_mutation() {
        let mut state: EntryState<String> = EntryState::default();
        let created = Utc::now();
        state.object = Some(CachedObject::new(Arc::new("v1".to_string()), created));

        let result = FetchResult::snapshot(FetchOutcome::DownloadSuccess, &state);

        state.object = Some(CachedObject::new(Arc::new("v2".to_string()), Utc::now()));
        state.error = Some(Stamped::new(
            Arc::new(FetchError::Transport("reset".to_string())),
            Utc::now(),
        ));

        assert_eq!(result.object().map(|o| o.as_str()), Some("v1"));
        assert_eq!(result.object_created_at(), Some(created));
        assert!(result.error().is_none());
        assert!(result.error_created_at().is_none());
    }

    #[test]
    fn test_unrecorded_failure_keeps_object() {
        let created = Utc::now();
        let result = FetchResult::unrecorded_failure(
            FetchError::Recursive {
                url: "http://a/".to_string(),
            },
            Utc::now(),
            Some((Arc::new(7u32), created)),
        );

        assert_eq!(result.outcome(), FetchOutcome::DownloadFailed);
        assert_eq!(result.object().map(|o| **o), Some(7));
        assert!(matches!(
            result.error().map(|e| e.as_ref()),
            Some(FetchError::Recursive { .. })
        ));
    }
}
