//! Versioned invalidation for cached responses.
//!
//! A [`ResponseTracker`] is a monotonically increasing counter attached to a
//! key. Responses capture its version; once the tracker moves past the
//! captured version the response is stale.


use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::RequestKey;
use crate::TrackerConfig;

#[derive(Default)]
pub struct ResponseTracker {
    base: AtomicI64,
    sub_trackers: Mutex<Vec<Arc<ResponseTracker>>>,
}

impl fmt::Debug for ResponseTracker {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ResponseTracker")
            .field("version", &self.version())
            .field("sub_trackers", &self.sub_trackers.lock().len())
            .finish()
    }
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Own counter plus the versions of every sub-tracker.
    pub fn version(&self) -> i64 {
        let mut visiting = Vec::new();
        self.version_guarded(&mut visiting)
    }

    fn version_guarded(
        &self,
        visiting: &mut Vec<*const ResponseTracker>,
    ) -> i64 {
        let this = self as *const ResponseTracker;
        // A cycle contributes nothing the second time round.
        if visiting.contains(&this) {
            return 0;
        }
        visiting.push(this);
        let subs = self.sub_trackers.lock().clone();
        let mut version = self.base.load(Ordering::Acquire);
        for sub in &subs {
            version += sub.version_guarded(visiting);
        }
        visiting.pop();
        version
    }

    pub fn increment_version(&self) {
        self.base.fetch_add(1, Ordering::AcqRel);
    }

    /// Replaces the sub-trackers without changing the current version.
    ///
    /// Later bumps of any new sub-tracker raise this tracker's version.
    pub fn update_sub_trackers(
        &self,
        sub_trackers: Vec<Arc<ResponseTracker>>,
    ) {
        let current = self.version();
        let incoming: i64 = sub_trackers
            .iter()
            .filter(|sub| !std::ptr::eq(Arc::as_ptr(sub), self))
            .map(|sub| sub.version())
            .sum();
        *self.sub_trackers.lock() = sub_trackers;
        self.base.store(current - incoming, Ordering::Release);
    }
}

/// Per-property map from key to a weakly held tracker.
///
/// Trackers live as long as some response references them. Dead entries are
/// swept lazily once the map grows past a threshold, at most once per
/// interval.
pub struct ResponseTrackerManager<K: RequestKey> {
    trackers: HashMap<K, Weak<ResponseTracker>>,
    cleanup_threshold: usize,
    cleanup_interval: Duration,
    last_cleanup: Option<Instant>,
}

impl<K: RequestKey> Default for ResponseTrackerManager<K> {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}

impl<K: RequestKey> ResponseTrackerManager<K> {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            trackers: HashMap::new(),
            cleanup_threshold: config.cleanup_threshold,
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
            last_cleanup: None,
        }
    }

    pub fn get_or_add_tracker(
        &mut self,
        key: &K,
    ) -> Arc<ResponseTracker> {
        self.cleanup_if_needed();
        if let Some(tracker) = self.trackers.get(key).and_then(Weak::upgrade) {
            return tracker;
        }
        let tracker = Arc::new(ResponseTracker::new());
        self.trackers.insert(key.clone(), Arc::downgrade(&tracker));
        tracker
    }

    pub fn tracker(
        &self,
        key: &K,
    ) -> Option<Arc<ResponseTracker>> {
        self.trackers.get(key).and_then(Weak::upgrade)
    }

    /// Bumps the tracker of `key`, if one is still alive.
    pub fn increment_version(
        &mut self,
        key: &K,
    ) {
        self.cleanup_if_needed();
        match self.tracker(key) {
            Some(tracker) => tracker.increment_version(),
            None => {
                self.trackers.remove(key);
            }
        }
    }

    /// Number of entries, dead ones included.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    fn cleanup_if_needed(&mut self) {
        if self.trackers.len() <= self.cleanup_threshold {
            return;
        }
        let now = Instant::now();
        if let Some(last) = self.last_cleanup {
            if now.duration_since(last) < self.cleanup_interval {
                return;
            }
        }
        self.last_cleanup = Some(now);
        let before = self.trackers.len();
        self.trackers.retain(|_, tracker| tracker.strong_count() > 0);
        debug!(
            "swept {} dead response trackers, {} left",
            before - self.trackers.len(),
            self.trackers.len()
        );
    }
}
