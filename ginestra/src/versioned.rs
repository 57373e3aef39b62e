//! Version stamping for every value installed in the load balancer state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A property value (or its absence) stamped with the global version at which
/// it was installed.
///
/// Items are never mutated: every update of a property creates a new item.
#[derive(Debug)]
pub struct VersionedItem<T: ?Sized> {
    value: Option<Arc<T>>,
    version: u64,
    timestamp_ms: i64,
}

impl<T: ?Sized> Clone for VersionedItem<T> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            version: self.version,
            timestamp_ms: self.timestamp_ms,
        }
    }
}

impl<T: ?Sized> VersionedItem<T> {
    /// Stamp `value` with an explicit `version`.
    ///
    /// Use [`VersionCounter::stamp`] to draw a fresh version instead.
    pub fn new(value: Option<Arc<T>>, version: u64) -> Self {
        Self {
            value,
            version,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// The stored value, `None` if discovery reported the property without data.
    pub fn value(&self) -> Option<&Arc<T>> {
        self.value.as_ref()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Wall clock time (milliseconds since the unix epoch) at which the item was created.
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// The single monotonic counter that orders mutations across all property kinds.
///
/// Every handler draws from the same counter, so a version observed on a
/// service entry can be compared against one observed on an endpoint set.
#[derive(Debug, Default)]
pub struct VersionCounter(AtomicU64);

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next version.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The last version handed out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Reset the counter. Only called from the event queue.
    pub(crate) fn set(&self, version: u64) {
        self.0.store(version, Ordering::SeqCst);
    }

    /// Wrap `value` in a [`VersionedItem`] carrying a freshly drawn version.
    pub fn stamp<T: ?Sized>(&self, value: Option<Arc<T>>) -> VersionedItem<T> {
        VersionedItem::new(value, self.next())
    }
}
