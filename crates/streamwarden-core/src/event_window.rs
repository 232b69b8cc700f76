//! Trailing time-window event tally.
//!
//! Answers "how many items occurred in the last W seconds" over a sequence
//! of timestamped entries. Pruning is lazy (performed on read/write, never on
//! a separate timer) and idempotent. The same structure drives both the
//! supervisor's error-rate decisions and alert deduplication, parameterized
//! independently per use.

use std::collections::VecDeque;
use std::time::Duration;

use crate::epoch_ms;

/// Default hard cap on retained entries, independent of the time window.
///
/// A hot error loop must not grow the window without bound between prunes;
/// once full, the oldest entry is evicted first.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// A trailing time-window view over timestamped items.
#[derive(Debug, Clone)]
pub struct EventWindow<T> {
    entries: VecDeque<(u64, T)>,
    max_entries: usize,
}

impl<T> Default for EventWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> EventWindow<T> {
    /// Create a window with the default entry cap.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    /// Create a window with an explicit entry cap.
    #[must_use]
    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Append an item stamped with the current wall-clock time.
    pub fn record(&mut self, item: T) {
        self.record_at(item, epoch_ms());
    }

    /// Append an item with an explicit epoch-ms timestamp.
    ///
    /// Deterministic primitive used by tests and replay paths. Timestamps
    /// are expected to be non-decreasing; out-of-order entries are accepted
    /// but prune based on position, not re-sorting.
    pub fn record_at(&mut self, item: T, timestamp_ms: u64) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back((timestamp_ms, item));
    }

    /// Count items with timestamps in `[now - window, now]`.
    ///
    /// Prunes older items as a side effect. Calling repeatedly with no new
    /// events never changes the result.
    pub fn count(&mut self, window: Duration) -> usize {
        self.count_at(window, epoch_ms())
    }

    /// Deterministic variant of [`Self::count`] with an explicit "now".
    pub fn count_at(&mut self, window: Duration, now_ms: u64) -> usize {
        self.prune(window, now_ms);
        self.entries.len()
    }

    /// Drop entries older than `now - window`.
    pub fn prune(&mut self, window: Duration, now_ms: u64) {
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(window_ms);
        while let Some((ts, _)) = self.entries.front() {
            if *ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// The retained items, oldest first, without pruning.
    pub fn items(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(_, item)| item)
    }

    /// The retained entries with their timestamps, oldest first, without
    /// pruning.
    pub fn entries(&self) -> impl Iterator<Item = (u64, &T)> {
        self.entries.iter().map(|(ts, item)| (*ts, item))
    }

    /// Number of retained entries, without pruning.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp of the most recent entry, if any.
    #[must_use]
    pub fn last_timestamp_ms(&self) -> Option<u64> {
        self.entries.back().map(|(ts, _)| *ts)
    }

    /// Drop all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
