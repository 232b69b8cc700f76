//! Bounded, concurrently readable snapshot/event history.
//!
//! The monitor task is the single writer; it mutates the inner history and
//! republishes an immutable [`StatusView`] behind an `Arc` swap. Readers
//! (the HTTP surface) clone the current `Arc` and never block on, or observe
//! a partial write from, the writer.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use crate::epoch_ms;
use crate::health::{ErrorEvent, HealthSnapshot};

/// Default cap on retained snapshots/events.
pub const DEFAULT_HISTORY_CAP: usize = 100;

/// Immutable published view of the store.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    /// Retained snapshots, oldest first.
    pub snapshots: Vec<HealthSnapshot>,
    /// Retained error events, oldest first.
    pub events: Vec<ErrorEvent>,
    /// Cumulative error count since process start (not pruned).
    pub error_count: u64,
    /// Cumulative full-process restart count (monotonic).
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Epoch ms when the store (process) started.
    pub started_at_ms: u64,
    /// Whether the monitor loop is running.
    pub monitoring_active: bool,
}

impl StatusView {
    /// Uptime derived from the store's start time.
    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        epoch_ms().saturating_sub(self.started_at_ms) / 1000
    }

    /// Most recent snapshot, if any.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<&HealthSnapshot> {
        self.snapshots.last()
    }

    /// Error events within the trailing `window` ending now.
    #[must_use]
    pub fn recent_error_count(&self, window: Duration) -> usize {
        let cutoff =
            epoch_ms().saturating_sub(u64::try_from(window.as_millis()).unwrap_or(u64::MAX));
        self.events
            .iter()
            .filter(|e| e.timestamp_ms >= cutoff)
            .count()
    }
}

#[derive(Debug)]
struct Inner {
    snapshots: Vec<HealthSnapshot>,
    events: Vec<ErrorEvent>,
    history_cap: usize,
    error_count: u64,
    restart_count: u32,
    last_error: Option<String>,
    started_at_ms: u64,
    monitoring_active: bool,
}

impl Inner {
    fn view(&self) -> StatusView {
        StatusView {
            snapshots: self.snapshots.clone(),
            events: self.events.clone(),
            error_count: self.error_count,
            restart_count: self.restart_count,
            last_error: self.last_error.clone(),
            started_at_ms: self.started_at_ms,
            monitoring_active: self.monitoring_active,
        }
    }
}

/// The bounded history store.
#[derive(Debug)]
pub struct StatusStore {
    inner: Mutex<Inner>,
    published: RwLock<Arc<StatusView>>,
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAP)
    }
}

impl StatusStore {
    #[must_use]
    pub fn new(history_cap: usize) -> Self {
        let inner = Inner {
            snapshots: Vec::new(),
            events: Vec::new(),
            history_cap: history_cap.max(1),
            error_count: 0,
            restart_count: 0,
            last_error: None,
            started_at_ms: epoch_ms(),
            monitoring_active: false,
        };
        let view = Arc::new(inner.view());
        Self {
            inner: Mutex::new(inner),
            published: RwLock::new(view),
        }
    }

    /// Current published view. Cheap; never blocks on the writer beyond the
    /// atomic pointer swap.
    #[must_use]
    pub fn view(&self) -> Arc<StatusView> {
        Arc::clone(&self.published.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Append a snapshot, evicting the oldest past the cap.
    pub fn record_snapshot(&self, snapshot: HealthSnapshot) {
        self.mutate(|inner| {
            if inner.snapshots.len() >= inner.history_cap {
                inner.snapshots.remove(0);
            }
            inner.snapshots.push(snapshot);
        });
    }

    /// Append an error event and bump the cumulative counter.
    pub fn record_event(&self, event: ErrorEvent) {
        self.mutate(|inner| {
            inner.error_count += 1;
            inner.last_error = Some(event.message.clone());
            if inner.events.len() >= inner.history_cap {
                inner.events.remove(0);
            }
            inner.events.push(event);
        });
    }

    /// Seed the restart counter from persisted state after a respawn.
    pub fn set_restart_count(&self, count: u32) {
        self.mutate(|inner| {
            inner.restart_count = count;
        });
    }

    /// Bump the restart counter, once per scheduled restart.
    pub fn record_restart(&self) {
        self.mutate(|inner| {
            inner.restart_count += 1;
        });
    }

    pub fn set_monitoring_active(&self, active: bool) {
        self.mutate(|inner| {
            inner.monitoring_active = active;
        });
    }

    /// Shrink retained histories to `cap` entries (newest kept) as part of
    /// memory reclamation. Cumulative counters are untouched.
    pub fn truncate_histories(&self, cap: usize) {
        self.mutate(|inner| {
            let cap = cap.max(1);
            if inner.snapshots.len() > cap {
                inner.snapshots.drain(..inner.snapshots.len() - cap);
            }
            if inner.events.len() > cap {
                inner.events.drain(..inner.events.len() - cap);
            }
        });
    }

    /// Cumulative counters for the sampler.
    #[must_use]
    pub fn counters(&self) -> crate::health::SampleCounters {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        crate::health::SampleCounters {
            error_count: inner.error_count,
            restart_count: inner.restart_count,
        }
    }

    fn mutate(&self, f: impl FnOnce(&mut Inner)) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut inner);
        let view = Arc::new(inner.view());
        drop(inner);
        *self.published.write().unwrap_or_else(|e| e.into_inner()) = view;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PipelineState;
    use crate::health::ErrorCategory;

    fn snapshot(ts: u64) -> HealthSnapshot {
        HealthSnapshot {
            timestamp_ms: ts,
            pipeline_state: PipelineState::Running,
            engine_alive: true,
            artifacts_live: true,
            error_count: 0,
            restart_count: 0,
            last_error: None,
            process_rss_mb: None,
            system_memory_percent: None,
            disk_usage_percent: None,
        }
    }

    fn event(ts: u64) -> ErrorEvent {
        ErrorEvent {
            timestamp_ms: ts,
            category: ErrorCategory::PipelineError,
            message: format!("error at {ts}"),
            pipeline_state: PipelineState::Error,
            action_taken: None,
        }
    }

    #[test]
    fn history_is_bounded_oldest_evicted_first() {
        let store = StatusStore::new(3);
        for ts in 0..5_u64 {
            store.record_snapshot(snapshot(ts));
        }
        let view = store.view();
        assert_eq!(view.snapshots.len(), 3);
        assert_eq!(view.snapshots[0].timestamp_ms, 2);
        assert_eq!(view.snapshots[2].timestamp_ms, 4);
    }

    #[test]
    fn event_recording_bumps_cumulative_counter_past_eviction() {
        let store = StatusStore::new(2);
        for ts in 0..5_u64 {
            store.record_event(event(ts));
        }
        let view = store.view();
        assert_eq!(view.events.len(), 2);
        assert_eq!(view.error_count, 5);
        assert_eq!(view.last_error.as_deref(), Some("error at 4"));
    }

    #[test]
    fn readers_see_stable_views_across_writes() {
        let store = StatusStore::new(10);
        store.record_snapshot(snapshot(1));
        let before = store.view();
        store.record_snapshot(snapshot(2));
        let after = store.view();
        // The earlier Arc is unchanged by the later write.
        assert_eq!(before.snapshots.len(), 1);
        assert_eq!(after.snapshots.len(), 2);
    }

    #[test]
    fn truncate_keeps_newest_and_counters() {
        let store = StatusStore::new(50);
        for ts in 0..10_u64 {
            store.record_snapshot(snapshot(ts));
            store.record_event(event(ts));
        }
        store.truncate_histories(3);
        let view = store.view();
        assert_eq!(view.snapshots.len(), 3);
        assert_eq!(view.events.len(), 3);
        assert_eq!(view.snapshots[0].timestamp_ms, 7);
        assert_eq!(view.error_count, 10);
    }

    #[test]
    fn restart_count_is_monotonic() {
        let store = StatusStore::default();
        store.record_restart();
        store.record_restart();
        assert_eq!(store.view().restart_count, 2);
        assert_eq!(store.counters().restart_count, 2);
    }

    #[test]
    fn recent_error_count_uses_trailing_window() {
        let store = StatusStore::new(50);
        let now = epoch_ms();
        store.record_event(event(now.saturating_sub(10 * 60 * 1000)));
        store.record_event(event(now.saturating_sub(60 * 1000)));
        store.record_event(event(now));
        let view = store.view();
        assert_eq!(view.recent_error_count(Duration::from_secs(300)), 2);
    }
}
