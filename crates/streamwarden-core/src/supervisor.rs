//! In-process escalation ladder.
//!
//! Evaluated once per sampler tick, the supervisor converts accumulated
//! evidence (error-window counts, the sampler's stuck flag, resource
//! readings) into tiered recovery actions. Tiers are independent; more than
//! one may fire on the same tick. The most severe tier, a full-process
//! restart, is effected by a deliberate exit with [`crate::RESTART_EXIT_CODE`]
//! so the OS service supervisor respawns the process fresh.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::engine::{EngineHandle, PipelineState};
use crate::epoch_ms;
use crate::event_window::EventWindow;
use crate::health::{ErrorCategory, ErrorEvent, SampleOutcome};
use crate::reclaim;
use crate::status_store::StatusStore;

/// Restart-ladder thresholds.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Errors within the window that trigger a full-process restart.
    pub max_errors: u32,
    /// Trailing window for error counting.
    pub error_window: Duration,
    /// Lifetime cap on automatic full-process restarts.
    pub max_restarts: u32,
    /// Delay between scheduling a restart and exiting, so the process does
    /// not restart straight into a transiently failing dependency.
    pub restart_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_errors: 5,
            error_window: Duration::from_secs(300),
            max_restarts: 5,
            restart_delay: Duration::from_secs(30),
        }
    }
}

/// Resource-reclamation thresholds, deliberately independent of the restart
/// ladder.
#[derive(Debug, Clone)]
pub struct ReclaimPolicy {
    /// Disk usage that triggers a normal artifact trim.
    pub disk_cleanup_percent: f64,
    /// Disk usage that triggers the emergency trim plus log rotation.
    pub disk_emergency_percent: f64,
    /// Artifacts kept by the normal trim, newest first.
    pub artifact_keep_count: usize,
    /// Artifacts kept by the emergency trim.
    pub emergency_keep_count: usize,
    /// Process RSS that triggers history truncation.
    pub memory_cleanup_mb: u64,
    /// Process RSS that triggers the aggressive truncation.
    pub memory_emergency_mb: u64,
    /// System memory percent that triggers the aggressive truncation.
    pub system_memory_emergency_percent: f64,
    /// History cap applied by the normal truncation.
    pub history_trim_cap: usize,
    /// History cap applied by the aggressive truncation.
    pub history_minimal_cap: usize,
    /// Directory of output artifacts.
    pub artifact_dir: PathBuf,
    /// Log file rotated during emergency cleanup, if configured.
    pub log_path: Option<PathBuf>,
    /// Rotation threshold for the log file.
    pub log_max_bytes: u64,
}

impl Default for ReclaimPolicy {
    fn default() -> Self {
        Self {
            disk_cleanup_percent: 70.0,
            disk_emergency_percent: 90.0,
            artifact_keep_count: 5,
            emergency_keep_count: 2,
            memory_cleanup_mb: 700,
            memory_emergency_mb: 1000,
            system_memory_emergency_percent: 90.0,
            history_trim_cap: 50,
            history_minimal_cap: 10,
            artifact_dir: PathBuf::from("/tmp/hls"),
            log_path: None,
            log_max_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Ladder state derived from accumulated evidence, not a stored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderState {
    Healthy,
    Degraded,
    Stuck,
    RestartScheduled,
    Exhausted,
}

/// One recovery action taken during a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Stop and restart the pipeline in place, process untouched.
    PipelineNudge,
    /// Trimmed output artifacts down to `kept`.
    TrimArtifacts { removed: usize, kept: usize },
    /// Emergency trim plus log rotation.
    EmergencyTrim { removed: usize, log_rotated: bool },
    /// Truncated in-memory histories to `cap` entries.
    TruncateHistory { cap: usize },
    /// Full-process restart scheduled; the runtime exits after `delay`.
    RestartScheduled { delay: Duration },
}

/// Outcome of one supervisor tick.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub actions: Vec<RecoveryAction>,
    /// Set exactly once over the process lifetime; the runtime reacts by
    /// sleeping the restart delay and exiting.
    pub restart_scheduled: bool,
}

/// The escalation ladder.
#[derive(Debug)]
pub struct RecoverySupervisor {
    policy: RestartPolicy,
    reclaim: ReclaimPolicy,
    errors: EventWindow<ErrorCategory>,
    restart_count: u32,
    restart_pending: bool,
}

impl RecoverySupervisor {
    #[must_use]
    pub fn new(policy: RestartPolicy, reclaim: ReclaimPolicy) -> Self {
        Self {
            policy,
            reclaim,
            errors: EventWindow::new(),
            restart_count: 0,
            restart_pending: false,
        }
    }

    /// Restore the lifetime restart count after a process respawn.
    pub fn set_restart_count(&mut self, count: u32) {
        self.restart_count = count;
    }

    #[must_use]
    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    #[must_use]
    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Record an error into the restart window. Resource-exhaustion events
    /// are kept out of the window; reclamation runs independently of the
    /// restart ladder.
    pub fn record_error(&mut self, category: ErrorCategory) {
        self.record_error_at(category, epoch_ms());
    }

    pub fn record_error_at(&mut self, category: ErrorCategory, now_ms: u64) {
        if category != ErrorCategory::ResourceExhaustion {
            self.errors.record_at(category, now_ms);
        }
    }

    /// Whether the error window warrants scheduling a full-process restart.
    #[must_use]
    pub fn should_restart(&mut self) -> bool {
        self.should_restart_at(epoch_ms())
    }

    #[must_use]
    pub fn should_restart_at(&mut self, now_ms: u64) -> bool {
        if self.restart_pending || self.restart_count >= self.policy.max_restarts {
            return false;
        }
        let in_window = self.errors.count_at(self.policy.error_window, now_ms);
        in_window >= self.policy.max_errors as usize
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.restart_count >= self.policy.max_restarts
    }

    /// Ladder state as a function of the current evidence.
    #[must_use]
    pub fn ladder_state(&mut self, stuck: bool) -> LadderState {
        self.ladder_state_at(stuck, epoch_ms())
    }

    #[must_use]
    pub fn ladder_state_at(&mut self, stuck: bool, now_ms: u64) -> LadderState {
        if self.is_exhausted() {
            return LadderState::Exhausted;
        }
        if self.restart_pending {
            return LadderState::RestartScheduled;
        }
        let in_window = self.errors.count_at(self.policy.error_window, now_ms);
        if in_window >= self.policy.max_errors as usize {
            return LadderState::RestartScheduled;
        }
        if stuck {
            return LadderState::Stuck;
        }
        if in_window > 0 {
            return LadderState::Degraded;
        }
        LadderState::Healthy
    }

    /// Evaluate one sampler outcome and run every tier that fires.
    ///
    /// Errors from individual actions are logged and recorded, never
    /// propagated; the loop must survive indefinitely.
    pub async fn evaluate(
        &mut self,
        outcome: &SampleOutcome,
        engine: &EngineHandle,
        store: &StatusStore,
    ) -> TickReport {
        let mut report = TickReport::default();
        let state = outcome.snapshot.pipeline_state;

        if outcome.probe_failed {
            self.record_store_error(
                store,
                ErrorCategory::ProcessFatal,
                outcome
                    .snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "engine unreachable".to_string()),
                state,
                None,
            );
        } else if state == PipelineState::Error {
            self.record_store_error(
                store,
                ErrorCategory::PipelineError,
                outcome
                    .snapshot
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "pipeline reported error state".to_string()),
                state,
                None,
            );
        }

        if outcome.stuck {
            self.nudge_pipeline(engine, store, state).await;
            report.actions.push(RecoveryAction::PipelineNudge);
        }

        self.reclaim_resources(outcome, store, &mut report);

        if self.should_restart() {
            self.restart_pending = true;
            // Counted at schedule time, not at exit; the gate above stops a
            // second restart from being scheduled before the process dies.
            self.restart_count += 1;
            store.record_restart();
            store.record_event(ErrorEvent::new(
                ErrorCategory::ProcessFatal,
                format!(
                    "error threshold reached ({} in {:?}), full restart scheduled",
                    self.policy.max_errors, self.policy.error_window
                ),
                state,
                Some("full_process_restart".to_string()),
            ));
            warn!(
                restart_count = self.restart_count,
                max_restarts = self.policy.max_restarts,
                delay_secs = self.policy.restart_delay.as_secs(),
                "full-process restart scheduled"
            );
            report.restart_scheduled = true;
            report.actions.push(RecoveryAction::RestartScheduled {
                delay: self.policy.restart_delay,
            });
        } else if self.is_exhausted() && !self.errors.is_empty() {
            info!(
                restart_count = self.restart_count,
                "restart budget exhausted, relying on watchdog escalation"
            );
        }

        report
    }

    async fn nudge_pipeline(
        &mut self,
        engine: &EngineHandle,
        store: &StatusStore,
        state: PipelineState,
    ) {
        info!(state = ?state, "pipeline stuck, nudging in place");
        let message = match engine.restart_pipeline().await {
            Ok(()) => format!("pipeline stuck in {state:?}, nudged in place"),
            Err(e) => {
                error!(error = %e, "pipeline nudge failed");
                format!("pipeline stuck in {state:?}, nudge failed: {e}")
            }
        };
        self.record_store_error(
            store,
            ErrorCategory::StuckState,
            message,
            state,
            Some("pipeline_nudge".to_string()),
        );
    }

    fn reclaim_resources(
        &mut self,
        outcome: &SampleOutcome,
        store: &StatusStore,
        report: &mut TickReport,
    ) {
        let snapshot = &outcome.snapshot;
        let state = snapshot.pipeline_state;

        if let Some(disk) = snapshot.disk_usage_percent {
            if disk > self.reclaim.disk_emergency_percent {
                let removed = self.trim(self.reclaim.emergency_keep_count);
                let log_rotated = self.rotate_log();
                self.record_store_error(
                    store,
                    ErrorCategory::ResourceExhaustion,
                    format!("disk at {disk:.1}%, emergency trim removed {removed} artifacts"),
                    state,
                    Some("emergency_trim".to_string()),
                );
                report
                    .actions
                    .push(RecoveryAction::EmergencyTrim { removed, log_rotated });
            } else if disk > self.reclaim.disk_cleanup_percent {
                let removed = self.trim(self.reclaim.artifact_keep_count);
                self.record_store_error(
                    store,
                    ErrorCategory::ResourceExhaustion,
                    format!("disk at {disk:.1}%, trimmed {removed} artifacts"),
                    state,
                    Some("artifact_trim".to_string()),
                );
                report.actions.push(RecoveryAction::TrimArtifacts {
                    removed,
                    kept: self.reclaim.artifact_keep_count,
                });
            }
        }

        let system_emergency = snapshot
            .system_memory_percent
            .is_some_and(|pct| pct > self.reclaim.system_memory_emergency_percent);
        let process_emergency = snapshot
            .process_rss_mb
            .is_some_and(|mb| mb > self.reclaim.memory_emergency_mb);
        let process_high = snapshot
            .process_rss_mb
            .is_some_and(|mb| mb > self.reclaim.memory_cleanup_mb);

        if system_emergency || process_high {
            let cap = if system_emergency || process_emergency {
                self.reclaim.history_minimal_cap
            } else {
                self.reclaim.history_trim_cap
            };
            store.truncate_histories(cap);
            let message = if system_emergency {
                format!(
                    "system memory at {:.1}%, history truncated to {cap}",
                    snapshot.system_memory_percent.unwrap_or_default()
                )
            } else {
                format!(
                    "process rss {}MB over {}MB, history truncated to {cap}",
                    snapshot.process_rss_mb.unwrap_or_default(),
                    self.reclaim.memory_cleanup_mb
                )
            };
            self.record_store_error(
                store,
                ErrorCategory::ResourceExhaustion,
                message,
                state,
                Some("history_truncation".to_string()),
            );
            report
                .actions
                .push(RecoveryAction::TruncateHistory { cap });
        }
    }

    fn trim(&self, keep: usize) -> usize {
        match reclaim::trim_artifacts(&self.reclaim.artifact_dir, keep) {
            Ok(removed) => removed,
            Err(e) => {
                error!(error = %e, dir = %self.reclaim.artifact_dir.display(), "artifact trim failed");
                0
            }
        }
    }

    fn rotate_log(&self) -> bool {
        let Some(path) = &self.reclaim.log_path else {
            return false;
        };
        match reclaim::rotate_log(path, self.reclaim.log_max_bytes) {
            Ok(rotated) => rotated,
            Err(e) => {
                error!(error = %e, path = %path.display(), "log rotation failed");
                false
            }
        }
    }

    fn record_store_error(
        &mut self,
        store: &StatusStore,
        category: ErrorCategory,
        message: String,
        state: PipelineState,
        action: Option<String>,
    ) {
        self.record_error(category);
        store.record_event(ErrorEvent::new(category, message, state, action));
    }
}
