//! Health snapshots, error events, and the periodic sampler.
//!
//! The sampler is the single producer of [`HealthSnapshot`]s: once per tick
//! it queries the media engine, reads OS resources, and derives the "stuck"
//! condition. Probe failures never propagate out of the sampling path; they
//! become synthetic error-state snapshots and the loop backs off.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::{EngineHandle, PipelineState};
use crate::epoch_ms;
use crate::sysprobe;

/// Error taxonomy for recorded events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient pipeline error, recoverable via nudge.
    PipelineError,
    /// Pipeline wedged in an intermediate state.
    StuckState,
    /// Disk/memory threshold crossings.
    ResourceExhaustion,
    /// Engine process dead or unreachable; only a full restart recovers.
    ProcessFatal,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PipelineError => write!(f, "pipeline_error"),
            Self::StuckState => write!(f, "stuck_state"),
            Self::ResourceExhaustion => write!(f, "resource_exhaustion"),
            Self::ProcessFatal => write!(f, "process_fatal"),
        }
    }
}

/// One recorded failure. Immutable once recorded; only removed by window
/// pruning or history truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub timestamp_ms: u64,
    pub category: ErrorCategory,
    pub message: String,
    /// Pipeline state observed when the error was recorded.
    pub pipeline_state: PipelineState,
    /// Recovery action taken in response, if any.
    pub action_taken: Option<String>,
}

impl ErrorEvent {
    #[must_use]
    pub fn new(
        category: ErrorCategory,
        message: impl Into<String>,
        pipeline_state: PipelineState,
        action_taken: Option<String>,
    ) -> Self {
        Self {
            timestamp_ms: epoch_ms(),
            category,
            message: message.into(),
            pipeline_state,
            action_taken,
        }
    }
}

/// One periodic point-in-time health measurement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp_ms: u64,
    pub pipeline_state: PipelineState,
    /// Whether the media engine's process is alive.
    pub engine_alive: bool,
    /// Whether output artifacts have been updated recently.
    pub artifacts_live: bool,
    /// Cumulative error count at snapshot time.
    pub error_count: u64,
    /// Cumulative full-process restart count at snapshot time.
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_rss_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_memory_percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_usage_percent: Option<f64>,
}

/// Cumulative counters carried into each snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SampleCounters {
    pub error_count: u64,
    pub restart_count: u32,
}

/// Result of one sampler tick.
#[derive(Debug, Clone)]
pub struct SampleOutcome {
    pub snapshot: HealthSnapshot,
    /// Sampler-flagged stuck condition for this tick.
    pub stuck: bool,
    /// The engine/OS probe itself failed; the snapshot is synthetic and the
    /// loop should back off for the failure cooldown before the next tick.
    pub probe_failed: bool,
}

/// Sampler configuration.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Normal cadence between samples.
    pub interval: Duration,
    /// Back-off after a probe failure, longer than the cadence so a
    /// persistently failing query is not hot-looped.
    pub failure_cooldown: Duration,
    /// Consecutive intermediate-state samples before flagging stuck.
    pub stuck_threshold: u32,
    /// Bound on each engine probe.
    pub probe_timeout: Duration,
    /// Directory of output artifacts used as a liveness proxy.
    pub artifact_dir: PathBuf,
    /// Artifact older than this means the stream is not live.
    pub artifact_fresh_within: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            failure_cooldown: Duration::from_secs(30),
            stuck_threshold: 5,
            probe_timeout: Duration::from_secs(5),
            artifact_dir: PathBuf::from("/tmp/hls"),
            artifact_fresh_within: Duration::from_secs(30),
        }
    }
}

/// Periodic probe that assembles health snapshots and derives the stuck
/// condition.
#[derive(Debug)]
pub struct HealthSampler {
    config: SamplerConfig,
    consecutive_intermediate: u32,
}

impl HealthSampler {
    #[must_use]
    pub fn new(config: SamplerConfig) -> Self {
        Self {
            config,
            consecutive_intermediate: 0,
        }
    }

    #[must_use]
    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Run one probe cycle. Never returns an error: probe failures become a
    /// synthetic error-state snapshot with `probe_failed` set.
    pub async fn sample(&mut self, engine: &EngineHandle, counters: SampleCounters) -> SampleOutcome {
        let probed =
            tokio::time::timeout(self.config.probe_timeout, engine.status()).await;

        let status = match probed {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return self.failure_outcome(counters, e.to_string()),
            Err(_) => {
                return self.failure_outcome(
                    counters,
                    format!(
                        "engine probe timed out after {:?}",
                        self.config.probe_timeout
                    ),
                );
            }
        };

        let stuck = self.track_stuck(status.state);
        let resources = sysprobe::read_resources(&self.config.artifact_dir);
        let artifacts_live = crate::reclaim::newest_artifact_age(&self.config.artifact_dir)
            .is_some_and(|age| age <= self.config.artifact_fresh_within);

        let snapshot = HealthSnapshot {
            timestamp_ms: epoch_ms(),
            pipeline_state: status.state,
            engine_alive: status.process_alive,
            artifacts_live,
            error_count: counters.error_count,
            restart_count: counters.restart_count,
            last_error: status.last_error,
            process_rss_mb: resources.process_rss_mb,
            system_memory_percent: resources.system_memory_percent,
            disk_usage_percent: resources.disk_usage_percent,
        };

        SampleOutcome {
            snapshot,
            stuck,
            probe_failed: false,
        }
    }

    /// Update and evaluate the consecutive-intermediate counter.
    fn track_stuck(&mut self, state: PipelineState) -> bool {
        if state.is_intermediate() {
            self.consecutive_intermediate = self.consecutive_intermediate.saturating_add(1);
        } else {
            self.consecutive_intermediate = 0;
        }
        self.consecutive_intermediate >= self.config.stuck_threshold
    }

    fn failure_outcome(&mut self, counters: SampleCounters, message: String) -> SampleOutcome {
        warn!(error = %message, "health probe failed, recording synthetic snapshot");
        // A failed probe says nothing about intermediate states; the stuck
        // streak does not advance.
        let resources = sysprobe::read_resources(&self.config.artifact_dir);
        let snapshot = HealthSnapshot {
            timestamp_ms: epoch_ms(),
            pipeline_state: PipelineState::Error,
            engine_alive: false,
            artifacts_live: false,
            error_count: counters.error_count,
            restart_count: counters.restart_count,
            last_error: Some(message),
            process_rss_mb: resources.process_rss_mb,
            system_memory_percent: resources.system_memory_percent,
            disk_usage_percent: resources.disk_usage_percent,
        };
        SampleOutcome {
            snapshot,
            stuck: false,
            probe_failed: true,
        }
    }
}
