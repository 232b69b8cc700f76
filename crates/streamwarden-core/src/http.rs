//! Read-only health/status surface.
//!
//! Consumed by the escalation watchdog and operator tooling. Handlers only
//! ever read the published [`StatusView`]; they can never block the monitor
//! loop that writes it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::engine::PipelineState;
use crate::health::{ErrorEvent, HealthSnapshot};
use crate::reclaim::{self, ArtifactInfo};
use crate::status_store::{StatusStore, StatusView};
use crate::Result;

/// Window used for the recent-error figure in the summary.
const RECENT_ERROR_WINDOW: Duration = Duration::from_secs(300);

/// Entries returned by the detailed endpoint.
const DETAIL_LIMIT: usize = 20;

/// Health summary returned by `GET /health` and polled by the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSummary {
    pub monitoring_active: bool,
    pub total_errors: u64,
    /// Errors within the trailing five minutes.
    pub recent_errors: usize,
    pub pipeline_state: PipelineState,
    pub stream_active: bool,
    pub engine_running: bool,
    pub restart_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub uptime_seconds: u64,
}

impl HealthSummary {
    #[must_use]
    pub fn from_view(view: &StatusView) -> Self {
        let latest = view.latest_snapshot();
        Self {
            monitoring_active: view.monitoring_active,
            total_errors: view.error_count,
            recent_errors: view.recent_error_count(RECENT_ERROR_WINDOW),
            pipeline_state: latest.map_or(PipelineState::Stopped, |s| s.pipeline_state),
            stream_active: latest.is_some_and(|s| s.artifacts_live),
            engine_running: latest.is_some_and(|s| s.engine_alive),
            restart_count: view.restart_count,
            last_error: view.last_error.clone(),
            uptime_seconds: view.uptime_secs(),
        }
    }
}

/// `GET /health/detailed` payload: the summary plus bounded recent history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedHealth {
    #[serde(flatten)]
    pub summary: HealthSummary,
    pub recent_events: Vec<ErrorEvent>,
    pub recent_snapshots: Vec<HealthSnapshot>,
}

impl DetailedHealth {
    #[must_use]
    pub fn from_view(view: &StatusView) -> Self {
        let tail = |len: usize| len.saturating_sub(DETAIL_LIMIT);
        Self {
            summary: HealthSummary::from_view(view),
            recent_events: view.events[tail(view.events.len())..].to_vec(),
            recent_snapshots: view.snapshots[tail(view.snapshots.len())..].to_vec(),
        }
    }
}

/// `GET /status` payload: operational status plus the artifact inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub service: String,
    pub version: String,
    pub pipeline_state: PipelineState,
    pub monitoring_active: bool,
    pub uptime_seconds: u64,
    pub artifact_count: usize,
    pub artifact_bytes: u64,
    #[serde(default)]
    pub artifacts: Vec<ArtifactInfo>,
}

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StatusStore>,
    pub artifact_dir: PathBuf,
}

#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(health_detailed))
        .route("/status", get(status))
        .with_state(state)
}

/// Bind the listener for the surface. Separate from [`serve_on`] so callers
/// can fail fast on an unusable address before starting their loops.
pub async fn bind(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| crate::Error::Http(format!("bind {addr}: {e}")))
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = bind(addr).await?;
    serve_on(state, listener, shutdown).await
}

/// Serve on an already bound listener until the shutdown signal flips.
pub async fn serve_on(
    state: AppState,
    listener: tokio::net::TcpListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "health surface listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| crate::Error::Http(e.to_string()))
}

async fn health(State(state): State<AppState>) -> Json<HealthSummary> {
    Json(HealthSummary::from_view(&state.store.view()))
}

async fn health_detailed(State(state): State<AppState>) -> Json<DetailedHealth> {
    Json(DetailedHealth::from_view(&state.store.view()))
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let view = state.store.view();
    let artifacts = reclaim::list_artifacts(&state.artifact_dir).unwrap_or_default();
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        version: crate::VERSION.to_string(),
        pipeline_state: view
            .latest_snapshot()
            .map_or(PipelineState::Stopped, |s| s.pipeline_state),
        monitoring_active: view.monitoring_active,
        uptime_seconds: view.uptime_secs(),
        artifact_count: artifacts.len(),
        artifact_bytes: artifacts.iter().map(|a| a.size_bytes).sum(),
        artifacts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ErrorCategory;

    fn store_with_history() -> Arc<StatusStore> {
        let store = Arc::new(StatusStore::new(50));
        store.set_monitoring_active(true);
        for i in 0..3_u64 {
            store.record_snapshot(HealthSnapshot {
                timestamp_ms: crate::epoch_ms(),
                pipeline_state: if i == 2 {
                    PipelineState::Running
                } else {
                    PipelineState::Starting
                },
                engine_alive: true,
                artifacts_live: i == 2,
                error_count: i,
                restart_count: 0,
                last_error: None,
                process_rss_mb: Some(120),
                system_memory_percent: Some(40.0),
                disk_usage_percent: Some(12.0),
            });
        }
        store.record_event(ErrorEvent::new(
            ErrorCategory::PipelineError,
            "encoder hiccup",
            PipelineState::Running,
            None,
        ));
        store
    }

    #[test]
    fn summary_reflects_latest_snapshot_and_counters() {
        let store = store_with_history();
        let summary = HealthSummary::from_view(&store.view());
        assert!(summary.monitoring_active);
        assert_eq!(summary.pipeline_state, PipelineState::Running);
        assert!(summary.stream_active);
        assert!(summary.engine_running);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.recent_errors, 1);
        assert_eq!(summary.last_error.as_deref(), Some("encoder hiccup"));
    }

    #[test]
    fn empty_store_reports_stopped() {
        let store = StatusStore::default();
        let summary = HealthSummary::from_view(&store.view());
        assert_eq!(summary.pipeline_state, PipelineState::Stopped);
        assert!(!summary.stream_active);
        assert!(!summary.engine_running);
        assert_eq!(summary.total_errors, 0);
    }

    #[test]
    fn detailed_history_is_bounded() {
        let store = Arc::new(StatusStore::new(100));
        for _ in 0..40 {
            store.record_event(ErrorEvent::new(
                ErrorCategory::PipelineError,
                "err",
                PipelineState::Error,
                None,
            ));
        }
        let detailed = DetailedHealth::from_view(&store.view());
        assert_eq!(detailed.recent_events.len(), DETAIL_LIMIT);
        assert_eq!(detailed.summary.total_errors, 40);
    }

    #[test]
    fn summary_round_trips_through_json() {
        let store = store_with_history();
        let summary = HealthSummary::from_view(&store.view());
        let json = serde_json::to_string(&summary).unwrap();
        let parsed: HealthSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.total_errors, summary.total_errors);
        assert_eq!(parsed.pipeline_state, summary.pipeline_state);
    }

    #[tokio::test]
    async fn status_inventory_lists_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seg000.ts"), b"abcd").unwrap();
        std::fs::write(dir.path().join("stream.m3u8"), b"#EXTM3U").unwrap();
        let state = AppState {
            store: store_with_history(),
            artifact_dir: dir.path().to_path_buf(),
        };
        let Json(response) = status(State(state)).await;
        assert_eq!(response.artifact_count, 2);
        assert_eq!(response.artifact_bytes, 11);
        assert!(response.monitoring_active);
    }
}
