//! Process runtime: wires the sampler, supervisor, store, and health surface
//! into one monitor loop and owns the process exit contract.
//!
//! A scheduled full-process restart terminates this process with
//! [`crate::RESTART_EXIT_CODE`]; the OS service supervisor is configured to
//! respawn on any non-zero exit. That hand-off is the restart mechanism and
//! must not be caught or softened here.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alerts::{AlertChannel, AlertDispatcher, EmailChannel, WebhookChannel};
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::health::HealthSampler;
use crate::http::{self, AppState};
use crate::status_store::StatusStore;
use crate::supervisor::RecoverySupervisor;
use crate::watchdog::{EscalationWatchdog, SystemctlManager};
use crate::{Error, Result, RESTART_EXIT_CODE};

/// Bounded wait for background tasks at shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// How the monitor loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Cooperative shutdown; exit cleanly.
    Shutdown,
    /// The ladder scheduled a full-process restart; exit with the
    /// distinguished status so the service supervisor respawns us.
    RestartRequested,
}

impl RunOutcome {
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Shutdown => 0,
            Self::RestartRequested => RESTART_EXIT_CODE,
        }
    }
}

/// State persisted across respawns. Only the lifetime restart count lives
/// here; everything else is rebuilt from scratch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    restart_count: u32,
}

fn load_restart_count(path: &Path) -> u32 {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<PersistedState>(&contents) {
            Ok(state) => state.restart_count,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "state file did not parse, starting at zero");
                0
            }
        },
        Err(_) => 0,
    }
}

fn save_restart_count(path: &Path, restart_count: u32) {
    let state = PersistedState { restart_count };
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, serde_json::to_string(&state).unwrap_or_default())
    };
    if let Err(e) = write() {
        warn!(error = %e, path = %path.display(), "could not persist restart count");
    }
}

/// Build the alert fan-out from the configured channels.
#[must_use]
pub fn build_dispatcher(config: &Config) -> AlertDispatcher {
    let mut channels: Vec<Box<dyn AlertChannel>> = Vec::new();
    if config.alerts.webhook.enabled {
        channels.push(Box::new(WebhookChannel::new(
            config.alerts.webhook.url.clone(),
        )));
    }
    if config.alerts.email.enabled {
        channels.push(Box::new(
            EmailChannel::new(
                config.alerts.email.from_email.clone(),
                config.alerts.email.to_email.clone(),
            )
            .with_sendmail(config.alerts.email.sendmail_path.clone()),
        ));
    }
    AlertDispatcher::new(config.dispatch_policy(), channels)
}

/// Run the supervised process's monitor loop plus health surface until
/// shutdown or a scheduled restart.
pub async fn run_monitor(
    config: Config,
    engine: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RunOutcome> {
    let store = Arc::new(StatusStore::new(config.monitor.history_cap));
    let restart_count = load_restart_count(&config.monitor.state_file);
    store.set_restart_count(restart_count);
    store.set_monitoring_active(true);

    let mut sampler = HealthSampler::new(config.sampler_config());
    let mut supervisor = RecoverySupervisor::new(config.restart_policy(), config.reclaim_policy());
    supervisor.set_restart_count(restart_count);

    let addr = config
        .http
        .bind
        .parse()
        .map_err(|e| Error::Config(format!("http.bind: {e}")))?;
    // Bind before the loop starts so an unusable address is a startup error,
    // not a silently absent health surface.
    let listener = http::bind(addr).await?;
    let (inner_tx, inner_rx) = watch::channel(false);
    let http_state = AppState {
        store: Arc::clone(&store),
        artifact_dir: config.monitor.artifact_dir.clone(),
    };
    let http_task = tokio::spawn(http::serve_on(http_state, listener, inner_rx));

    info!(
        interval_secs = sampler.config().interval.as_secs(),
        max_restarts = supervisor.policy().max_restarts,
        restart_count,
        "monitor loop started"
    );

    let outcome = loop {
        let tick = sampler.sample(&engine, store.counters()).await;
        let pause = if tick.probe_failed {
            sampler.config().failure_cooldown
        } else {
            sampler.config().interval
        };
        store.record_snapshot(tick.snapshot.clone());

        let report = supervisor.evaluate(&tick, &engine, &store).await;
        if report.restart_scheduled {
            save_restart_count(&config.monitor.state_file, supervisor.restart_count());
            let delay = supervisor.policy().restart_delay;
            info!(delay_secs = delay.as_secs(), "restart delay before exit");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    // An operator shutdown during the delay wins; the exit
                    // code stays clean so the service is not respawned.
                    break RunOutcome::Shutdown;
                }
            }
            break RunOutcome::RestartRequested;
        }

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = wait_for_shutdown(&mut shutdown) => break RunOutcome::Shutdown,
        }
    };

    store.set_monitoring_active(false);
    if let Err(e) = engine.stop().await {
        error!(error = %e, "engine stop during shutdown failed");
    }
    let _ = inner_tx.send(true);
    match tokio::time::timeout(JOIN_TIMEOUT, http_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "health surface exited with error"),
        Ok(Err(e)) => error!(error = %e, "health surface task panicked"),
        Err(_) => warn!("health surface did not stop within the join timeout"),
    }

    info!(outcome = ?outcome, "monitor loop stopped");
    Ok(outcome)
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender dropped; treat as shutdown.
            return;
        }
    }
}

/// Run the out-of-process escalation watchdog until shutdown.
pub async fn run_watchdog(config: Config, shutdown: watch::Receiver<bool>) {
    let dispatcher = build_dispatcher(&config);
    let watchdog = EscalationWatchdog::new(
        config.watchdog_config(),
        Box::new(SystemctlManager::default()),
        dispatcher,
    );
    watchdog.run(shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{mock_engine_handle, mock_engine_handle_failing};

    fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.monitor.artifact_dir = dir.join("hls");
        config.monitor.state_file = dir.join("state.json");
        // Ephemeral port so parallel tests do not collide.
        config.http.bind = "127.0.0.1:0".to_string();
        config
    }

    #[test]
    fn outcome_exit_codes_match_contract() {
        assert_eq!(RunOutcome::Shutdown.exit_code(), 0);
        assert_eq!(RunOutcome::RestartRequested.exit_code(), RESTART_EXIT_CODE);
    }

    #[test]
    fn restart_count_round_trips_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        assert_eq!(load_restart_count(&path), 0);
        save_restart_count(&path, 3);
        assert_eq!(load_restart_count(&path), 3);
    }

    #[test]
    fn corrupt_state_file_starts_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_restart_count(&path), 0);
    }

    #[test]
    fn dispatcher_has_no_channels_by_default() {
        let config = Config::default();
        assert_eq!(build_dispatcher(&config).channel_count(), 0);
    }

    #[test]
    fn dispatcher_picks_up_enabled_channels() {
        let mut config = Config::default();
        config.alerts.webhook.enabled = true;
        config.alerts.webhook.url = "https://hooks.example.com/T/B/X".to_string();
        config.alerts.email.enabled = true;
        config.alerts.email.from_email = "watchdog@example.com".to_string();
        config.alerts.email.to_email = "ops@example.com".to_string();
        assert_eq!(build_dispatcher(&config).channel_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signal_stops_the_loop_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let engine = mock_engine_handle();
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(run_monitor(config, engine, rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Shutdown);
    }

    #[tokio::test]
    async fn occupied_bind_address_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.http.bind = blocker.local_addr().unwrap().to_string();

        let engine = mock_engine_handle();
        let (_tx, rx) = watch::channel(false);
        let err = run_monitor(config, engine, rx).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failures_end_in_a_restart_request() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let engine = mock_engine_handle_failing();
        let (_tx, rx) = watch::channel(false);

        // Five failed probes at the 30s cooldown, then the 30s restart delay.
        let outcome = run_monitor(config, engine, rx).await.unwrap();
        assert_eq!(outcome, RunOutcome::RestartRequested);
        assert_eq!(outcome.exit_code(), RESTART_EXIT_CODE);
        assert_eq!(load_restart_count(&dir.path().join("state.json")), 1);
    }
}
