//! Out-of-process escalation watchdog.
//!
//! Runs as its own process with no shared state with the supervised service.
//! Every cycle it asks the OS service manager whether the service is active,
//! polls the service's health endpoint, checks output-artifact freshness, and
//! reads system resources. When the in-process ladder cannot act (the process
//! is dead or wedged) the watchdog restarts the service through the service
//! manager; everything human-facing goes through the [`AlertDispatcher`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;
use tracing::{error, info, warn};

use crate::alerts::{AlertDispatcher, AlertRecord, AlertSeverity};
use crate::http::HealthSummary;
use crate::reclaim;
use crate::sysprobe::{self, CpuTimes};
use crate::{Error, Result};

/// Structured service-manager state for one unit.
#[derive(Debug, Clone, Default)]
pub struct ServiceState {
    pub active: bool,
    pub active_state: Option<String>,
    pub sub_state: Option<String>,
    pub load_state: Option<String>,
}

/// Service-manager future type.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// OS service-manager interface consumed by the watchdog.
pub trait ServiceManager: Send + Sync {
    fn query(&self, service: &str) -> ServiceFuture<'_, ServiceState>;
    fn restart(&self, service: &str) -> ServiceFuture<'_, ()>;
}

/// systemd-backed service manager shelling out to `systemctl`.
pub struct SystemctlManager {
    query_timeout: Duration,
    restart_timeout: Duration,
}

impl Default for SystemctlManager {
    fn default() -> Self {
        Self {
            query_timeout: Duration::from_secs(5),
            restart_timeout: Duration::from_secs(30),
        }
    }
}

impl SystemctlManager {
    async fn run_systemctl(args: &[&str], timeout: Duration) -> Result<std::process::Output> {
        let child = Command::new("systemctl")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();
        tokio::time::timeout(timeout, child)
            .await
            .map_err(|_| Error::ServiceManager(format!("systemctl {args:?} timed out")))?
            .map_err(|e| Error::ServiceManager(format!("systemctl {args:?}: {e}")))
    }
}

impl ServiceManager for SystemctlManager {
    fn query(&self, service: &str) -> ServiceFuture<'_, ServiceState> {
        let service = service.to_string();
        let timeout = self.query_timeout;
        Box::pin(async move {
            let active = Self::run_systemctl(&["is-active", &service], timeout).await?;
            let is_active = String::from_utf8_lossy(&active.stdout).trim() == "active";

            let show = Self::run_systemctl(
                &[
                    "show",
                    &service,
                    "--property=ActiveState,SubState,LoadState",
                ],
                timeout,
            )
            .await?;

            let mut state = ServiceState {
                active: is_active,
                ..ServiceState::default()
            };
            for line in String::from_utf8_lossy(&show.stdout).lines() {
                if let Some((key, value)) = line.split_once('=') {
                    match key {
                        "ActiveState" => state.active_state = Some(value.to_string()),
                        "SubState" => state.sub_state = Some(value.to_string()),
                        "LoadState" => state.load_state = Some(value.to_string()),
                        _ => {}
                    }
                }
            }
            Ok(state)
        })
    }

    fn restart(&self, service: &str) -> ServiceFuture<'_, ()> {
        let service = service.to_string();
        let timeout = self.restart_timeout;
        Box::pin(async move {
            let output = Self::run_systemctl(&["restart", &service], timeout).await?;
            if output.status.success() {
                Ok(())
            } else {
                Err(Error::ServiceManager(format!(
                    "systemctl restart {service} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        })
    }
}

/// Watchdog thresholds and targets.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub service_name: String,
    pub health_url: String,
    /// Cadence between cycles.
    pub check_interval: Duration,
    /// Bound on each health poll.
    pub poll_timeout: Duration,
    /// Directory of output artifacts.
    pub artifact_dir: PathBuf,
    /// Artifact older than this means the stream is inactive.
    pub artifact_stale_after: Duration,
    /// Reported total error count that triggers an alert (no restart).
    pub error_count_threshold: u64,
    /// Reported restart count that triggers an alert (no restart).
    pub restart_count_threshold: u32,
    /// System CPU percent that triggers an alert.
    pub cpu_threshold_percent: f64,
    /// System memory percent that triggers an alert.
    pub memory_threshold_percent: f64,
    /// Restart the service when it is reported down.
    pub auto_restart_service: bool,
    /// Restart the service when the stream goes inactive.
    pub auto_restart_stream: bool,
    /// Restart the service when CPU usage crosses its threshold.
    pub auto_restart_on_cpu: bool,
    /// Restart the service when memory usage crosses its threshold.
    pub auto_restart_on_memory: bool,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            service_name: "streamwarden.service".to_string(),
            health_url: "http://127.0.0.1:8888/health".to_string(),
            check_interval: Duration::from_secs(30),
            poll_timeout: Duration::from_secs(5),
            artifact_dir: PathBuf::from("/tmp/hls"),
            artifact_stale_after: Duration::from_secs(60),
            error_count_threshold: 10,
            restart_count_threshold: 5,
            cpu_threshold_percent: 90.0,
            memory_threshold_percent: 90.0,
            auto_restart_service: true,
            auto_restart_stream: true,
            auto_restart_on_cpu: true,
            auto_restart_on_memory: true,
        }
    }
}

/// What one cycle observed and did, for logs and tests.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub service_active: bool,
    pub stream_active: bool,
    pub health_reachable: bool,
    /// Restart attempts made this cycle, by trigger.
    pub restarts: Vec<String>,
    /// Alert types that passed the dispatcher gate this cycle.
    pub alerts: Vec<String>,
}

/// The watchdog itself.
pub struct EscalationWatchdog {
    config: WatchdogConfig,
    manager: Box<dyn ServiceManager>,
    dispatcher: AlertDispatcher,
    client: reqwest::Client,
    prev_cpu: Option<CpuTimes>,
}

impl EscalationWatchdog {
    #[must_use]
    pub fn new(
        config: WatchdogConfig,
        manager: Box<dyn ServiceManager>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.poll_timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            manager,
            dispatcher,
            client,
            prev_cpu: None,
        }
    }

    /// Run cycles forever until the shutdown signal flips.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            service = %self.config.service_name,
            interval_secs = self.config.check_interval.as_secs(),
            "escalation watchdog started"
        );
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.run_cycle().await;
                    info!(
                        service_active = report.service_active,
                        stream_active = report.stream_active,
                        alerts = report.alerts.len(),
                        "watchdog cycle completed"
                    );
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("escalation watchdog stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One full check cycle. Probe failures are converted into alerts or log
    /// lines; nothing propagates out.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();

        let service = match self.manager.query(&self.config.service_name).await {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "service manager query failed");
                ServiceState::default()
            }
        };
        report.service_active = service.active;

        if service.active {
            self.check_supervised_process(&mut report).await;
        } else {
            let state = service
                .active_state
                .clone()
                .unwrap_or_else(|| "unknown".to_string());
            self.alert(
                &mut report,
                "service_down",
                AlertSeverity::Critical,
                format!("supervised service is not active: {state}"),
                json!({
                    "active_state": service.active_state,
                    "sub_state": service.sub_state,
                }),
            )
            .await;
            if self.config.auto_restart_service {
                self.restart_service(&mut report, "service_down").await;
            }
        }

        self.check_system_resources(&mut report).await;
        report
    }

    /// Checks that only make sense while the service manager reports active:
    /// the health endpoint and output-artifact freshness.
    async fn check_supervised_process(&mut self, report: &mut CycleReport) {
        match self.fetch_health().await {
            Some(health) => {
                report.health_reachable = true;
                if health.total_errors > self.config.error_count_threshold {
                    // Alert only; the in-process ladder owns this restart path.
                    self.alert(
                        report,
                        "high_error_count",
                        AlertSeverity::Warning,
                        format!("supervised process reports {} errors", health.total_errors),
                        json!({"total_errors": health.total_errors}),
                    )
                    .await;
                }
                if health.restart_count > self.config.restart_count_threshold {
                    self.alert(
                        report,
                        "frequent_restarts",
                        AlertSeverity::Critical,
                        format!("service has restarted {} times", health.restart_count),
                        json!({"restart_count": health.restart_count}),
                    )
                    .await;
                }
            }
            None => {
                self.alert(
                    report,
                    "health_unreachable",
                    AlertSeverity::Warning,
                    "service is active but the health endpoint is not responding".to_string(),
                    json!({"url": self.config.health_url}),
                )
                .await;
            }
        }

        let artifact_age = reclaim::newest_artifact_age(&self.config.artifact_dir);
        report.stream_active =
            artifact_age.is_some_and(|age| age <= self.config.artifact_stale_after);
        if !report.stream_active {
            let reason = match artifact_age {
                Some(age) => format!("no artifact update for {}s", age.as_secs()),
                None => "no artifacts found".to_string(),
            };
            self.alert(
                report,
                "stream_inactive",
                AlertSeverity::Warning,
                format!("stream is not active: {reason}"),
                json!({"artifact_dir": self.config.artifact_dir.display().to_string()}),
            )
            .await;
            if self.config.auto_restart_stream {
                self.restart_service(report, "stream_inactive").await;
            }
        }
    }

    async fn check_system_resources(&mut self, report: &mut CycleReport) {
        let cpu_percent = self.update_cpu_baseline(sysprobe::read_cpu_times());
        let memory_percent = sysprobe::system_memory_percent();
        self.apply_resource_policy(report, cpu_percent, memory_percent)
            .await;
    }

    /// Fold one /proc/stat reading into the baseline and return the usage
    /// percent since the previous reading. A failed read keeps the existing
    /// baseline for the next cycle.
    fn update_cpu_baseline(&mut self, reading: Option<CpuTimes>) -> Option<f64> {
        match (self.prev_cpu, reading) {
            (Some(earlier), Some(later)) => {
                self.prev_cpu = Some(later);
                sysprobe::cpu_percent_between(earlier, later)
            }
            (None, Some(later)) => {
                self.prev_cpu = Some(later);
                None
            }
            (_, None) => None,
        }
    }

    /// Threshold crossings alert, and each resource type carries its own
    /// restart toggle.
    async fn apply_resource_policy(
        &self,
        report: &mut CycleReport,
        cpu_percent: Option<f64>,
        memory_percent: Option<f64>,
    ) {
        if let Some(pct) = cpu_percent {
            if pct > self.config.cpu_threshold_percent {
                self.alert(
                    report,
                    "high_cpu_usage",
                    AlertSeverity::Warning,
                    format!("high system CPU usage: {pct:.1}%"),
                    json!({"cpu_percent": pct}),
                )
                .await;
                if self.config.auto_restart_on_cpu {
                    self.restart_service(report, "high_cpu_usage").await;
                }
            }
        }

        if let Some(pct) = memory_percent {
            if pct > self.config.memory_threshold_percent {
                self.alert(
                    report,
                    "high_memory_usage",
                    AlertSeverity::Warning,
                    format!("high system memory usage: {pct:.1}%"),
                    json!({"memory_percent": pct}),
                )
                .await;
                if self.config.auto_restart_on_memory {
                    self.restart_service(report, "high_memory_usage").await;
                }
            }
        }
    }

    async fn fetch_health(&self) -> Option<HealthSummary> {
        let response = match self.client.get(&self.config.health_url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, url = %self.config.health_url, "health endpoint not reachable");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), "health endpoint returned non-success");
            return None;
        }
        match response.json::<HealthSummary>().await {
            Ok(health) => Some(health),
            Err(e) => {
                warn!(error = %e, "health response did not parse");
                None
            }
        }
    }

    async fn restart_service(&self, report: &mut CycleReport, trigger: &str) {
        info!(
            service = %self.config.service_name,
            trigger,
            "restarting service through the service manager"
        );
        match self.manager.restart(&self.config.service_name).await {
            Ok(()) => report.restarts.push(trigger.to_string()),
            Err(e) => error!(error = %e, trigger, "service restart failed"),
        }
    }

    async fn alert(
        &self,
        report: &mut CycleReport,
        alert_type: &str,
        severity: AlertSeverity,
        message: String,
        payload: serde_json::Value,
    ) {
        let delivered = self
            .dispatcher
            .send(AlertRecord::new(alert_type, severity, message, payload))
            .await;
        if delivered {
            report.alerts.push(alert_type.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::test_support::MockChannel;
    use crate::alerts::DispatchPolicy;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct MockManager {
        active: AtomicBool,
        restarts: AtomicU32,
        fail_restart: AtomicBool,
    }

    impl MockManager {
        fn active(value: bool) -> Arc<Self> {
            let manager = Arc::new(Self::default());
            manager.active.store(value, Ordering::SeqCst);
            manager
        }
    }

    impl ServiceManager for Arc<MockManager> {
        fn query(&self, _service: &str) -> ServiceFuture<'_, ServiceState> {
            let active = self.active.load(Ordering::SeqCst);
            Box::pin(async move {
                Ok(ServiceState {
                    active,
                    active_state: Some(if active { "active" } else { "failed" }.to_string()),
                    ..ServiceState::default()
                })
            })
        }

        fn restart(&self, _service: &str) -> ServiceFuture<'_, ()> {
            let fail = self.fail_restart.load(Ordering::SeqCst);
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(Error::ServiceManager("restart refused".to_string()))
                } else {
                    Ok(())
                }
            })
        }
    }

    fn watchdog_with(
        manager: Arc<MockManager>,
        config: WatchdogConfig,
    ) -> (EscalationWatchdog, MockChannel) {
        let mock = MockChannel::default();
        let dispatcher =
            AlertDispatcher::new(DispatchPolicy::default(), vec![Box::new(mock.clone())]);
        (
            EscalationWatchdog::new(config, Box::new(manager), dispatcher),
            mock,
        )
    }

    fn test_config() -> WatchdogConfig {
        WatchdogConfig {
            // Unreachable endpoint and missing artifact dir by default.
            health_url: "http://127.0.0.1:1/health".to_string(),
            poll_timeout: Duration::from_millis(200),
            artifact_dir: std::env::temp_dir().join("streamwarden-no-such-dir"),
            // Resource checks are probed separately.
            cpu_threshold_percent: 1000.0,
            memory_threshold_percent: 1000.0,
            ..WatchdogConfig::default()
        }
    }

    #[tokio::test]
    async fn dead_service_gets_critical_alert_and_restart() {
        let manager = MockManager::active(false);
        let (mut watchdog, mock) = watchdog_with(Arc::clone(&manager), test_config());

        let report = watchdog.run_cycle().await;

        assert!(!report.service_active);
        assert_eq!(report.restarts, vec!["service_down"]);
        assert!(report.alerts.contains(&"service_down".to_string()));
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);
        assert!(mock
            .delivered_types()
            .contains(&"service_down".to_string()));
    }

    #[tokio::test]
    async fn stale_stream_on_active_service_restarts_with_warning() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MockManager::active(true);
        let mut config = test_config();
        config.artifact_dir = dir.path().to_path_buf();

        // One artifact, two minutes old.
        let seg = dir.path().join("seg000.ts");
        std::fs::write(&seg, b"x").unwrap();
        let stale = std::time::SystemTime::now() - Duration::from_secs(120);
        std::fs::File::options()
            .write(true)
            .open(&seg)
            .unwrap()
            .set_modified(stale)
            .unwrap();

        let (mut watchdog, _mock) = watchdog_with(Arc::clone(&manager), config);
        let report = watchdog.run_cycle().await;

        assert!(report.service_active);
        assert!(!report.stream_active);
        assert_eq!(report.restarts, vec!["stream_inactive"]);
        assert!(report.alerts.contains(&"stream_inactive".to_string()));
    }

    #[tokio::test]
    async fn unreachable_health_on_active_service_alerts_without_restart_storm() {
        let manager = MockManager::active(true);
        let mut config = test_config();
        config.auto_restart_stream = false;
        let (mut watchdog, _mock) = watchdog_with(Arc::clone(&manager), config);

        let report = watchdog.run_cycle().await;

        assert!(!report.health_reachable);
        assert!(report.alerts.contains(&"health_unreachable".to_string()));
        assert!(report.restarts.is_empty());
    }

    #[tokio::test]
    async fn repeated_cycles_dedup_alerts() {
        let manager = MockManager::active(false);
        let mut config = test_config();
        config.auto_restart_service = false;
        let (mut watchdog, mock) = watchdog_with(Arc::clone(&manager), config);

        let first = watchdog.run_cycle().await;
        let second = watchdog.run_cycle().await;

        assert!(first.alerts.contains(&"service_down".to_string()));
        assert!(second.alerts.is_empty());
        assert_eq!(
            mock.delivered_types()
                .iter()
                .filter(|t| t.as_str() == "service_down")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failed_restart_is_logged_not_counted() {
        let manager = MockManager::active(false);
        manager.fail_restart.store(true, Ordering::SeqCst);
        let (mut watchdog, _mock) = watchdog_with(Arc::clone(&manager), test_config());

        let report = watchdog.run_cycle().await;

        assert!(report.restarts.is_empty());
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resource_pressure_restarts_when_flagged() {
        let manager = MockManager::active(true);
        let mut config = test_config();
        config.memory_threshold_percent = 90.0;
        let (watchdog, mock) = watchdog_with(Arc::clone(&manager), config);

        let mut report = CycleReport::default();
        watchdog
            .apply_resource_policy(&mut report, None, Some(95.0))
            .await;

        assert_eq!(report.restarts, vec!["high_memory_usage"]);
        assert!(mock
            .delivered_types()
            .contains(&"high_memory_usage".to_string()));
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resource_pressure_alerts_only_when_unflagged() {
        let manager = MockManager::active(true);
        let mut config = test_config();
        config.cpu_threshold_percent = 90.0;
        config.memory_threshold_percent = 90.0;
        config.auto_restart_on_cpu = false;
        config.auto_restart_on_memory = false;
        let (watchdog, mock) = watchdog_with(Arc::clone(&manager), config);

        let mut report = CycleReport::default();
        watchdog
            .apply_resource_policy(&mut report, Some(97.0), Some(95.0))
            .await;

        assert!(report.restarts.is_empty());
        assert_eq!(manager.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(
            mock.delivered_types(),
            vec!["high_cpu_usage", "high_memory_usage"]
        );
    }

    #[test]
    fn cpu_baseline_survives_a_failed_read() {
        let manager = MockManager::active(true);
        let (mut watchdog, _mock) = watchdog_with(manager, test_config());

        let t1 = CpuTimes { busy: 100, total: 1000 };
        let t2 = CpuTimes { busy: 150, total: 1100 };

        assert!(watchdog.update_cpu_baseline(Some(t1)).is_none());
        // One transient /proc/stat failure must not discard the baseline.
        assert!(watchdog.update_cpu_baseline(None).is_none());
        let pct = watchdog.update_cpu_baseline(Some(t2)).unwrap();
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn default_config_matches_deployment() {
        let config = WatchdogConfig::default();
        assert_eq!(config.check_interval, Duration::from_secs(30));
        assert_eq!(config.artifact_stale_after, Duration::from_secs(60));
        assert_eq!(config.error_count_threshold, 10);
        assert_eq!(config.restart_count_threshold, 5);
        assert!(config.auto_restart_on_cpu);
        assert!(config.auto_restart_on_memory);
    }
}
