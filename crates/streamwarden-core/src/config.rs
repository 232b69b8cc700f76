//! Configuration loading and validation.
//!
//! One explicit structure with named, typed fields and documented defaults,
//! loaded from TOML and validated at startup. Durations are plain seconds in
//! the file; conversion into the per-component policy structs happens here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::alerts::DispatchPolicy;
use crate::health::SamplerConfig;
use crate::supervisor::{ReclaimPolicy, RestartPolicy};
use crate::watchdog::WatchdogConfig;
use crate::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub reclaim: ReclaimConfig,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub alerts: AlertsConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

/// Media-engine command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Engine binary to launch and supervise.
    #[serde(default = "default_engine_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            args: Vec::new(),
        }
    }
}

fn default_engine_program() -> String {
    "gst-launch-1.0".to_string()
}

/// Sampler and engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between health samples.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
    /// Back-off seconds after a failed probe.
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown: u64,
    /// Consecutive intermediate-state samples before the pipeline counts as
    /// stuck.
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,
    /// Seconds allowed per engine probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: u64,
    /// Directory the engine writes output artifacts into.
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: PathBuf,
    /// Artifact age in seconds beyond which the stream is not live.
    #[serde(default = "default_artifact_fresh")]
    pub artifact_fresh_within: u64,
    /// Retained snapshot/event history entries.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
    /// File persisting the lifetime restart count across respawns.
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
            failure_cooldown: default_failure_cooldown(),
            stuck_threshold: default_stuck_threshold(),
            probe_timeout: default_probe_timeout(),
            artifact_dir: default_artifact_dir(),
            artifact_fresh_within: default_artifact_fresh(),
            history_cap: default_history_cap(),
            state_file: default_state_file(),
        }
    }
}

fn default_sample_interval() -> u64 {
    10
}

fn default_failure_cooldown() -> u64 {
    30
}

fn default_stuck_threshold() -> u32 {
    5
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_artifact_dir() -> PathBuf {
    PathBuf::from("/tmp/hls")
}

fn default_artifact_fresh() -> u64 {
    30
}

fn default_history_cap() -> usize {
    100
}

fn default_state_file() -> PathBuf {
    PathBuf::from("/var/lib/streamwarden/state.json")
}

/// Restart-ladder thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Errors within the window that trigger a full restart.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    /// Error-counting window in seconds.
    #[serde(default = "default_error_window")]
    pub error_window: u64,
    /// Lifetime cap on automatic restarts.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Seconds between scheduling a restart and exiting.
    #[serde(default = "default_restart_delay")]
    pub restart_delay: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_errors: default_max_errors(),
            error_window: default_error_window(),
            max_restarts: default_max_restarts(),
            restart_delay: default_restart_delay(),
        }
    }
}

fn default_max_errors() -> u32 {
    5
}

fn default_error_window() -> u64 {
    300
}

fn default_max_restarts() -> u32 {
    5
}

fn default_restart_delay() -> u64 {
    30
}

/// Resource-reclamation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    #[serde(default = "default_disk_cleanup")]
    pub disk_cleanup_threshold_percent: f64,
    #[serde(default = "default_disk_emergency")]
    pub disk_emergency_threshold_percent: f64,
    /// Artifacts kept by the normal trim.
    #[serde(default = "default_keep_count")]
    pub artifact_keep_count: usize,
    /// Artifacts kept by the emergency trim.
    #[serde(default = "default_emergency_keep")]
    pub emergency_keep_count: usize,
    /// Process RSS in MB that triggers history truncation.
    #[serde(default = "default_memory_cleanup")]
    pub memory_cleanup_threshold_mb: u64,
    /// Process RSS in MB that triggers the aggressive truncation.
    #[serde(default = "default_memory_emergency")]
    pub memory_emergency_threshold_mb: u64,
    /// System memory percent that triggers the aggressive truncation.
    #[serde(default = "default_system_memory")]
    pub system_memory_threshold_percent: f64,
    /// Log file rotated during emergency cleanup.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            disk_cleanup_threshold_percent: default_disk_cleanup(),
            disk_emergency_threshold_percent: default_disk_emergency(),
            artifact_keep_count: default_keep_count(),
            emergency_keep_count: default_emergency_keep(),
            memory_cleanup_threshold_mb: default_memory_cleanup(),
            memory_emergency_threshold_mb: default_memory_emergency(),
            system_memory_threshold_percent: default_system_memory(),
            log_path: None,
        }
    }
}

fn default_disk_cleanup() -> f64 {
    70.0
}

fn default_disk_emergency() -> f64 {
    90.0
}

fn default_keep_count() -> usize {
    5
}

fn default_emergency_keep() -> usize {
    2
}

fn default_memory_cleanup() -> u64 {
    700
}

fn default_memory_emergency() -> u64 {
    1000
}

fn default_system_memory() -> f64 {
    90.0
}

/// Escalation-watchdog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogSection {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_health_url")]
    pub health_url: String,
    /// Seconds between watchdog cycles.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Artifact age in seconds beyond which the stream counts as inactive.
    #[serde(default = "default_stale_after")]
    pub artifact_stale_after: u64,
    /// Reported error count that triggers an alert.
    #[serde(default = "default_error_alert")]
    pub error_count_threshold: u64,
    /// Reported restart count that triggers an alert.
    #[serde(default = "default_restart_alert")]
    pub restart_count_threshold: u32,
    #[serde(default = "default_resource_percent")]
    pub cpu_threshold_percent: f64,
    #[serde(default = "default_resource_percent")]
    pub memory_threshold_percent: f64,
    #[serde(default = "default_true")]
    pub auto_restart_service: bool,
    #[serde(default = "default_true")]
    pub auto_restart_stream: bool,
    #[serde(default = "default_true")]
    pub auto_restart_on_cpu: bool,
    #[serde(default = "default_true")]
    pub auto_restart_on_memory: bool,
}

impl Default for WatchdogSection {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            health_url: default_health_url(),
            check_interval: default_check_interval(),
            artifact_stale_after: default_stale_after(),
            error_count_threshold: default_error_alert(),
            restart_count_threshold: default_restart_alert(),
            cpu_threshold_percent: default_resource_percent(),
            memory_threshold_percent: default_resource_percent(),
            auto_restart_service: true,
            auto_restart_stream: true,
            auto_restart_on_cpu: true,
            auto_restart_on_memory: true,
        }
    }
}

fn default_service_name() -> String {
    "streamwarden.service".to_string()
}

fn default_health_url() -> String {
    "http://127.0.0.1:8888/health".to_string()
}

fn default_check_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    60
}

fn default_error_alert() -> u64 {
    10
}

fn default_restart_alert() -> u32 {
    5
}

fn default_resource_percent() -> f64 {
    90.0
}

fn default_true() -> bool {
    true
}

/// Alert gating and channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Seconds between two delivered alerts of the same type.
    #[serde(default = "default_alert_cooldown")]
    pub alert_cooldown: u64,
    /// Cap on alerts delivered within one cooldown horizon.
    #[serde(default = "default_max_alerts")]
    pub max_alerts: usize,
    #[serde(default)]
    pub email: EmailAlertConfig,
    #[serde(default)]
    pub webhook: WebhookAlertConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            alert_cooldown: default_alert_cooldown(),
            max_alerts: default_max_alerts(),
            email: EmailAlertConfig::default(),
            webhook: WebhookAlertConfig::default(),
        }
    }
}

fn default_alert_cooldown() -> u64 {
    300
}

fn default_max_alerts() -> usize {
    10
}

/// Email channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub from_email: String,
    #[serde(default)]
    pub to_email: String,
    /// Path to a sendmail-compatible binary.
    #[serde(default = "default_sendmail")]
    pub sendmail_path: String,
}

impl Default for EmailAlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            from_email: String::new(),
            to_email: String::new(),
            sendmail_path: default_sendmail(),
        }
    }
}

fn default_sendmail() -> String {
    "/usr/sbin/sendmail".to_string()
}

/// Webhook channel settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WebhookAlertConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub url: String,
}

/// Health surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8888".to_string()
}

impl Config {
    /// Load from a TOML file, falling back to defaults when the file does
    /// not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(Error::Config(format!("read {}: {e}", path.display())));
            }
        };
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation of cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.restart.max_errors == 0 {
            return Err(Error::Config("restart.max_errors must be positive".into()));
        }
        if self.restart.error_window == 0 {
            return Err(Error::Config("restart.error_window must be positive".into()));
        }
        if self.monitor.sample_interval == 0 {
            return Err(Error::Config(
                "monitor.sample_interval must be positive".into(),
            ));
        }
        if self.monitor.stuck_threshold == 0 {
            return Err(Error::Config(
                "monitor.stuck_threshold must be positive".into(),
            ));
        }
        if self.reclaim.disk_cleanup_threshold_percent >= self.reclaim.disk_emergency_threshold_percent
        {
            return Err(Error::Config(
                "reclaim.disk_cleanup_threshold_percent must be below the emergency threshold"
                    .into(),
            ));
        }
        if self.reclaim.emergency_keep_count > self.reclaim.artifact_keep_count {
            return Err(Error::Config(
                "reclaim.emergency_keep_count must not exceed artifact_keep_count".into(),
            ));
        }
        if self.reclaim.memory_cleanup_threshold_mb > self.reclaim.memory_emergency_threshold_mb {
            return Err(Error::Config(
                "reclaim.memory_cleanup_threshold_mb must not exceed memory_emergency_threshold_mb"
                    .into(),
            ));
        }
        if self.alerts.email.enabled
            && (self.alerts.email.from_email.is_empty() || self.alerts.email.to_email.is_empty())
        {
            return Err(Error::Config(
                "alerts.email requires from_email and to_email when enabled".into(),
            ));
        }
        if self.alerts.webhook.enabled && self.alerts.webhook.url.is_empty() {
            return Err(Error::Config(
                "alerts.webhook requires url when enabled".into(),
            ));
        }
        self.http
            .bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::Config(format!("http.bind is not a socket address: {e}")))?;
        Ok(())
    }

    #[must_use]
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_secs(self.monitor.sample_interval),
            failure_cooldown: Duration::from_secs(self.monitor.failure_cooldown),
            stuck_threshold: self.monitor.stuck_threshold,
            probe_timeout: Duration::from_secs(self.monitor.probe_timeout),
            artifact_dir: self.monitor.artifact_dir.clone(),
            artifact_fresh_within: Duration::from_secs(self.monitor.artifact_fresh_within),
        }
    }

    #[must_use]
    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            max_errors: self.restart.max_errors,
            error_window: Duration::from_secs(self.restart.error_window),
            max_restarts: self.restart.max_restarts,
            restart_delay: Duration::from_secs(self.restart.restart_delay),
        }
    }

    #[must_use]
    pub fn reclaim_policy(&self) -> ReclaimPolicy {
        ReclaimPolicy {
            disk_cleanup_percent: self.reclaim.disk_cleanup_threshold_percent,
            disk_emergency_percent: self.reclaim.disk_emergency_threshold_percent,
            artifact_keep_count: self.reclaim.artifact_keep_count,
            emergency_keep_count: self.reclaim.emergency_keep_count,
            memory_cleanup_mb: self.reclaim.memory_cleanup_threshold_mb,
            memory_emergency_mb: self.reclaim.memory_emergency_threshold_mb,
            system_memory_emergency_percent: self.reclaim.system_memory_threshold_percent,
            artifact_dir: self.monitor.artifact_dir.clone(),
            log_path: self.reclaim.log_path.clone(),
            ..ReclaimPolicy::default()
        }
    }

    #[must_use]
    pub fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            service_name: self.watchdog.service_name.clone(),
            health_url: self.watchdog.health_url.clone(),
            check_interval: Duration::from_secs(self.watchdog.check_interval),
            artifact_dir: self.monitor.artifact_dir.clone(),
            artifact_stale_after: Duration::from_secs(self.watchdog.artifact_stale_after),
            error_count_threshold: self.watchdog.error_count_threshold,
            restart_count_threshold: self.watchdog.restart_count_threshold,
            cpu_threshold_percent: self.watchdog.cpu_threshold_percent,
            memory_threshold_percent: self.watchdog.memory_threshold_percent,
            auto_restart_service: self.watchdog.auto_restart_service,
            auto_restart_stream: self.watchdog.auto_restart_stream,
            auto_restart_on_cpu: self.watchdog.auto_restart_on_cpu,
            auto_restart_on_memory: self.watchdog.auto_restart_on_memory,
            ..WatchdogConfig::default()
        }
    }

    #[must_use]
    pub fn dispatch_policy(&self) -> DispatchPolicy {
        DispatchPolicy {
            cooldown: Duration::from_secs(self.alerts.alert_cooldown),
            max_alerts: self.alerts.max_alerts,
        }
    }
}
