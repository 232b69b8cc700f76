//! Human-facing alert gating and fan-out.
//!
//! The dispatcher is the last hop before a human sees anything: it suppresses
//! repeats of the same alert type within the cooldown, caps total deliveries
//! per cooldown horizon, and fans the survivors out to the configured
//! channels. Delivery failures are logged and dropped; a failed alert never
//! generates another alert.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::epoch_ms;
use crate::event_window::EventWindow;

/// Alert severity, ordered least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One alert as handed to the channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    /// Stable type key used for deduplication, e.g. `service_down`.
    pub alert_type: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub timestamp_ms: u64,
    /// Structured context attached to the delivery.
    pub payload: serde_json::Value,
}

impl AlertRecord {
    #[must_use]
    pub fn new(
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            message: message.into(),
            timestamp_ms: epoch_ms(),
            payload,
        }
    }
}

/// Dispatch future type.
pub type AlertFuture<'a> = Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>>;

/// Async delivery channel interface.
pub trait AlertChannel: Send + Sync {
    /// Channel identifier used in logs.
    fn name(&self) -> &'static str;

    /// Deliver one alert.
    fn deliver<'a>(&'a self, alert: &'a AlertRecord) -> AlertFuture<'a>;
}

/// Gating thresholds.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Minimum interval between two delivered alerts of the same type.
    pub cooldown: Duration,
    /// Cap on total alerts delivered within one cooldown horizon.
    pub max_alerts: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            cooldown: Duration::from_secs(300),
            max_alerts: 10,
        }
    }
}

/// Cooldown-gated fan-out to the configured channels.
pub struct AlertDispatcher {
    policy: DispatchPolicy,
    channels: Vec<Box<dyn AlertChannel>>,
    /// Delivered alert types. Retained history never exceeds 2x cooldown.
    history: Mutex<EventWindow<String>>,
}

impl AlertDispatcher {
    #[must_use]
    pub fn new(policy: DispatchPolicy, channels: Vec<Box<dyn AlertChannel>>) -> Self {
        Self {
            policy,
            channels,
            history: Mutex::new(EventWindow::new()),
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Gate and deliver one alert. Returns whether it was delivered to the
    /// channels (a suppressed alert is dropped apart from a log line).
    pub async fn send(&self, alert: AlertRecord) -> bool {
        self.send_at(alert, epoch_ms()).await
    }

    pub async fn send_at(&self, alert: AlertRecord, now_ms: u64) -> bool {
        if !self.admit(&alert.alert_type, now_ms) {
            info!(
                alert_type = %alert.alert_type,
                "alert suppressed by cooldown"
            );
            return false;
        }

        warn!(
            alert_type = %alert.alert_type,
            severity = %alert.severity,
            "alert: {}",
            alert.message
        );

        for channel in &self.channels {
            if let Err(e) = channel.deliver(&alert).await {
                // No retry and no further escalation.
                error!(
                    channel = channel.name(),
                    alert_type = %alert.alert_type,
                    error = %e,
                    "alert delivery failed"
                );
            }
        }
        true
    }

    /// Apply the gate and record the delivery if admitted.
    fn admit(&self, alert_type: &str, now_ms: u64) -> bool {
        let cooldown_ms = u64::try_from(self.policy.cooldown.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(cooldown_ms);

        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        // Retention invariant: entries older than 2x cooldown are dropped.
        history.prune(self.policy.cooldown * 2, now_ms);

        let recent: Vec<&String> = history
            .entries()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, t)| t)
            .collect();
        if recent.len() >= self.policy.max_alerts {
            return false;
        }
        if recent.iter().any(|t| t.as_str() == alert_type) {
            return false;
        }

        history.record_at(alert_type.to_string(), now_ms);
        true
    }
}

/// Slack-compatible webhook channel.
pub struct WebhookChannel {
    url: String,
    client: reqwest::Client,
}

impl WebhookChannel {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }
}

impl AlertChannel for WebhookChannel {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver<'a>(&'a self, alert: &'a AlertRecord) -> AlertFuture<'a> {
        Box::pin(async move {
            let color = if alert.severity == AlertSeverity::Critical {
                "danger"
            } else {
                "warning"
            };
            let timestamp = chrono::DateTime::from_timestamp_millis(
                i64::try_from(alert.timestamp_ms).unwrap_or(0),
            )
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_default();
            let body = json!({
                "text": format!("Stream supervisor alert: {}", alert.message),
                "attachments": [{
                    "title": format!("Alert: {}", alert.alert_type),
                    "text": alert.message,
                    "color": color,
                    "fields": [
                        {"title": "Severity", "value": alert.severity.to_string(), "short": true},
                        {"title": "Time", "value": timestamp, "short": true}
                    ]
                }]
            });

            let response = self.client.post(&self.url).json(&body).send().await?;
            if !response.status().is_success() {
                return Err(crate::Error::Alert(format!(
                    "webhook returned status {}",
                    response.status()
                )));
            }
            info!(alert_type = %alert.alert_type, "webhook alert sent");
            Ok(())
        })
    }
}

/// Email channel delivering through a local sendmail-compatible binary.
pub struct EmailChannel {
    sendmail: String,
    from: String,
    to: String,
    wait_timeout: Duration,
}

impl EmailChannel {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            sendmail: "/usr/sbin/sendmail".to_string(),
            from: from.into(),
            to: to.into(),
            wait_timeout: Duration::from_secs(10),
        }
    }

    #[must_use]
    pub fn with_sendmail(mut self, path: impl Into<String>) -> Self {
        self.sendmail = path.into();
        self
    }

    #[must_use]
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    fn render(&self, alert: &AlertRecord) -> String {
        let timestamp = chrono::DateTime::from_timestamp_millis(
            i64::try_from(alert.timestamp_ms).unwrap_or(0),
        )
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();
        format!(
            "From: {from}\r\nTo: {to}\r\nSubject: Stream supervisor alert: {alert_type}\r\n\r\n\
             Type: {alert_type}\r\nSeverity: {severity}\r\nTime: {timestamp}\r\n\
             Message: {message}\r\n\r\nData: {payload}\r\n",
            from = self.from,
            to = self.to,
            alert_type = alert.alert_type,
            severity = alert.severity,
            message = alert.message,
            payload = serde_json::to_string_pretty(&alert.payload).unwrap_or_default(),
        )
    }
}

impl AlertChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    fn deliver<'a>(&'a self, alert: &'a AlertRecord) -> AlertFuture<'a> {
        Box::pin(async move {
            use tokio::io::AsyncWriteExt;

            let mut child = tokio::process::Command::new(&self.sendmail)
                .arg("-t")
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| crate::Error::Alert(format!("spawn {}: {e}", self.sendmail)))?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(self.render(alert).as_bytes())
                    .await
                    .map_err(|e| crate::Error::Alert(format!("write to sendmail: {e}")))?;
            }

            let status = match tokio::time::timeout(self.wait_timeout, child.wait()).await {
                Ok(waited) => waited
                    .map_err(|e| crate::Error::Alert(format!("wait for sendmail: {e}")))?,
                Err(_) => {
                    // A wedged sendmail must not be left running.
                    child.start_kill().ok();
                    return Err(crate::Error::Alert("sendmail timed out".to_string()));
                }
            };

            if !status.success() {
                return Err(crate::Error::Alert(format!(
                    "sendmail exited with {status}"
                )));
            }
            info!(alert_type = %alert.alert_type, to = %self.to, "email alert sent");
            Ok(())
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Arc;

    /// Records every delivered alert; optionally fails each delivery.
    #[derive(Clone, Default)]
    pub struct MockChannel {
        pub delivered: Arc<Mutex<Vec<AlertRecord>>>,
        pub fail: bool,
    }

    impl MockChannel {
        pub fn delivered_types(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .iter()
                .map(|a| a.alert_type.clone())
                .collect()
        }
    }

    impl AlertChannel for MockChannel {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn deliver<'a>(&'a self, alert: &'a AlertRecord) -> AlertFuture<'a> {
            let delivered = Arc::clone(&self.delivered);
            let fail = self.fail;
            let alert = alert.clone();
            Box::pin(async move {
                if fail {
                    return Err(crate::Error::Alert("mock failure".to_string()));
                }
                delivered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(alert);
                Ok(())
            })
        }
    }
}
