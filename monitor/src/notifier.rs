//! Failure notifications.
//!
//! The [`Notifier`] turns a failing [`TestRunResult`] into a
//! [`NotificationMessage`] and hands it to a [`NotificationSink`]. Delivery
//! problems are logged and reported as [`Delivery::Failed`]; they never
//! propagate into the watch pipeline.
//!
//! Built-in sinks:
//!
//! - [`DesktopSink`]: OS notification through `notify-send`, `osascript` or
//!   PowerShell, depending on the platform
//! - [`WebhookSink`]: JSON `POST` to a configured URL
//! - [`NullSink`]: accepts everything, shows nothing

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::{Config, ConfigError, NotificationChannel};
use crate::types::{FailureEntry, FailureSignature, TestRunResult};

/// Identifiers listed in a notification body before summarising the rest.
pub const MAX_LISTED_FAILURES: usize = 5;

/// Timeout for webhook requests.
const WEBHOOK_TIMEOUT_SECS: u64 = 10;

/// Timeout for the desktop notification helper process.
const DESKTOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by notification sinks.
#[derive(Error, Debug)]
pub enum NotificationError {
    /// The helper program could not be started.
    #[error("failed to run {program}: {source}")]
    Command {
        program: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The helper program exited unsuccessfully.
    #[error("{program} exited with status {status}: {stderr}")]
    CommandFailed {
        program: &'static str,
        status: i32,
        stderr: String,
    },

    /// The helper program did not finish in time.
    #[error("{program} timed out")]
    CommandTimeout { program: &'static str },

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The webhook answered with a non-success status.
    #[error("webhook returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Outcome of a notification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed,
}

impl Delivery {
    #[must_use]
    pub fn is_delivered(self) -> bool {
        matches!(self, Self::Delivered)
    }
}

/// The content of one failure notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub title: String,
    pub body: String,
    pub signature: FailureSignature,
    pub exit_code: i32,
    pub failures: Vec<FailureEntry>,
    pub finished_at: DateTime<Utc>,
    /// Host the watcher runs on.
    pub source: String,
}

impl NotificationMessage {
    /// Builds the message for a failing run.
    #[must_use]
    pub fn from_result(result: &TestRunResult) -> Self {
        let count = result.failures.len();
        let mut lines: Vec<String> = result
            .failures
            .iter()
            .take(MAX_LISTED_FAILURES)
            .map(|f| f.test_identifier.clone())
            .collect();
        if count > MAX_LISTED_FAILURES {
            lines.push(format!("…and {} more", count - MAX_LISTED_FAILURES));
        }

        Self {
            title: format!("Tests failing ({count})"),
            body: lines.join("\n"),
            signature: result.signature(),
            exit_code: result.exit_code,
            failures: result.failures.clone(),
            finished_at: result.finished_at,
            source: gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

/// A destination for failure notifications.
///
/// Implementations must be cheap to call repeatedly; the [`Notifier`] calls
/// `deliver` at most once per failing run.
pub trait NotificationSink: Send + Sync + fmt::Debug {
    /// Name used in log fields.
    fn name(&self) -> &'static str;

    /// Delivers `message`.
    fn deliver<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<(), NotificationError>>;
}

/// Accepts every notification without side effects.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn name(&self) -> &'static str {
        "none"
    }

    fn deliver<'a>(
        &'a self,
        _message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async { Ok(()) })
    }
}

/// Shows an OS desktop notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct DesktopSink;

impl DesktopSink {
    #[cfg(target_os = "macos")]
    fn command(message: &NotificationMessage) -> (&'static str, Command) {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            applescript_escape(&message.body),
            applescript_escape(&message.title)
        );
        let mut cmd = Command::new("osascript");
        cmd.arg("-e").arg(script);
        ("osascript", cmd)
    }

    #[cfg(windows)]
    fn command(message: &NotificationMessage) -> (&'static str, Command) {
        let script = format!(
            "[Windows.UI.Notifications.ToastNotificationManager, Windows.UI.Notifications, ContentType = WindowsRuntime] > $null; \
             $t = [Windows.UI.Notifications.ToastNotificationManager]::GetTemplateContent([Windows.UI.Notifications.ToastTemplateType]::ToastText02); \
             $x = $t.GetElementsByTagName('text'); \
             $x.Item(0).AppendChild($t.CreateTextNode('{}')) > $null; \
             $x.Item(1).AppendChild($t.CreateTextNode('{}')) > $null; \
             [Windows.UI.Notifications.ToastNotificationManager]::CreateToastNotifier('testwatch').Show([Windows.UI.Notifications.ToastNotification]::new($t))",
            message.title.replace('\'', "''"),
            message.body.replace('\'', "''")
        );
        let mut cmd = Command::new("powershell");
        cmd.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
        ("powershell", cmd)
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    fn command(message: &NotificationMessage) -> (&'static str, Command) {
        let mut cmd = Command::new("notify-send");
        cmd.arg("--app-name=testwatch")
            .arg("--urgency=critical")
            .arg(&message.title)
            .arg(&message.body);
        ("notify-send", cmd)
    }
}

#[cfg(any(target_os = "macos", test))]
fn applescript_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

impl NotificationSink for DesktopSink {
    fn name(&self) -> &'static str {
        "desktop"
    }

    fn deliver<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async move {
            let (program, mut cmd) = Self::command(message);
            cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

            let output = tokio::time::timeout(DESKTOP_TIMEOUT, cmd.output())
                .await
                .map_err(|_| NotificationError::CommandTimeout { program })?
                .map_err(|source| NotificationError::Command { program, source })?;

            if output.status.success() {
                Ok(())
            } else {
                Err(NotificationError::CommandFailed {
                    program,
                    status: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }
}

/// Posts notifications as JSON to a webhook.
#[derive(Debug, Clone)]
pub struct WebhookSink {
    url: String,
    client: Client,
}

impl WebhookSink {
    /// Creates a sink posting to `url`.
    ///
    /// # Errors
    ///
    /// Returns `NotificationError::Http` if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>) -> Result<Self, NotificationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl NotificationSink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn deliver<'a>(
        &'a self,
        message: &'a NotificationMessage,
    ) -> BoxFuture<'a, Result<(), NotificationError>> {
        Box::pin(async move {
            let response = self.client.post(&self.url).json(message).send().await?;
            let status = response.status();
            if status.is_success() {
                debug!(status = status.as_u16(), "Webhook accepted notification");
                return Ok(());
            }
            let body = response.text().await.unwrap_or_default();
            Err(NotificationError::Status {
                status: status.as_u16(),
                body,
            })
        })
    }
}

/// Delivers failure notifications through a sink.
#[derive(Debug, Clone)]
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    #[must_use]
    pub fn new(sink: impl NotificationSink + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    #[must_use]
    pub fn from_arc(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Creates a notifier for the configured channel.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the webhook channel has no URL or the HTTP
    /// client cannot be created.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        match config.notification_channel {
            NotificationChannel::Desktop => Ok(Self::new(DesktopSink)),
            NotificationChannel::None => Ok(Self::new(NullSink)),
            NotificationChannel::Webhook => {
                let url = config
                    .webhook_url
                    .clone()
                    .ok_or_else(|| ConfigError::MissingEnvVar("TESTWATCH_WEBHOOK_URL".to_string()))?;
                let sink = WebhookSink::new(url).map_err(|e| ConfigError::InvalidValue {
                    key: "TESTWATCH_WEBHOOK_URL".to_string(),
                    message: e.to_string(),
                })?;
                Ok(Self::new(sink))
            }
        }
    }

    #[must_use]
    pub fn channel_name(&self) -> &'static str {
        self.sink.name()
    }

    /// Notifies about a failing run. Errors are logged, never returned.
    pub async fn notify(&self, result: &TestRunResult) -> Delivery {
        let message = NotificationMessage::from_result(result);
        match self.sink.deliver(&message).await {
            Ok(()) => {
                info!(
                    channel = self.sink.name(),
                    signature = %message.signature.short(),
                    failures = message.failures.len(),
                    "Notification delivered"
                );
                Delivery::Delivered
            }
            Err(e) => {
                warn!(channel = self.sink.name(), error = %e, "Notification delivery failed");
                Delivery::Failed
            }
        }
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(DesktopSink)
    }
}
