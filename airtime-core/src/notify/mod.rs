//! Lifecycle notifications sent to the status endpoint.

pub mod http;
pub mod rendered;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{AirtimeConfig, NotificationMode};

pub use http::HttpNotifier;
pub use rendered::RenderedSessionNotifier;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("endpoint answered {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("browser setup failed: {0}")]
    Browser(String),
    #[error("unexpected response: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Started,
    Finished,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Started => "started",
            RunStatus::Finished => "finished",
            RunStatus::Error => "error",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "started" => Ok(Self::Started),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            other => Err(format!("invalid run status: {other}")),
        }
    }
}

/// Body posted to the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleEvent {
    pub status: RunStatus,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LifecycleEvent {
    pub fn started(id: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Started,
            id: id.into(),
            message: None,
        }
    }

    pub fn finished(id: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Finished,
            id: id.into(),
            message: None,
        }
    }

    pub fn error(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            id: id.into(),
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event and returns the endpoint's response body.
    async fn notify(&self, event: &LifecycleEvent) -> Result<String, NotificationError>;
}

/// Used when no endpoint is configured; every event is dropped with a warning.
#[derive(Debug, Default)]
pub struct DisabledNotifier;

#[async_trait]
impl Notifier for DisabledNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<String, NotificationError> {
        warn!(
            status = %event.status,
            id = %event.id,
            "status endpoint not configured; event dropped"
        );
        Ok(String::new())
    }
}

pub fn notifier_from_config(config: &AirtimeConfig) -> Result<Arc<dyn Notifier>, NotificationError> {
    let Some(endpoint) = config.status_endpoint() else {
        return Ok(Arc::new(DisabledNotifier));
    };
    let section = &config.notification;
    let notifier: Arc<dyn Notifier> = match section.mode {
        NotificationMode::Plain => Arc::new(HttpNotifier::new(endpoint, section.timeout())?),
        NotificationMode::Rendered => Arc::new(RenderedSessionNotifier::from_section(endpoint, section)),
    };
    Ok(notifier)
}

/// Sends an event, logging the result. Failures never propagate.
pub async fn deliver(notifier: &dyn Notifier, event: &LifecycleEvent) -> bool {
    match notifier.notify(event).await {
        Ok(body) => {
            info!(status = %event.status, response = %body.trim(), "status notification sent");
            true
        }
        Err(err) => {
            warn!(status = %event.status, error = %err, "status notification failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_empty_message() {
        let started = serde_json::to_value(LifecycleEvent::started("run-7")).unwrap();
        assert_eq!(started, serde_json::json!({"status": "started", "id": "run-7"}));
        let failed = serde_json::to_value(LifecycleEvent::error("run-7", "engine exited 1")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({"status": "error", "id": "run-7", "message": "engine exited 1"})
        );
    }

    #[tokio::test]
    async fn disabled_notifier_swallows_events() {
        let notifier = DisabledNotifier;
        assert!(deliver(&notifier, &LifecycleEvent::finished("x")).await);
    }

    #[test]
    fn configured_endpoint_selects_http_notifier() {
        let mut config = AirtimeConfig::default();
        config.notification.endpoint = Some("http://127.0.0.1:9/status".into());
        assert!(notifier_from_config(&config).is_ok());
        config.notification.mode = NotificationMode::Rendered;
        assert!(notifier_from_config(&config).is_ok());
    }
}
