use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use super::{LifecycleEvent, NotificationError, Notifier};

/// Posts the event as JSON straight to the endpoint.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, NotificationError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<String, NotificationError> {
        let response = self.client.post(&self.endpoint).json(event).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        let notifier =
            HttpNotifier::new("http://127.0.0.1:9/status", Duration::from_secs(2)).unwrap();
        let err = notifier
            .notify(&LifecycleEvent::started("run-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::Transport(_)));
    }
}
