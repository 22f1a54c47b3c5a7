use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig as ChromiumConfig};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::NotificationSection;

use super::{LifecycleEvent, NotificationError, Notifier};

#[derive(Debug, Deserialize)]
struct FetchResult {
    status: u16,
    body: String,
}

/// Delivers events from inside a headless browser page opened on the endpoint, so the
/// request carries whatever session the page establishes.
#[derive(Debug, Clone)]
pub struct RenderedSessionNotifier {
    endpoint: String,
    executable: Option<PathBuf>,
    headless: bool,
    sandbox: bool,
    render_wait: Duration,
    timeout: Duration,
}

impl RenderedSessionNotifier {
    pub fn from_section(endpoint: impl Into<String>, section: &NotificationSection) -> Self {
        Self {
            endpoint: endpoint.into(),
            executable: section
                .chromium_executable
                .as_deref()
                .filter(|value| !value.trim().is_empty())
                .map(PathBuf::from),
            headless: section.headless,
            sandbox: section.sandbox,
            render_wait: section.render_wait(),
            timeout: section.timeout(),
        }
    }

    fn chromium_config(&self) -> Result<ChromiumConfig, NotificationError> {
        let mut builder = ChromiumConfig::builder().request_timeout(self.timeout);
        if let Some(executable) = &self.executable {
            builder = builder.chrome_executable(executable);
        }
        if !self.headless {
            builder = builder.with_head();
        }
        if !self.sandbox {
            builder = builder.no_sandbox();
        }
        builder = builder.args(vec![
            "--disable-gpu".to_string(),
            "--no-first-run".to_string(),
            "--mute-audio".to_string(),
        ]);
        builder.build().map_err(NotificationError::Browser)
    }

    async fn deliver(&self, event: &LifecycleEvent) -> Result<String, NotificationError> {
        let (mut browser, mut handler) = Browser::launch(self.chromium_config()?)
            .await
            .map_err(|err| NotificationError::Browser(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    debug!(error = %err, "chromium handler reported error");
                }
            }
        });

        let result = self.post_from_page(&browser, event).await;

        if let Err(err) = browser.close().await {
            warn!(error = %err, "failed to close browser gracefully");
        }
        if let Err(err) = handler_task.await {
            warn!(error = %err, "browser handler join error");
        }
        result
    }

    async fn post_from_page(
        &self,
        browser: &Browser,
        event: &LifecycleEvent,
    ) -> Result<String, NotificationError> {
        let page = browser.new_page(self.endpoint.as_str()).await?;
        page.wait_for_navigation().await?;
        tokio::time::sleep(self.render_wait).await;
        info!(status = %event.status, "posting status from rendered session");

        let params = EvaluateParams::builder()
            .expression(fetch_script(&self.endpoint, event)?)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(NotificationError::Browser)?;
        let outcome: FetchResult = page.evaluate_expression(params).await?.into_value()?;
        if !(200..300).contains(&outcome.status) {
            return Err(NotificationError::Rejected {
                status: outcome.status,
                body: outcome.body,
            });
        }
        Ok(outcome.body)
    }
}

#[async_trait]
impl Notifier for RenderedSessionNotifier {
    async fn notify(&self, event: &LifecycleEvent) -> Result<String, NotificationError> {
        tokio::time::timeout(self.timeout, self.deliver(event))
            .await
            .map_err(|_| NotificationError::Timeout(self.timeout))?
    }
}

/// In-page `fetch` that posts the event and resolves to `{status, body}`.
pub fn fetch_script(endpoint: &str, event: &LifecycleEvent) -> Result<String, NotificationError> {
    let url = serde_json::to_string(endpoint)?;
    let payload = serde_json::to_string(event)?;
    Ok(format!(
        "(async () => {{ \
            const response = await fetch({url}, {{ \
                method: 'POST', \
                credentials: 'include', \
                headers: {{ 'Content-Type': 'application/json' }}, \
                body: JSON.stringify({payload}) \
            }}); \
            return {{ status: response.status, body: await response.text() }}; \
        }})()"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_embeds_endpoint_and_payload_as_literals() {
        let script = fetch_script(
            "https://ops.example.com/status?x=\"1\"",
            &LifecycleEvent::error("run-3", "it's broken"),
        )
        .unwrap();
        assert!(script.starts_with("(async () => {"));
        assert!(script.contains(r#"fetch("https://ops.example.com/status?x=\"1\"", {"#));
        assert!(script.contains(
            r#"JSON.stringify({"status":"error","id":"run-3","message":"it's broken"})"#
        ));
        assert!(script.ends_with("})()"));
    }

    #[test]
    fn section_values_are_carried_over() {
        let section = NotificationSection {
            chromium_executable: Some("/usr/bin/chromium".into()),
            render_wait_ms: 500,
            ..NotificationSection::default()
        };
        let notifier = RenderedSessionNotifier::from_section("https://ops.example.com/status", &section);
        assert_eq!(notifier.render_wait, Duration::from_millis(500));
        assert_eq!(notifier.executable, Some(PathBuf::from("/usr/bin/chromium")));
        assert!(notifier.chromium_config().is_ok());
    }
}
