//! Push notifications through an ntfy-compatible HTTP endpoint.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;

use pty_session::Notifier;

/// Posts each notification to `<base_url>/<topic>` with the title in a header.
pub struct NtfyNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl NtfyNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build notification HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn topic_url(&self, topic: &str) -> String {
        format!("{}/{}", self.base_url, topic.trim_start_matches('/'))
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn notify(&self, topic: &str, title: &str, message: &str) -> Result<()> {
        let url = self.topic_url(topic);
        let resp = self
            .client
            .post(&url)
            .header("Title", title)
            .body(message.to_string())
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Notification rejected: {} {}", status, body);
        }
        Ok(())
    }
}
