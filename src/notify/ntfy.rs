//! ntfy sink.

use async_trait::async_trait;
use base64::Engine;

use super::{http_client, Channel, Notification, Notifier, NotifyError};
use crate::config::NtfyConfig;

pub struct NtfyNotifier {
    config: NtfyConfig,
    client: reqwest::Client,
}

impl NtfyNotifier {
    pub fn new(config: NtfyConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }

    pub fn topic_url(&self) -> String {
        format!("{}/{}", self.config.server, self.config.topic)
    }
}

/// Header values must be ASCII; ntfy accepts RFC 2047 encoded words otherwise.
fn header_text(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        value.to_string()
    } else {
        format!(
            "=?UTF-8?B?{}?=",
            base64::engine::general_purpose::STANDARD.encode(value)
        )
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    fn channel(&self) -> Channel {
        Channel::Ntfy
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self
            .client
            .post(self.topic_url())
            .header("Title", header_text(&notification.title))
            .header("Tags", header_text(&notification.tags))
            .header("Content-Type", "text/plain")
            .body(notification.message.clone());

        if !self.config.token.is_empty() {
            request = request.bearer_auth(&self.config.token);
        } else if !self.config.username.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        tracing::info!("ntfy notification sent: {}", status.as_u16());
        Ok(())
    }
}
