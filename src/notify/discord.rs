//! Discord webhook sink.

use async_trait::async_trait;
use serde_json::json;

use super::{http_client, Channel, Notification, Notifier, NotifyError};
use crate::config::DiscordConfig;

pub struct DiscordNotifier {
    config: DiscordConfig,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn new(config: DiscordConfig) -> Result<Self, NotifyError> {
        Ok(Self {
            config,
            client: http_client()?,
        })
    }
}

pub fn webhook_payload(notification: &Notification) -> serde_json::Value {
    json!({ "content": format!("**{}**\n{}", notification.title, notification.message) })
}

#[async_trait]
impl Notifier for DiscordNotifier {
    fn channel(&self) -> Channel {
        Channel::Discord
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&webhook_payload(notification))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Status(status.as_u16()));
        }
        tracing::info!("Discord notification sent: {}", status.as_u16());
        Ok(())
    }
}
