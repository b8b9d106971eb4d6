//! Notification sinks, the retry queue and the fanout that ties them together.
//!
//! - [`ntfy::NtfyNotifier`] - ntfy topic over HTTP
//! - [`discord::DiscordNotifier`] - Discord webhook
//! - [`smtp::SmtpNotifier`] - plain-text email
//! - [`mesh::MeshNotifier`] - MeshCore channel and/or room server, batched per session

pub mod discord;
pub mod fanout;
pub mod mesh;
pub mod ntfy;
pub mod queue;
pub mod smtp;

pub use discord::DiscordNotifier;
pub use fanout::Fanout;
pub use mesh::{MeshNotifier, MeshStatus, TransportFactory};
pub use ntfy::NtfyNotifier;
pub use queue::{QueuedNotification, RetryQueue, MAX_QUEUE_ENTRIES};
pub use smtp::SmtpNotifier;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::meshcore::{ProtocolError, TransportError};
use crate::store::Service;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    Status(u16),
    #[error("SMTP error: {0}")]
    Smtp(String),
    #[error("mesh transport: {0}")]
    Transport(#[from] TransportError),
    #[error("mesh protocol: {0}")]
    Protocol(#[from] ProtocolError),
}

/// A delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Ntfy,
    Discord,
    Smtp,
    Mesh,
}

impl Channel {
    /// Sinks that need the upstream network.
    pub const INTERNET: [Channel; 3] = [Channel::Ntfy, Channel::Discord, Channel::Smtp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Ntfy => "ntfy",
            Channel::Discord => "discord",
            Channel::Smtp => "smtp",
            Channel::Mesh => "mesh",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channels that still owe a delivery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSet {
    pub ntfy: bool,
    pub discord: bool,
    pub smtp: bool,
    pub mesh: bool,
}

impl PendingSet {
    pub fn get(&self, channel: Channel) -> bool {
        match channel {
            Channel::Ntfy => self.ntfy,
            Channel::Discord => self.discord,
            Channel::Smtp => self.smtp,
            Channel::Mesh => self.mesh,
        }
    }

    pub fn set(&mut self, channel: Channel, pending: bool) {
        match channel {
            Channel::Ntfy => self.ntfy = pending,
            Channel::Discord => self.discord = pending,
            Channel::Smtp => self.smtp = pending,
            Channel::Mesh => self.mesh = pending,
        }
    }

    pub fn with(mut self, channel: Channel) -> Self {
        self.set(channel, true);
        self
    }

    pub fn union(self, other: PendingSet) -> Self {
        Self {
            ntfy: self.ntfy || other.ntfy,
            discord: self.discord || other.discord,
            smtp: self.smtp || other.smtp,
            mesh: self.mesh || other.mesh,
        }
    }

    pub fn any(&self) -> bool {
        self.any_internet() || self.mesh
    }

    pub fn any_internet(&self) -> bool {
        self.ntfy || self.discord || self.smtp
    }
}

/// One alert, as delivered to every sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub tags: String,
    pub is_up: bool,
}

impl Notification {
    pub fn offline(service: &Service, last_error: &str) -> Self {
        let mut message = format!("Service '{}' at {} is offline.", service.name, service.target());
        if !last_error.is_empty() {
            message.push_str(" Error: ");
            message.push_str(last_error);
        }
        Self {
            title: format!("Service DOWN: {}", service.name),
            message,
            tags: "warning,monitor".to_string(),
            is_up: false,
        }
    }

    pub fn online(service: &Service) -> Self {
        Self {
            title: format!("Service UP: {}", service.name),
            message: format!("Service '{}' at {} is back online.", service.name, service.target()),
            tags: "ok,monitor".to_string(),
            is_up: true,
        }
    }

    /// A one-off message that is not tied to a service edge.
    pub fn custom(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            tags: "monitor".to_string(),
            is_up: true,
        }
    }

    /// Single-line form used on the mesh.
    pub fn mesh_text(&self) -> String {
        format!("{}: {}", self.title, self.message)
    }
}

/// A sink that delivers one notification per call.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> Channel;

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Shared HTTP client for webhook sinks. Targets are often self-hosted with
/// self-signed certificates.
pub(crate) fn http_client() -> Result<reqwest::Client, NotifyError> {
    Ok(reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .danger_accept_invalid_certs(true)
        .build()?)
}
