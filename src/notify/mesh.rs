//! MeshCore sink.
//!
//! Messages go out in batches: one lease on the radio, one companion session
//! (connect, handshake, channel lookup), then every message with a short gap.
//! On single-radio boards the session is torn down after each batch; on
//! dual-radio boards it is kept for the next one.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use super::{Channel, Notification, Notifier, NotifyError};
use crate::config::{MeshConfig, RadioMode};
use crate::meshcore::{ByteTransport, CompanionProtocol, ProtocolError, ProtocolTimeouts, SessionState, TransportError};
use crate::radio::RadioArbiter;

/// Gap between messages within one session.
pub const BATCH_SPACING: Duration = Duration::from_millis(100);

/// Builds a fresh transport for each session.
pub type TransportFactory = Arc<dyn Fn() -> Result<Box<dyn ByteTransport>, TransportError> + Send + Sync>;

/// Mesh sink diagnostics.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStatus {
    pub configured: bool,
    pub transport: String,
    pub peer_name: String,
    pub connected: bool,
    pub channel: String,
    pub channel_ready: bool,
    pub channel_index: Option<u8>,
    pub protocol_state: String,
    pub last_error: Option<String>,
}

pub struct MeshNotifier {
    config: MeshConfig,
    factory: TransportFactory,
    arbiter: Arc<RadioArbiter>,
    timeouts: ProtocolTimeouts,
    status: parking_lot::Mutex<MeshStatus>,
    session: tokio::sync::Mutex<Option<CompanionProtocol>>,
}

impl MeshNotifier {
    pub fn new(config: MeshConfig, factory: TransportFactory, arbiter: Arc<RadioArbiter>) -> Self {
        Self::with_timeouts(config, factory, arbiter, ProtocolTimeouts::default())
    }

    pub fn with_timeouts(
        config: MeshConfig,
        factory: TransportFactory,
        arbiter: Arc<RadioArbiter>,
        timeouts: ProtocolTimeouts,
    ) -> Self {
        let status = MeshStatus {
            configured: config.is_configured(),
            transport: config.transport.as_str().to_string(),
            peer_name: config.ble_peer_name.clone(),
            channel: config.channel.clone(),
            protocol_state: SessionState::Disconnected.to_string(),
            ..Default::default()
        };
        Self {
            config,
            factory,
            arbiter,
            timeouts,
            status: parking_lot::Mutex::new(status),
            session: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    pub fn status(&self) -> MeshStatus {
        self.status.lock().clone()
    }

    fn record(&self, proto: Option<&CompanionProtocol>, error: Option<String>) {
        let mut status = self.status.lock();
        match proto {
            Some(proto) => {
                status.connected = proto.transport().is_connected();
                status.protocol_state = proto.state().to_string();
                status.channel_index = proto.channel_index();
            }
            None => {
                status.connected = false;
                status.protocol_state = SessionState::Disconnected.to_string();
                status.channel_index = None;
            }
        }
        status.channel_ready = status.channel_index.is_some();
        if error.is_some() {
            status.last_error = error;
        }
    }

    /// Deliver every message in one session. An `Err` means no session could
    /// be opened; otherwise each message has its own result.
    pub async fn send_batch(
        &self,
        messages: &[Notification],
    ) -> Result<Vec<Result<(), NotifyError>>, NotifyError> {
        if messages.is_empty() {
            return Ok(Vec::new());
        }

        tracing::info!("mesh: starting session for {} message(s)", messages.len());
        let lease = self.arbiter.acquire_mesh().await;
        let mut slot = self.session.lock().await;

        let outcome = match self.ensure_session(&mut slot).await {
            Ok(()) => {
                let mut results = Vec::with_capacity(messages.len());
                if let Some(proto) = slot.as_ref() {
                    for (i, message) in messages.iter().enumerate() {
                        if i > 0 {
                            tokio::time::sleep(BATCH_SPACING).await;
                        }
                        let result = self.deliver(proto, message).await;
                        if let Err(e) = &result {
                            tracing::warn!("mesh: failed to send '{}': {}", message.title, e);
                        }
                        results.push(result);
                    }
                }
                Ok(results)
            }
            Err(e) => {
                tracing::warn!("mesh: session failed: {}", e);
                Err(e)
            }
        };

        let error = match &outcome {
            Err(e) => Some(e.to_string()),
            Ok(results) => results.iter().find_map(|r| r.as_ref().err().map(|e| e.to_string())),
        };
        self.record(slot.as_ref(), error);

        let keep = self.arbiter.mode() == RadioMode::Dual
            && slot.as_ref().is_some_and(|p| p.state() == SessionState::SessionReady);
        if !keep {
            if let Some(mut proto) = slot.take() {
                proto.shutdown().await;
            }
            self.record(None, None);
        }
        drop(slot);
        lease.release().await;

        outcome
    }

    async fn ensure_session(&self, slot: &mut Option<CompanionProtocol>) -> Result<(), NotifyError> {
        if let Some(proto) = slot.as_ref() {
            if proto.state() == SessionState::SessionReady {
                return Ok(());
            }
        }
        if let Some(mut stale) = slot.take() {
            stale.shutdown().await;
        }

        let transport = (self.factory)()?;
        let mut proto = CompanionProtocol::with_timeouts(transport, self.timeouts.clone());
        match self.open(&mut proto).await {
            Ok(()) => {
                *slot = Some(proto);
                Ok(())
            }
            Err(e) => {
                self.record(Some(&proto), Some(e.to_string()));
                proto.shutdown().await;
                Err(e.into())
            }
        }
    }

    async fn open(&self, proto: &mut CompanionProtocol) -> Result<(), ProtocolError> {
        proto.connect().await?;
        proto.start_session(&self.config.app_name).await?;
        if !self.config.channel.is_empty() {
            let index = proto.find_channel(&self.config.channel).await?;
            tracing::info!("mesh: channel '{}' is index {}", self.config.channel, index);
        }
        Ok(())
    }

    /// Send one message to every configured destination.
    async fn deliver(&self, proto: &CompanionProtocol, message: &Notification) -> Result<(), NotifyError> {
        let text = message.mesh_text();
        if !self.config.channel.is_empty() {
            let index = proto
                .channel_index()
                .ok_or_else(|| ProtocolError::ChannelNotFound(self.config.channel.clone()))?;
            proto.send_channel_message(index, &text).await?;
        }
        if !self.config.room_key.is_empty() {
            let password = Some(self.config.room_password.as_str()).filter(|p| !p.is_empty());
            proto
                .send_direct_message(&self.config.room_key, &text, password)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Notifier for MeshNotifier {
    fn channel(&self) -> Channel {
        Channel::Mesh
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.send_batch(std::slice::from_ref(notification))
            .await?
            .pop()
            .unwrap_or(Ok(()))
    }
}
