//! MeshCore companion protocol session.
//!
//! Drives the handshake with the companion radio, discovers channels and
//! sends text messages. Exactly one request is in flight at a time; its
//! response is picked out of the inbound stream by a [`ResponseCapture`]
//! that is armed before the request is written.

use super::capture::{Disposition, ResponseCapture};
use super::codec::{CodecError, Frame, FrameCodec};
use super::codes::*;
use super::transport::{ByteTransport, TransportError};

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A channel-info response is `[code, index, name(32), secret(16)]`; we need
/// at least the name to match.
const MIN_CHANNEL_INFO_LEN: usize = 2 + CHANNEL_NAME_LEN;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connected,
    DeviceQueried,
    SessionReady,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::DeviceQueried => write!(f, "device_queried"),
            SessionState::SessionReady => write!(f, "session_ready"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("companion not connected")]
    NotConnected,
    #[error("session not ready")]
    SessionNotReady,
    #[error("timeout waiting for response to {command}")]
    Timeout { command: &'static str },
    #[error("{command}: expected 0x{expected:02X}, got 0x{got:02X}")]
    Unexpected {
        command: &'static str,
        expected: u8,
        got: u8,
    },
    #[error("channel '{0}' not found")]
    ChannelNotFound(String),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("{0} rejected by companion")]
    Rejected(&'static str),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone)]
pub struct ProtocolTimeouts {
    /// Every request/response step.
    pub response: Duration,
    /// Second phase of a message send (on-air confirmation).
    pub send_confirmation: Duration,
    /// How long to wait for the rest of a fragmented channel-info response.
    pub fragment_grace: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(5),
            send_confirmation: Duration::from_secs(10),
            fragment_grace: Duration::from_millis(500),
        }
    }
}

#[derive(Default)]
struct Shared {
    state: SessionState,
    capture: ResponseCapture,
    last_error: Option<String>,
    channel_index: Option<u8>,
}

/// Cut `text` to at most `max` bytes without splitting a character.
pub fn truncate_text(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub fn device_query_payload() -> Vec<u8> {
    vec![PROTOCOL_VERSION]
}

pub fn app_start_payload(app_name: &str) -> Vec<u8> {
    let mut payload = vec![PROTOCOL_VERSION, 0, 0, 0, 0, 0, 0];
    payload.extend_from_slice(app_name.as_bytes());
    payload
}

pub fn channel_message_payload(channel: u8, timestamp: u32, text: &str) -> Vec<u8> {
    let text = truncate_text(text, MAX_TEXT_LEN);
    let mut payload = Vec::with_capacity(6 + text.len());
    payload.push(TXT_TYPE_PLAIN);
    payload.push(channel);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload
}

pub fn direct_message_payload(pub_key: &[u8; PUB_KEY_LEN], timestamp: u32, text: &str) -> Vec<u8> {
    let text = truncate_text(text, MAX_TEXT_LEN);
    let mut payload = Vec::with_capacity(1 + PUB_KEY_LEN + 4 + text.len());
    payload.push(TXT_TYPE_PLAIN);
    payload.extend_from_slice(pub_key);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload.extend_from_slice(text.as_bytes());
    payload
}

/// Decode a 64-hex-char public key.
pub fn parse_public_key(hex_key: &str) -> Result<[u8; PUB_KEY_LEN], ProtocolError> {
    let hex_key = hex_key.trim();
    if hex_key.len() != PUB_KEY_LEN * 2 {
        return Err(ProtocolError::InvalidPublicKey(format!(
            "expected {} hex chars, got {}",
            PUB_KEY_LEN * 2,
            hex_key.len()
        )));
    }
    let mut key = [0u8; PUB_KEY_LEN];
    hex::decode_to_slice(hex_key, &mut key)
        .map_err(|e| ProtocolError::InvalidPublicKey(e.to_string()))?;
    Ok(key)
}

/// Parse a (possibly reassembled) channel-info response into `(index, name)`.
pub fn parse_channel_info(buf: &[u8]) -> Option<(u8, String)> {
    if buf.len() < MIN_CHANNEL_INFO_LEN || buf[0] != RESP_CHANNEL_INFO {
        return None;
    }
    let raw = &buf[2..2 + CHANNEL_NAME_LEN];
    let name = String::from_utf8_lossy(raw)
        .trim_end_matches([' ', '\0'])
        .to_string();
    Some((buf[1], name))
}

/// MeshCore timestamps are 32-bit Unix seconds.
fn mesh_timestamp() -> u32 {
    chrono::Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32
}

/// Companion protocol session over a frame codec.
pub struct CompanionProtocol {
    codec: FrameCodec,
    shared: Arc<Mutex<Shared>>,
    wake: Arc<Notify>,
    timeouts: ProtocolTimeouts,
}

impl CompanionProtocol {
    pub fn new(transport: Box<dyn ByteTransport>) -> Self {
        Self::with_timeouts(transport, ProtocolTimeouts::default())
    }

    pub fn with_timeouts(transport: Box<dyn ByteTransport>, timeouts: ProtocolTimeouts) -> Self {
        let codec = FrameCodec::new(transport);
        let shared = Arc::new(Mutex::new(Shared::default()));
        let wake = Arc::new(Notify::new());

        let frames_shared = shared.clone();
        let frames_wake = wake.clone();
        codec.set_frame_cb(Arc::new(move |frame: Frame| {
            tracing::trace!(
                "mesh RX: {} (0x{:02X}), {} bytes",
                response_name(frame.cmd),
                frame.cmd,
                frame.payload.len()
            );
            let disposition = frames_shared.lock().capture.on_frame(&frame);
            if matches!(
                disposition,
                Disposition::Captured | Disposition::Continuation | Disposition::Other(true)
            ) {
                frames_wake.notify_one();
            }
        }));

        let link_shared = shared.clone();
        let link_wake = wake.clone();
        codec.transport().set_state_cb(Arc::new(move |up: bool| {
            {
                let mut s = link_shared.lock();
                if up {
                    if s.state == SessionState::Disconnected {
                        s.state = SessionState::Connected;
                    }
                } else {
                    s.state = SessionState::Disconnected;
                    s.channel_index = None;
                    s.last_error = Some("transport disconnected".to_string());
                }
            }
            link_wake.notify_one();
        }));

        Self {
            codec,
            shared,
            wake,
            timeouts,
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    pub fn channel_index(&self) -> Option<u8> {
        self.shared.lock().channel_index
    }

    pub fn transport(&self) -> &dyn ByteTransport {
        self.codec.transport()
    }

    fn set_state(&self, state: SessionState) {
        self.shared.lock().state = state;
    }

    fn fail(&self, err: ProtocolError) -> ProtocolError {
        self.shared.lock().last_error = Some(err.to_string());
        err
    }

    /// Bring the transport up and connect it to the companion.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        if let Err(e) = self.codec.transport_mut().init().await {
            return Err(self.fail(e.into()));
        }
        if let Err(e) = self.codec.transport_mut().connect().await {
            return Err(self.fail(e.into()));
        }
        {
            let mut s = self.shared.lock();
            if s.state == SessionState::Disconnected {
                s.state = SessionState::Connected;
            }
            s.last_error = None;
        }
        tracing::info!("mesh: companion link up via {}", self.codec.transport().name());
        Ok(())
    }

    /// Wait until the armed capture completes, the wait is broken by an
    /// unexpected response, the link drops, or `timeout` expires.
    async fn wait_for(
        &self,
        command: &'static str,
        expected: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut s = self.shared.lock();
                if s.capture.is_captured() {
                    s.capture.disarm();
                    return Ok(s.capture.buffer().to_vec());
                }
                if let Some(got) = s.capture.unexpected() {
                    s.capture.disarm();
                    return Err(ProtocolError::Unexpected {
                        command,
                        expected,
                        got,
                    });
                }
                if s.state == SessionState::Disconnected {
                    s.capture.disarm();
                    return Err(ProtocolError::NotConnected);
                }
            }
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                self.shared.lock().capture.disarm();
                return Err(ProtocolError::Timeout { command });
            }
        }
    }

    /// Arm, send, wait. The slot is armed before the frame is written so a
    /// response delivered during the write is not lost.
    async fn request(
        &self,
        cmd: u8,
        payload: &[u8],
        primary: u8,
        alt: Option<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ProtocolError> {
        let command = command_name(cmd);
        self.shared.lock().capture.arm(primary, alt);
        tracing::debug!("mesh TX: {} ({} bytes)", command, payload.len() + 1);
        if let Err(e) = self.codec.send_frame(cmd, payload).await {
            self.shared.lock().capture.disarm();
            return Err(e.into());
        }
        self.wait_for(command, primary, timeout).await
    }

    /// Give a short capture the chance to collect continuation fragments.
    async fn collect_fragments(&self, mut buf: Vec<u8>, min_len: usize) -> Vec<u8> {
        let deadline = Instant::now() + self.timeouts.fragment_grace;
        while buf.len() < min_len {
            if tokio::time::timeout_at(deadline, self.wake.notified())
                .await
                .is_err()
            {
                break;
            }
            buf = self.shared.lock().capture.buffer().to_vec();
        }
        buf
    }

    /// Query the device and start an application session.
    pub async fn start_session(&self, app_name: &str) -> Result<(), ProtocolError> {
        if self.state() == SessionState::Disconnected {
            return Err(self.fail(ProtocolError::NotConnected));
        }

        if self.state() < SessionState::DeviceQueried {
            let info = self
                .request(
                    CMD_DEVICE_QUERY,
                    &device_query_payload(),
                    RESP_DEVICE_INFO,
                    Some(RESP_OK),
                    self.timeouts.response,
                )
                .await
                .map_err(|e| self.fail(e))?;
            if info[0] == RESP_DEVICE_INFO {
                tracing::info!(
                    "mesh: device info received (firmware protocol {})",
                    info.get(1).copied().unwrap_or_default()
                );
            } else {
                tracing::info!("mesh: device query acknowledged");
            }
            self.set_state(SessionState::DeviceQueried);
        }

        if self.state() < SessionState::SessionReady {
            let info = self
                .request(
                    CMD_APP_START,
                    &app_start_payload(app_name),
                    RESP_SELF_INFO,
                    None,
                    self.timeouts.response,
                )
                .await
                .map_err(|e| self.fail(e))?;
            tracing::info!("mesh: session ready as '{}' ({} byte self info)", app_name, info.len());
            self.set_state(SessionState::SessionReady);
        }
        Ok(())
    }

    fn require_session(&self) -> Result<(), ProtocolError> {
        match self.state() {
            SessionState::SessionReady => Ok(()),
            SessionState::Disconnected => Err(self.fail(ProtocolError::NotConnected)),
            _ => Err(self.fail(ProtocolError::SessionNotReady)),
        }
    }

    /// Find a channel by name (case-insensitive). Returns its index.
    pub async fn find_channel(&self, name: &str) -> Result<u8, ProtocolError> {
        self.require_session()?;
        let wanted = name.trim();
        if wanted.is_empty() {
            return Err(self.fail(ProtocolError::ChannelNotFound(String::new())));
        }

        for index in 0..MAX_CHANNELS {
            let reply = self
                .request(
                    CMD_GET_CHANNEL,
                    &[index],
                    RESP_CHANNEL_INFO,
                    Some(RESP_ERR),
                    self.timeouts.response,
                )
                .await;

            let buf = match reply {
                Ok(buf) if buf[0] == RESP_ERR => {
                    tracing::debug!("mesh: no channel at index {}, search ends", index);
                    break;
                }
                Ok(buf) => buf,
                Err(ProtocolError::Unexpected { got, .. }) => {
                    tracing::debug!("mesh: skipping index {} (got 0x{:02X})", index, got);
                    continue;
                }
                Err(e) => return Err(self.fail(e)),
            };

            let buf = if buf.len() < MIN_CHANNEL_INFO_LEN {
                self.collect_fragments(buf, MIN_CHANNEL_INFO_LEN).await
            } else {
                buf
            };

            let Some((channel, channel_name)) = parse_channel_info(&buf) else {
                tracing::debug!(
                    "mesh: short channel info at index {} ({} bytes), skipping",
                    index,
                    buf.len()
                );
                continue;
            };
            tracing::debug!("mesh: channel {} is '{}'", channel, channel_name);
            if channel_name.eq_ignore_ascii_case(wanted) {
                tracing::info!("mesh: channel '{}' at index {}", wanted, channel);
                self.shared.lock().channel_index = Some(channel);
                return Ok(channel);
            }
        }

        Err(self.fail(ProtocolError::ChannelNotFound(wanted.to_string())))
    }

    /// Send, then wait for the acknowledgement and the on-air confirmation.
    async fn send_text(&self, cmd: u8, payload: Vec<u8>) -> Result<(), ProtocolError> {
        let command = command_name(cmd);
        self.request(cmd, &payload, RESP_OK, Some(RESP_SENT), self.timeouts.response)
            .await
            .map_err(|e| self.fail(e))?;

        self.shared.lock().capture.arm(PUSH_SEND_CONFIRMED, Some(RESP_ERR));
        match self
            .wait_for(command, PUSH_SEND_CONFIRMED, self.timeouts.send_confirmation)
            .await
        {
            Ok(buf) if buf[0] == RESP_ERR => Err(self.fail(ProtocolError::Rejected(command))),
            Ok(_) => {
                tracing::debug!("mesh: {} confirmed on air", command);
                Ok(())
            }
            // The device already accepted the frame.
            Err(ProtocolError::Timeout { .. }) | Err(ProtocolError::Unexpected { .. }) => {
                tracing::debug!("mesh: no send confirmation for {}, assuming sent", command);
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Send text to a channel.
    pub async fn send_channel_message(&self, channel: u8, text: &str) -> Result<(), ProtocolError> {
        self.require_session()?;
        let payload = channel_message_payload(channel, mesh_timestamp(), text);
        self.send_text(CMD_SEND_CHANNEL_TXT_MSG, payload).await?;
        tracing::info!("mesh: sent {} bytes to channel {}", text.len().min(MAX_TEXT_LEN), channel);
        Ok(())
    }

    /// Send text to a contact. With a room password the text is sent as
    /// `password:text`, which room servers authenticate.
    pub async fn send_direct_message(
        &self,
        pub_key_hex: &str,
        text: &str,
        room_password: Option<&str>,
    ) -> Result<(), ProtocolError> {
        let key = parse_public_key(pub_key_hex).map_err(|e| self.fail(e))?;
        self.require_session()?;
        let text = match room_password {
            Some(password) if !password.is_empty() => format!("{}:{}", password, text),
            _ => text.to_string(),
        };
        let payload = direct_message_payload(&key, mesh_timestamp(), &text);
        self.send_text(CMD_SEND_TXT_MSG, payload).await?;
        tracing::info!("mesh: sent direct message to {}", hex::encode(&key[..4]));
        Ok(())
    }

    /// Clear callbacks on every layer, then take the transport down.
    pub async fn shutdown(&mut self) {
        self.codec.clear_callbacks();
        self.codec.transport_mut().shutdown().await;
        let mut s = self.shared.lock();
        s.state = SessionState::Disconnected;
        s.channel_index = None;
        s.capture.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meshcore::test_utils::{channel_info_frame, ScriptHandle, ScriptedTransport};

    const KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    /// A companion that completes the handshake and knows the given channels.
    fn companion(channels: Vec<&'static str>) -> (CompanionProtocol, ScriptHandle) {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        handle.set_responder(move |frame: &[u8]| match frame[0] {
            CMD_DEVICE_QUERY => vec![vec![RESP_OK]],
            CMD_APP_START => vec![vec![RESP_SELF_INFO, 1, 2, 3]],
            CMD_GET_CHANNEL => match channels.get(frame[1] as usize) {
                Some(name) => vec![channel_info_frame(frame[1], name)],
                None => vec![vec![RESP_ERR]],
            },
            CMD_SEND_CHANNEL_TXT_MSG | CMD_SEND_TXT_MSG => {
                vec![vec![RESP_SENT, 0, 1, 2, 3], vec![PUSH_SEND_CONFIRMED, 9, 9]]
            }
            _ => vec![vec![RESP_ERR]],
        });
        (CompanionProtocol::new(Box::new(transport)), handle)
    }

    #[test]
    fn test_truncate_text_respects_char_boundary() {
        assert_eq!(truncate_text("short", 140), "short");
        let long = "x".repeat(200);
        assert_eq!(truncate_text(&long, MAX_TEXT_LEN).len(), 140);
        let accented = format!("{}é", "a".repeat(139));
        assert_eq!(truncate_text(&accented, 140).len(), 139);
    }

    #[test]
    fn test_message_payload_layout() {
        let payload = channel_message_payload(2, 0x01020304, "hi");
        assert_eq!(payload, vec![0, 2, 0x04, 0x03, 0x02, 0x01, b'h', b'i']);

        let key = parse_public_key(KEY).unwrap();
        let payload = direct_message_payload(&key, 1, &"y".repeat(300));
        assert_eq!(payload.len(), 1 + 32 + 4 + 140);
        assert_eq!(&payload[1..33], &key);

        assert_eq!(app_start_payload("mw"), vec![3, 0, 0, 0, 0, 0, 0, b'm', b'w']);
    }

    #[test]
    fn test_public_key_validation() {
        assert!(matches!(
            parse_public_key(&KEY[..62]),
            Err(ProtocolError::InvalidPublicKey(_))
        ));
        let bad = format!("zz{}", &KEY[2..]);
        assert!(matches!(parse_public_key(&bad), Err(ProtocolError::InvalidPublicKey(_))));
        assert_eq!(parse_public_key(KEY).unwrap()[0], 0x01);
    }

    #[test]
    fn test_channel_info_parse() {
        let frame = channel_info_frame(3, "alerts");
        assert_eq!(parse_channel_info(&frame), Some((3, "alerts".to_string())));
        assert_eq!(parse_channel_info(&frame[..33]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_and_channel_lookup() {
        let (mut proto, handle) = companion(vec!["public", "alerts  "]);
        assert_eq!(proto.state(), SessionState::Disconnected);

        proto.connect().await.unwrap();
        assert_eq!(proto.state(), SessionState::Connected);
        proto.start_session("meshwatch").await.unwrap();
        assert_eq!(proto.state(), SessionState::SessionReady);

        let sent = handle.take_sent();
        assert_eq!(sent[0], vec![CMD_DEVICE_QUERY, PROTOCOL_VERSION]);
        assert_eq!(sent[1][0], CMD_APP_START);

        assert_eq!(proto.find_channel("Alerts").await.unwrap(), 1);
        assert_eq!(proto.channel_index(), Some(1));
        let sent = handle.take_sent();
        assert_eq!(sent, vec![vec![CMD_GET_CHANNEL, 0], vec![CMD_GET_CHANNEL, 1]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_channel_match_returns_zero() {
        let (mut proto, _handle) = companion(vec!["alerts"]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        assert_eq!(proto.find_channel("ALERTS").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fragmented_channel_info_is_reassembled() {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        handle.set_responder(|frame: &[u8]| match frame[0] {
            CMD_DEVICE_QUERY => vec![vec![RESP_DEVICE_INFO, 3]],
            CMD_APP_START => vec![vec![RESP_SELF_INFO]],
            CMD_GET_CHANNEL => {
                let full = channel_info_frame(0, "alerts");
                // Second fragment starts inside the space padding (0x20).
                vec![
                    vec![PUSH_MSG_WAITING],
                    full[..21].to_vec(),
                    full[21..].to_vec(),
                ]
            }
            _ => vec![],
        });
        let mut proto = CompanionProtocol::new(Box::new(transport));
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        assert_eq!(proto.find_channel("Alerts").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_channel_is_clean_not_found() {
        let (mut proto, _handle) = companion(vec!["public"]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();

        let err = proto.find_channel("alerts").await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChannelNotFound(ref n) if n == "alerts"));
        assert!(proto.last_error().unwrap().contains("not found"));

        assert!(matches!(
            proto.find_channel("  ").await,
            Err(ProtocolError::ChannelNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_send_waits_for_confirmation() {
        let (mut proto, handle) = companion(vec!["alerts"]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        handle.take_sent();

        proto.send_channel_message(0, "Service DOWN: web").await.unwrap();
        let sent = handle.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], CMD_SEND_CHANNEL_TXT_MSG);
        assert_eq!(&sent[0][1..3], &[TXT_TYPE_PLAIN, 0]);
        assert_eq!(&sent[0][7..], b"Service DOWN: web");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_confirmation_still_succeeds() {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        handle.set_responder(|frame: &[u8]| match frame[0] {
            CMD_DEVICE_QUERY => vec![vec![RESP_OK]],
            CMD_APP_START => vec![vec![RESP_SELF_INFO]],
            _ => vec![vec![RESP_OK]],
        });
        let mut proto = CompanionProtocol::new(Box::new(transport));
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        proto.send_channel_message(0, "hello").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_send_is_an_error() {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        handle.set_responder(|frame: &[u8]| match frame[0] {
            CMD_DEVICE_QUERY => vec![vec![RESP_OK]],
            CMD_APP_START => vec![vec![RESP_SELF_INFO]],
            _ => vec![vec![RESP_ERR, 2]],
        });
        let mut proto = CompanionProtocol::new(Box::new(transport));
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();

        let err = proto.send_channel_message(0, "hello").await.unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Unexpected { expected: RESP_OK, got: RESP_ERR, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_room_message_is_password_prefixed() {
        let (mut proto, handle) = companion(vec![]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        handle.take_sent();

        proto
            .send_direct_message(KEY, "Service UP: db", Some("hunter2"))
            .await
            .unwrap();
        let sent = handle.take_sent();
        assert_eq!(sent[0][0], CMD_SEND_TXT_MSG);
        assert_eq!(&sent[0][38..], b"hunter2:Service UP: db");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_key_rejected_before_any_send() {
        let (mut proto, handle) = companion(vec![]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();
        handle.take_sent();

        let err = proto.send_direct_message("abcd", "x", None).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPublicKey(_)));
        assert!(handle.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_companion_times_out() {
        let transport = ScriptedTransport::new();
        let mut proto = CompanionProtocol::new(Box::new(transport));
        proto.connect().await.unwrap();

        let err = proto.start_session("meshwatch").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout { command: "DEVICE_QUERY" }));
        assert_eq!(proto.state(), SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_session() {
        let (mut proto, _handle) = companion(vec![]);
        assert!(matches!(
            proto.send_channel_message(0, "x").await,
            Err(ProtocolError::NotConnected)
        ));
        proto.connect().await.unwrap();
        assert!(matches!(
            proto.send_channel_message(0, "x").await,
            Err(ProtocolError::SessionNotReady)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_drop_resets_state() {
        let (mut proto, handle) = companion(vec!["alerts"]);
        proto.connect().await.unwrap();
        proto.start_session("meshwatch").await.unwrap();

        handle.drop_link();
        assert_eq!(proto.state(), SessionState::Disconnected);
        assert!(proto.channel_index().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_clears_callbacks() {
        let (mut proto, handle) = companion(vec![]);
        proto.connect().await.unwrap();
        proto.shutdown().await;
        assert!(!handle.is_connected());
        // Late deliveries must go nowhere.
        handle.deliver(&[RESP_OK]);
        assert_eq!(proto.state(), SessionState::Disconnected);
    }
}
