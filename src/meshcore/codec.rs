//! Frame codec.
//!
//! A frame is `[cmd: u8][payload]`. The transport preserves frame boundaries
//! and integrity, so there is no length prefix and no checksum.

use super::transport::{ByteTransport, TransportError};

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Largest frame accepted in either direction (cmd byte included).
pub const MAX_FRAME_SIZE: usize = 172;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds {max}", max = MAX_FRAME_SIZE)]
    TooLarge(usize),
    #[error("empty frame")]
    Empty,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(cmd: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            payload: payload.into(),
        }
    }

    /// Size on the wire, cmd byte included.
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        if self.wire_len() > MAX_FRAME_SIZE {
            return Err(CodecError::TooLarge(self.wire_len()));
        }
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(self.cmd);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        match data.split_first() {
            None => Err(CodecError::Empty),
            Some(_) if data.len() > MAX_FRAME_SIZE => Err(CodecError::TooLarge(data.len())),
            Some((&cmd, payload)) => Ok(Self::new(cmd, Bytes::copy_from_slice(payload))),
        }
    }
}

pub type FrameCallback = Arc<dyn Fn(Frame) + Send + Sync>;

/// Codec bound to a byte transport.
pub struct FrameCodec {
    transport: Box<dyn ByteTransport>,
    frame_cb: Arc<RwLock<Option<FrameCallback>>>,
}

impl FrameCodec {
    pub fn new(transport: Box<dyn ByteTransport>) -> Self {
        let frame_cb: Arc<RwLock<Option<FrameCallback>>> = Arc::new(RwLock::new(None));
        let slot = frame_cb.clone();
        transport.set_rx_cb(Arc::new(move |data: &[u8]| {
            let frame = match Frame::decode(data) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("codec: dropping inbound delivery: {}", e);
                    return;
                }
            };
            let cb = slot.read().clone();
            if let Some(cb) = cb {
                cb(frame);
            }
        }));
        Self {
            transport,
            frame_cb,
        }
    }

    pub fn set_frame_cb(&self, cb: FrameCallback) {
        *self.frame_cb.write() = Some(cb);
    }

    pub async fn send_frame(&self, cmd: u8, payload: &[u8]) -> Result<(), CodecError> {
        let bytes = Frame::new(cmd, Bytes::copy_from_slice(payload)).encode()?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    /// Drop the frame callback and every transport callback.
    pub fn clear_callbacks(&self) {
        *self.frame_cb.write() = None;
        self.transport.clear_callbacks();
    }

    pub fn transport(&self) -> &dyn ByteTransport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn ByteTransport {
        self.transport.as_mut()
    }
}
