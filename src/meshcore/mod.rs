//! MeshCore companion radio stack.
//!
//! Three layers, bottom up:
//!
//! 1. [`transport`] - frame-preserving byte pipes (BLE central, direct LoRa)
//! 2. [`codec`] - `[cmd][payload]` framing
//! 3. [`protocol`] - session handshake, channel discovery and text sends

pub mod capture;
pub mod codec;
pub mod codes;
pub mod protocol;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use codec::{CodecError, Frame, FrameCodec, MAX_FRAME_SIZE};
pub use protocol::{CompanionProtocol, ProtocolError, ProtocolTimeouts, SessionState};
pub use transport::{ByteTransport, TransportError};
