//! Expected-response capture slot.
//!
//! The companion may interleave unsolicited pushes with the answer to our
//! request, and a small MTU can split one response across several
//! notifications. The slot is armed with the code(s) we expect *before*
//! the request goes out; the frame handler then sorts every inbound frame
//! into captured, push, continuation or unexpected.

use super::codec::Frame;
use super::codes::{is_inbound_message, is_push_code, response_name, MAX_KNOWN_RESPONSE_CODE};

/// Bound on a captured (possibly reassembled) response.
pub const CAPTURE_BUFFER_SIZE: usize = 256;

/// What the frame handler did with one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Matched the armed code and was copied into the capture buffer.
    Captured,
    /// Unsolicited push; ignored for matching.
    Push,
    /// Appended to the previous capture.
    Continuation,
    /// Inbound text message; logged and dropped.
    Inbound,
    /// Recorded as the last response. `true` when it ends an armed wait.
    Other(bool),
}

#[derive(Debug, Default)]
pub struct ResponseCapture {
    primary: Option<u8>,
    alt: Option<u8>,
    captured: bool,
    captured_code: Option<u8>,
    buffer: Vec<u8>,
    unexpected: bool,
    last_response_code: Option<u8>,
    rx_buffer: Vec<u8>,
}

impl ResponseCapture {
    /// Arm for `primary` (or `alt`). Clears any previous capture first.
    pub fn arm(&mut self, primary: u8, alt: Option<u8>) {
        self.captured = false;
        self.captured_code = None;
        self.buffer.clear();
        self.unexpected = false;
        self.primary = Some(primary);
        self.alt = alt;
    }

    /// Stop matching. A completed capture stays readable and can still
    /// receive continuation fragments until the next `arm`.
    pub fn disarm(&mut self) {
        self.primary = None;
        self.alt = None;
    }

    pub fn is_armed(&self) -> bool {
        self.primary.is_some()
    }

    pub fn is_captured(&self) -> bool {
        self.captured
    }

    pub fn captured_code(&self) -> Option<u8> {
        self.captured_code
    }

    /// The captured frame, response code first.
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// The bytes that accompanied the captured code.
    pub fn captured_payload(&self) -> &[u8] {
        self.buffer.get(1..).unwrap_or(&[])
    }

    /// An armed wait saw a response it did not ask for.
    pub fn unexpected(&self) -> Option<u8> {
        if self.unexpected {
            self.last_response_code
        } else {
            None
        }
    }

    pub fn last_response_code(&self) -> Option<u8> {
        self.last_response_code
    }

    pub fn rx_buffer(&self) -> &[u8] {
        &self.rx_buffer
    }

    fn matches(&self, cmd: u8) -> bool {
        self.primary == Some(cmd) || self.alt == Some(cmd)
    }

    fn append_bounded(&mut self, bytes: &[u8]) {
        let room = CAPTURE_BUFFER_SIZE.saturating_sub(self.buffer.len());
        self.buffer.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn on_frame(&mut self, frame: &Frame) -> Disposition {
        let cmd = frame.cmd;

        if self.is_armed() && !self.captured && self.matches(cmd) {
            self.buffer.clear();
            self.append_bounded(&[cmd]);
            self.append_bounded(&frame.payload);
            self.captured_code = Some(cmd);
            self.captured = true;
            return Disposition::Captured;
        }

        if is_push_code(cmd) {
            tracing::debug!("mesh: push {} (0x{:02X}) ignored", response_name(cmd), cmd);
            return Disposition::Push;
        }

        if self.captured && cmd > MAX_KNOWN_RESPONSE_CODE {
            self.append_bounded(&[cmd]);
            self.append_bounded(&frame.payload);
            tracing::debug!(
                "mesh: continuation fragment of {} bytes, capture now {} bytes",
                frame.wire_len(),
                self.buffer.len()
            );
            return Disposition::Continuation;
        }

        if is_inbound_message(cmd) {
            tracing::info!(
                "mesh: inbound {} ({} bytes) dropped",
                response_name(cmd),
                frame.payload.len()
            );
            return Disposition::Inbound;
        }

        self.last_response_code = Some(cmd);
        self.rx_buffer.clear();
        self.rx_buffer.push(cmd);
        self.rx_buffer.extend_from_slice(&frame.payload);

        let ends_wait = self.is_armed() && !self.captured;
        if ends_wait {
            self.unexpected = true;
        }
        Disposition::Other(ends_wait)
    }
}
