//! In-memory transport for exercising the codec and the companion protocol.

use super::transport::{ByteTransport, CallbackSlots, RxCallback, StateCallback, TransportError};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Produces the frames the fake companion answers with for one written frame.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

#[derive(Default)]
struct Inner {
    callbacks: Arc<CallbackSlots>,
    sent: Mutex<Vec<Vec<u8>>>,
    responder: Mutex<Option<Responder>>,
    connected: AtomicBool,
    refuse_connect: AtomicBool,
    fail_sends: AtomicBool,
}

/// A frame-preserving transport whose peer is a script.
///
/// Replies produced by the responder are delivered before `send` returns,
/// which is the worst case for arm-before-send ordering.
pub struct ScriptedTransport {
    inner: Arc<Inner>,
}

/// Test-side view of a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptHandle {
    inner: Arc<Inner>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            inner: self.inner.clone(),
        }
    }
}

impl ScriptHandle {
    pub fn set_responder(&self, responder: impl FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static) {
        *self.inner.responder.lock() = Some(Box::new(responder));
    }

    pub fn refuse_connect(&self, refuse: bool) {
        self.inner.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.inner.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Inject an unsolicited delivery from the peer.
    pub fn deliver(&self, data: &[u8]) {
        self.inner.callbacks.deliver_rx(data);
    }

    /// Simulate the link dropping.
    pub fn drop_link(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.callbacks.deliver_state(false);
    }

    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner.sent.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteTransport for ScriptedTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.inner.refuse_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ScanEmpty);
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.callbacks.deliver_state(true);
        Ok(())
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        if self.inner.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Radio("scripted failure".to_string()));
        }
        self.inner.sent.lock().push(data.to_vec());
        let replies = match self.inner.responder.lock().as_mut() {
            Some(responder) => responder(data),
            None => Vec::new(),
        };
        for reply in replies {
            self.inner.callbacks.deliver_rx(&reply);
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.callbacks.deliver_state(false);
        }
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn set_rx_cb(&self, cb: RxCallback) {
        self.inner.callbacks.set_rx(cb);
    }

    fn set_state_cb(&self, cb: StateCallback) {
        self.inner.callbacks.set_state(cb);
    }

    fn clear_callbacks(&self) {
        self.inner.callbacks.clear();
    }

    fn last_error(&self) -> Option<String> {
        None
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Build a RESP_CHANNEL_INFO frame: `[0x12, index, name(32, space padded), secret(16)]`.
pub fn channel_info_frame(index: u8, name: &str) -> Vec<u8> {
    let mut frame = vec![super::codes::RESP_CHANNEL_INFO, index];
    let mut padded = name.as_bytes().to_vec();
    padded.resize(32, b' ');
    frame.extend_from_slice(&padded[..32]);
    frame.extend_from_slice(&[0xA5; 16]);
    frame
}
