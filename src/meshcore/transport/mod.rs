//! Byte transports for the MeshCore companion link.
//!
//! A transport is a frame-preserving byte pipe: every delivery handed to the
//! receive callback is exactly one frame written by the peer.
//!
//! - [`ble::BleCentralTransport`] - BLE GATT central talking to a companion
//!   radio over a Nordic-UART-like service (requires the `ble` feature)
//! - [`lora::LoraTransport`] - direct SX126x-class radio with carrier sense

#[cfg(feature = "ble")]
pub mod ble;
pub mod lora;

#[cfg(feature = "ble")]
pub use ble::{BleCentralTransport, BleConfig};
pub use lora::{LoraParams, LoraTransport, RadioError, Sx126xRadio};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("no matching peer found during scan")]
    ScanEmpty,
    #[error("service {0} not found on peer")]
    ServiceMissing(String),
    #[error("characteristic {0} not found on peer")]
    CharacteristicMissing(String),
    #[error("pairing failed: {0}")]
    Pairing(String),
    #[error("bluetooth error: {0}")]
    Bluetooth(String),
    #[error("radio error: {0}")]
    Radio(String),
    #[error("channel busy after {0} CAD attempts")]
    ChannelBusy(u8),
    #[error("invalid packet size: {0} bytes")]
    PacketSize(usize),
}

/// Receives one inbound frame worth of bytes.
pub type RxCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Receives link up (`true`) / link down (`false`) transitions.
pub type StateCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Callback registrations shared between a transport and its background tasks.
///
/// Callbacks are cloned out of the lock before being invoked, so a callback may
/// itself clear the registrations without deadlocking.
#[derive(Default)]
pub struct CallbackSlots {
    rx: RwLock<Option<RxCallback>>,
    state: RwLock<Option<StateCallback>>,
}

impl CallbackSlots {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_rx(&self, cb: RxCallback) {
        *self.rx.write() = Some(cb);
    }

    pub fn set_state(&self, cb: StateCallback) {
        *self.state.write() = Some(cb);
    }

    pub fn clear(&self) {
        *self.rx.write() = None;
        *self.state.write() = None;
    }

    pub fn deliver_rx(&self, data: &[u8]) {
        let cb = self.rx.read().clone();
        if let Some(cb) = cb {
            cb(data);
        }
    }

    pub fn deliver_state(&self, connected: bool) {
        let cb = self.state.read().clone();
        if let Some(cb) = cb {
            cb(connected);
        }
    }
}

/// Capability shared by every byte transport.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Bring the hardware up.
    async fn init(&mut self) -> Result<(), TransportError>;

    /// Establish the link to the peer. Connectionless transports succeed
    /// immediately once initialised.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Tear the link and the hardware down.
    async fn shutdown(&mut self);

    fn is_connected(&self) -> bool;

    fn set_rx_cb(&self, cb: RxCallback);

    fn set_state_cb(&self, cb: StateCallback);

    /// Drop every registered callback. Must be called before the layers above
    /// are destroyed so in-flight deliveries cannot reach freed state.
    fn clear_callbacks(&self);

    /// Short human-readable description of the last failure.
    fn last_error(&self) -> Option<String>;

    /// Interface name (for logging).
    fn name(&self) -> &str;
}
