//! Bluetooth Low Energy central transport.
//!
//! Talks to a MeshCore companion radio over a Nordic-UART-like GATT service:
//! we write frames to the TX characteristic and receive frames as
//! notifications on the RX characteristic. Each notification is one frame.
//!
//! # Requirements
//!
//! Enable the `ble` feature. On Linux, you'll also need:
//! ```bash
//! apt install libdbus-1-dev
//! ```

use super::{ByteTransport, CallbackSlots, RxCallback, StateCallback, TransportError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Nordic UART service.
pub const NUS_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Central → peripheral (write).
pub const NUS_TX_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Peripheral → central (notify).
pub const NUS_RX_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

/// MTU we ask the companion for; large enough for a channel-info response.
pub const PREFERRED_MTU: u16 = 185;

/// BLE link settings.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Advertised name of the companion (exact or substring match). Empty
    /// matches any device advertising the UART service.
    pub peer_name: String,
    pub pairing_pin: u32,
    pub scan_duration: Duration,
    pub service_discovery_retries: u32,
    pub service_discovery_delay: Duration,
    /// Settle time after connect before discovery (MTU exchange happens here).
    pub mtu_settle_delay: Duration,
    /// Settle time after subscribing before the first write.
    pub notify_settle_delay: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            peer_name: String::new(),
            pairing_pin: 123456,
            scan_duration: Duration::from_secs(10),
            service_discovery_retries: 5,
            service_discovery_delay: Duration::from_millis(1000),
            mtu_settle_delay: Duration::from_millis(2000),
            notify_settle_delay: Duration::from_millis(500),
        }
    }
}

/// Does an advertisement match the configured peer?
pub fn advert_matches(peer_name: &str, local_name: Option<&str>, services: &[Uuid]) -> bool {
    if let Some(name) = local_name {
        if !peer_name.is_empty() && (name == peer_name || name.contains(peer_name)) {
            return true;
        }
    }
    peer_name.is_empty() && services.contains(&NUS_SERVICE_UUID)
}

struct Link {
    peripheral: Peripheral,
    tx: Characteristic,
}

/// BLE GATT central transport.
pub struct BleCentralTransport {
    config: BleConfig,
    adapter: Option<Adapter>,
    link: Arc<tokio::sync::Mutex<Option<Link>>>,
    connected: Arc<AtomicBool>,
    callbacks: Arc<CallbackSlots>,
    last_error: Arc<Mutex<Option<String>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl BleCentralTransport {
    pub fn new(config: BleConfig) -> Self {
        Self {
            config,
            adapter: None,
            link: Arc::new(tokio::sync::Mutex::new(None)),
            connected: Arc::new(AtomicBool::new(false)),
            callbacks: CallbackSlots::new(),
            last_error: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }

    fn fail(&self, err: TransportError) -> TransportError {
        tracing::warn!("BLE: {}", err);
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    async fn scan(&self, adapter: &Adapter) -> Result<Peripheral, TransportError> {
        tracing::info!(
            "BLE: scanning {}s for '{}'",
            self.config.scan_duration.as_secs(),
            self.config.peer_name
        );
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
        tokio::time::sleep(self.config.scan_duration).await;
        let _ = adapter.stop_scan().await;

        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;

        for peripheral in peripherals {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            if advert_matches(
                &self.config.peer_name,
                props.local_name.as_deref(),
                &props.services,
            ) {
                tracing::info!(
                    "BLE: found {} ({})",
                    props.local_name.as_deref().unwrap_or("<unnamed>"),
                    props.address
                );
                return Ok(peripheral);
            }
        }
        Err(TransportError::ScanEmpty)
    }

    async fn discover(&self, peripheral: &Peripheral) -> Result<(), TransportError> {
        let retries = self.config.service_discovery_retries.max(1);
        for attempt in 1..=retries {
            match peripheral.discover_services().await {
                Ok(()) if peripheral.services().iter().any(|s| s.uuid == NUS_SERVICE_UUID) => {
                    return Ok(())
                }
                Ok(()) => tracing::debug!(
                    "BLE: UART service not listed (attempt {}/{})",
                    attempt,
                    retries
                ),
                Err(e) => tracing::debug!(
                    "BLE: service discovery failed (attempt {}/{}): {}",
                    attempt,
                    retries,
                    e
                ),
            }
            if attempt < retries {
                tokio::time::sleep(self.config.service_discovery_delay).await;
            }
        }
        Err(TransportError::ServiceMissing(NUS_SERVICE_UUID.to_string()))
    }

    async fn open_link(&mut self) -> Result<(), TransportError> {
        let adapter = self.adapter.clone().ok_or(TransportError::NotConnected)?;
        let peripheral = self.scan(&adapter).await?;

        peripheral.connect().await.map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("auth") || msg.to_lowercase().contains("pair") {
                TransportError::Pairing(msg)
            } else {
                TransportError::Bluetooth(msg)
            }
        })?;

        let peer = &peripheral;
        let tx = teardown_on_error(self.attach(&adapter, peer), || async move {
            tracing::info!("BLE: link setup failed, disconnecting from peer");
            if let Err(e) = peer.disconnect().await {
                tracing::debug!("BLE: disconnect after failed setup: {}", e);
            }
        })
        .await?;

        *self.link.lock().await = Some(Link { peripheral, tx });
        Ok(())
    }

    /// Everything after the GATT connection: discovery, subscription and the
    /// reader tasks. Returns the TX characteristic.
    async fn attach(&mut self, adapter: &Adapter, peripheral: &Peripheral) -> Result<Characteristic, TransportError> {
        // The stack negotiates MTU itself; give it time before discovery.
        tokio::time::sleep(self.config.mtu_settle_delay).await;
        self.discover(peripheral).await?;

        let chars = peripheral.characteristics();
        let tx = chars
            .iter()
            .find(|c| {
                c.uuid == NUS_TX_UUID
                    && c.properties
                        .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
            })
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicMissing(NUS_TX_UUID.to_string()))?;
        let rx = chars
            .iter()
            .find(|c| c.uuid == NUS_RX_UUID && c.properties.contains(CharPropFlags::NOTIFY))
            .cloned()
            .ok_or_else(|| TransportError::CharacteristicMissing(NUS_RX_UUID.to_string()))?;

        peripheral
            .subscribe(&rx)
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
        tokio::time::sleep(self.config.notify_settle_delay).await;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
        let callbacks = self.callbacks.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(n) = notifications.next().await {
                if n.uuid == NUS_RX_UUID {
                    tracing::trace!("BLE RX: {} bytes", n.value.len());
                    callbacks.deliver_rx(&n.value);
                }
            }
        }));

        let mut events = adapter
            .events()
            .await
            .map_err(|e| TransportError::Bluetooth(e.to_string()))?;
        let peer_id = peripheral.id();
        let connected = self.connected.clone();
        let callbacks = self.callbacks.clone();
        let last_error = self.last_error.clone();
        self.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peer_id && connected.swap(false, Ordering::AcqRel) {
                        tracing::warn!("BLE: peer disconnected");
                        *last_error.lock() = Some("peer disconnected".to_string());
                        callbacks.deliver_state(false);
                        break;
                    }
                }
            }
        }));

        Ok(tx)
    }
}

/// Await `setup`; if it fails, run `teardown` before returning the error.
async fn teardown_on_error<T, E, S, F, D>(setup: S, teardown: F) -> Result<T, E>
where
    S: Future<Output = Result<T, E>>,
    F: FnOnce() -> D,
    D: Future<Output = ()>,
{
    match setup.await {
        Ok(value) => Ok(value),
        Err(e) => {
            teardown().await;
            Err(e)
        }
    }
}

#[async_trait]
impl ByteTransport for BleCentralTransport {
    async fn init(&mut self) -> Result<(), TransportError> {
        if self.adapter.is_some() {
            return Ok(());
        }
        let manager = Manager::new()
            .await
            .map_err(|e| self.fail(TransportError::Bluetooth(e.to_string())))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| self.fail(TransportError::Bluetooth(e.to_string())))?
            .into_iter()
            .next()
            .ok_or_else(|| self.fail(TransportError::Bluetooth("no adapter".to_string())))?;

        // Bonding with the static PIN is handled by the host's pairing agent;
        // btleplug exposes neither MTU requests nor passkey entry.
        tracing::info!(
            "BLE: adapter ready (pairing PIN {:06}, preferred MTU {})",
            self.config.pairing_pin,
            PREFERRED_MTU
        );
        self.adapter = Some(adapter);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.adapter.is_none() {
            self.init().await?;
        }
        match self.open_link().await {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                *self.last_error.lock() = None;
                tracing::info!("BLE: connected to companion");
                self.callbacks.deliver_state(true);
                Ok(())
            }
            Err(e) => {
                for task in self.tasks.drain(..) {
                    task.abort();
                }
                Err(self.fail(e))
            }
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(self.fail(TransportError::NotConnected));
        }
        let link = self.link.lock().await;
        let Some(link) = link.as_ref() else {
            return Err(self.fail(TransportError::NotConnected));
        };
        tracing::trace!("BLE TX: {} bytes", data.len());
        link.peripheral
            .write(&link.tx, data, WriteType::WithResponse)
            .await
            .map_err(|e| self.fail(TransportError::Bluetooth(e.to_string())))
    }

    async fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(link) = self.link.lock().await.take() {
            let _ = link.peripheral.disconnect().await;
        }
        if self.connected.swap(false, Ordering::AcqRel) {
            self.callbacks.deliver_state(false);
        }
        self.adapter = None;
        tracing::info!("BLE: shut down");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn set_rx_cb(&self, cb: RxCallback) {
        self.callbacks.set_rx(cb);
    }

    fn set_state_cb(&self, cb: StateCallback) {
        self.callbacks.set_state(cb);
    }

    fn clear_callbacks(&self) {
        self.callbacks.clear();
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn name(&self) -> &str {
        "ble"
    }
}
