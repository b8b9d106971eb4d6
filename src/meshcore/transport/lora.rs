//! LoRa transport over an SX126x-class radio.
//!
//! LoRa is connectionless: the transport reports connected as soon as the
//! radio is configured. Every transmit is preceded by channel activity
//! detection and a randomised back-off so we do not talk over the mesh.

use super::{ByteTransport, CallbackSlots, RxCallback, StateCallback, TransportError};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Largest packet the SX126x FIFO accepts.
pub const MAX_PACKET_SIZE: usize = 255;

/// How often the receive task polls the radio.
const RX_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Random back-off window applied once the channel is clear.
const BACKOFF_MIN_MS: u64 = 200;
const BACKOFF_MAX_MS: u64 = 500;

/// Error reported by a radio driver.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("radio returned code {code}: {context}")]
pub struct RadioError {
    pub code: i32,
    pub context: String,
}

impl RadioError {
    pub fn new(code: i32, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }
}

/// PHY parameters. Defaults match the MeshCore network.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraParams {
    pub frequency_mhz: f32,
    pub bandwidth_khz: f32,
    pub spreading_factor: u8,
    /// Denominator of the 4/x coding rate.
    pub coding_rate: u8,
    pub sync_word: u16,
    pub tx_power_dbm: i8,
    pub preamble_len: u16,
    /// TCXO supply voltage on DIO3, if the board has one.
    pub tcxo_voltage: Option<f32>,
    pub crc: bool,
    pub invert_iq: bool,
    pub explicit_header: bool,

    pub max_tx_retries: u8,
    pub max_cad_retries: u8,
    pub cad_retry_delay: Duration,
    pub tx_retry_delay: Duration,
}

impl Default for LoraParams {
    fn default() -> Self {
        Self {
            frequency_mhz: 915.0,
            bandwidth_khz: 250.0,
            spreading_factor: 10,
            coding_rate: 5,
            sync_word: 0x1424,
            tx_power_dbm: 22,
            preamble_len: 16,
            tcxo_voltage: None,
            crc: true,
            invert_iq: false,
            explicit_header: true,
            max_tx_retries: 3,
            max_cad_retries: 5,
            cad_retry_delay: Duration::from_millis(500),
            tx_retry_delay: Duration::from_millis(1000),
        }
    }
}

/// Driver capability for an SX126x-class radio.
#[async_trait]
pub trait Sx126xRadio: Send + 'static {
    /// Apply the PHY configuration and leave the radio in standby.
    async fn configure(&mut self, params: &LoraParams) -> Result<(), RadioError>;

    /// Run channel activity detection. Returns `true` when a preamble is on air.
    async fn channel_busy(&mut self) -> Result<bool, RadioError>;

    async fn transmit(&mut self, data: &[u8]) -> Result<(), RadioError>;

    async fn start_receive(&mut self) -> Result<(), RadioError>;

    /// Fetch a received packet, if one is waiting.
    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>, RadioError>;

    async fn standby(&mut self) -> Result<(), RadioError>;
}

/// LoRa byte transport.
pub struct LoraTransport<R: Sx126xRadio> {
    radio: Arc<tokio::sync::Mutex<R>>,
    params: LoraParams,
    callbacks: Arc<CallbackSlots>,
    initialized: Arc<AtomicBool>,
    last_error: Mutex<Option<String>>,
    rx_task: Option<JoinHandle<()>>,
}

impl<R: Sx126xRadio> LoraTransport<R> {
    pub fn new(radio: R, params: LoraParams) -> Self {
        Self {
            radio: Arc::new(tokio::sync::Mutex::new(radio)),
            params,
            callbacks: CallbackSlots::new(),
            initialized: Arc::new(AtomicBool::new(false)),
            last_error: Mutex::new(None),
            rx_task: None,
        }
    }

    pub fn params(&self) -> &LoraParams {
        &self.params
    }

    fn fail(&self, err: TransportError) -> TransportError {
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    /// Wait for a clear channel. Returns the number of CAD attempts used.
    async fn wait_for_clear_channel(&self, radio: &mut R) -> Result<u8, TransportError> {
        let attempts = self.params.max_cad_retries.max(1);
        for attempt in 1..=attempts {
            let busy = radio
                .channel_busy()
                .await
                .map_err(|e| TransportError::Radio(e.to_string()))?;
            if !busy {
                return Ok(attempt);
            }
            tracing::debug!("LoRa: channel busy (CAD attempt {}/{})", attempt, attempts);
            if attempt < attempts {
                tokio::time::sleep(self.params.cad_retry_delay).await;
            }
        }
        Err(TransportError::ChannelBusy(attempts))
    }

    async fn transmit_once(&self, radio: &mut R, data: &[u8]) -> Result<(), TransportError> {
        self.wait_for_clear_channel(radio).await?;

        let backoff = rand::thread_rng().gen_range(BACKOFF_MIN_MS..=BACKOFF_MAX_MS);
        tokio::time::sleep(Duration::from_millis(backoff)).await;

        radio
            .standby()
            .await
            .map_err(|e| TransportError::Radio(e.to_string()))?;
        radio
            .transmit(data)
            .await
            .map_err(|e| TransportError::Radio(e.to_string()))
    }

    fn spawn_receiver(&mut self) {
        let radio = self.radio.clone();
        let callbacks = self.callbacks.clone();
        let initialized = self.initialized.clone();

        self.rx_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(RX_POLL_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while initialized.load(Ordering::Acquire) {
                interval.tick().await;
                let packet = {
                    let mut radio = radio.lock().await;
                    match radio.read_packet().await {
                        Ok(packet) => packet,
                        Err(e) => {
                            tracing::warn!("LoRa: read failed: {}", e);
                            let _ = radio.start_receive().await;
                            None
                        }
                    }
                };
                if let Some(packet) = packet {
                    if packet.is_empty() || packet.len() > MAX_PACKET_SIZE {
                        continue;
                    }
                    tracing::debug!("LoRa RX: {} bytes", packet.len());
                    callbacks.deliver_rx(&packet);
                }
            }
        }));
    }
}

#[async_trait]
impl<R: Sx126xRadio> ByteTransport for LoraTransport<R> {
    async fn init(&mut self) -> Result<(), TransportError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }

        let p = &self.params;
        tracing::info!(
            "LoRa: configuring {:.3} MHz, BW {:.1} kHz, SF{}, CR 4/{}, SW 0x{:04X}, {} dBm, preamble {}",
            p.frequency_mhz,
            p.bandwidth_khz,
            p.spreading_factor,
            p.coding_rate,
            p.sync_word,
            p.tx_power_dbm,
            p.preamble_len
        );

        {
            let mut radio = self.radio.lock().await;
            if let Err(e) = radio.configure(&self.params).await {
                return Err(self.fail(TransportError::Radio(e.to_string())));
            }
            if let Err(e) = radio.start_receive().await {
                tracing::warn!("LoRa: start_receive failed at init: {}", e);
            }
        }

        self.initialized.store(true, Ordering::Release);
        *self.last_error.lock() = None;
        self.spawn_receiver();
        self.callbacks.deliver_state(true);
        Ok(())
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            self.init().await
        }
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(self.fail(TransportError::NotConnected));
        }
        if data.is_empty() || data.len() > MAX_PACKET_SIZE {
            return Err(self.fail(TransportError::PacketSize(data.len())));
        }

        let mut radio = self.radio.lock().await;
        let attempts = self.params.max_tx_retries.max(1);
        let mut last_err = TransportError::NotConnected;

        for attempt in 1..=attempts {
            match self.transmit_once(&mut radio, data).await {
                Ok(()) => {
                    tracing::debug!("LoRa TX: {} bytes (attempt {})", data.len(), attempt);
                    if let Err(e) = radio.start_receive().await {
                        tracing::warn!("LoRa: start_receive failed after TX: {}", e);
                    }
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("LoRa TX attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = e;
                    if attempt < attempts {
                        tokio::time::sleep(self.params.tx_retry_delay).await;
                    }
                }
            }
        }

        let _ = radio.start_receive().await;
        Err(self.fail(last_err))
    }

    async fn shutdown(&mut self) {
        let was_up = self.initialized.swap(false, Ordering::AcqRel);
        if let Some(task) = self.rx_task.take() {
            task.abort();
        }
        let _ = self.radio.lock().await.standby().await;
        if was_up {
            self.callbacks.deliver_state(false);
            tracing::info!("LoRa radio shut down");
        }
    }

    fn is_connected(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
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
        "lora"
    }
}
