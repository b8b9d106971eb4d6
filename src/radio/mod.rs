//! Coexistence arbiter between Wi-Fi and the mesh radio.
//!
//! On single-radio boards a mesh session takes a [`MeshLease`]: acquiring it
//! pauses monitoring and tears Wi-Fi down, releasing it brings Wi-Fi back and
//! resumes monitoring. On dual-radio boards leases are free.

mod mailbox;
mod wifi;

pub use mailbox::*;
pub use wifi::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::config::RadioMode;

pub struct RadioArbiter {
    mode: RadioMode,
    wifi: Arc<dyn WifiLink>,
    ble_op_in_progress: AtomicBool,
    monitoring_paused: AtomicBool,
    lease: Arc<Mutex<()>>,
    paused_tx: watch::Sender<bool>,
}

impl RadioArbiter {
    pub fn new(mode: RadioMode, wifi: Arc<dyn WifiLink>) -> Arc<Self> {
        let (paused_tx, _) = watch::channel(false);
        Arc::new(Self {
            mode,
            wifi,
            ble_op_in_progress: AtomicBool::new(false),
            monitoring_paused: AtomicBool::new(false),
            lease: Arc::new(Mutex::new(())),
            paused_tx,
        })
    }

    pub fn mode(&self) -> RadioMode {
        self.mode
    }

    pub fn wifi(&self) -> &Arc<dyn WifiLink> {
        &self.wifi
    }

    pub async fn wifi_connected(&self) -> bool {
        self.wifi.is_connected().await
    }

    pub fn ble_op_in_progress(&self) -> bool {
        self.ble_op_in_progress.load(Ordering::SeqCst)
    }

    pub fn monitoring_paused(&self) -> bool {
        self.monitoring_paused.load(Ordering::SeqCst)
    }

    /// Observe monitoring pause/resume.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused_tx.subscribe()
    }

    fn set_flags(&self, active: bool) {
        self.ble_op_in_progress.store(active, Ordering::SeqCst);
        self.monitoring_paused.store(active, Ordering::SeqCst);
        self.paused_tx.send_replace(active);
    }

    /// Wait for exclusive use of the mesh radio.
    pub async fn acquire_mesh(self: &Arc<Self>) -> MeshLease {
        let guard = self.lease.clone().lock_owned().await;

        if self.mode == RadioMode::Single {
            self.set_flags(true);
            if let Err(e) = self.wifi.disconnect().await {
                tracing::warn!("Arbiter: Wi-Fi teardown failed: {}", e);
            }
        }

        MeshLease {
            arbiter: self.clone(),
            _guard: guard,
            released: false,
        }
    }
}

/// Exclusive use of the mesh radio. Release with [`MeshLease::release`];
/// dropping the lease restores Wi-Fi in the background instead.
pub struct MeshLease {
    arbiter: Arc<RadioArbiter>,
    _guard: OwnedMutexGuard<()>,
    released: bool,
}

impl MeshLease {
    pub async fn release(mut self) {
        self.released = true;
        if self.arbiter.mode == RadioMode::Single {
            if let Err(e) = self.arbiter.wifi.reconnect().await {
                tracing::warn!("Arbiter: Wi-Fi reconnect failed: {}", e);
            }
            self.arbiter.set_flags(false);
        }
    }
}

impl Drop for MeshLease {
    fn drop(&mut self) {
        if self.released || self.arbiter.mode != RadioMode::Single {
            return;
        }
        tracing::warn!("Arbiter: mesh lease dropped without release");
        self.arbiter.set_flags(false);
        let wifi = self.arbiter.wifi.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = wifi.reconnect().await {
                    tracing::warn!("Arbiter: Wi-Fi reconnect failed: {}", e);
                }
            });
        }
    }
}
