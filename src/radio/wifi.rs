//! Wi-Fi link control.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum WifiError {
    #[error("failed to run nmcli: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("nmcli {action} failed: {stderr}")]
    Command { action: &'static str, stderr: String },
}

/// Upstream network link that may have to yield the radio.
#[async_trait]
pub trait WifiLink: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn disconnect(&self) -> Result<(), WifiError>;

    async fn reconnect(&self) -> Result<(), WifiError>;

    fn name(&self) -> &str;
}

/// NetworkManager-managed interface, driven through `nmcli`.
pub struct NmcliWifi {
    interface: String,
    /// Profile to bring up on reconnect; the device's autoconnect profile when empty.
    connection: String,
}

impl NmcliWifi {
    pub fn new(interface: impl Into<String>, connection: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            connection: connection.into(),
        }
    }

    async fn nmcli(&self, action: &'static str, args: &[&str]) -> Result<String, WifiError> {
        let output = Command::new("nmcli")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        if !output.status.success() {
            return Err(WifiError::Command {
                action,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Find the state of `interface` in `nmcli -t -f DEVICE,STATE device` output.
fn device_connected(output: &str, interface: &str) -> bool {
    output.lines().any(|line| {
        let mut fields = line.splitn(2, ':');
        fields.next() == Some(interface) && fields.next().map(str::trim) == Some("connected")
    })
}

#[async_trait]
impl WifiLink for NmcliWifi {
    async fn is_connected(&self) -> bool {
        match self
            .nmcli("status", &["-t", "-f", "DEVICE,STATE", "device"])
            .await
        {
            Ok(output) => device_connected(&output, &self.interface),
            Err(e) => {
                tracing::warn!("Wi-Fi status check failed: {}", e);
                false
            }
        }
    }

    async fn disconnect(&self) -> Result<(), WifiError> {
        tracing::info!("Wi-Fi: disconnecting {}", self.interface);
        self.nmcli("disconnect", &["device", "disconnect", &self.interface])
            .await
            .map(|_| ())
    }

    async fn reconnect(&self) -> Result<(), WifiError> {
        tracing::info!("Wi-Fi: reconnecting {}", self.interface);
        if self.connection.is_empty() {
            self.nmcli("connect", &["device", "connect", &self.interface]).await?;
        } else {
            self.nmcli("connect", &["connection", "up", &self.connection]).await?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.interface
    }
}

/// A link that never yields: wired uplinks and dual-radio boards.
pub struct StaticLink {
    online: AtomicBool,
}

impl StaticLink {
    pub fn online() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl WifiLink for StaticLink {
    async fn is_connected(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), WifiError> {
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), WifiError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "static"
    }
}
