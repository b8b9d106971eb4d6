//! meshwatch - uptime monitor with MeshCore alerting
//!
//! Checks services over the LAN and reports state changes to ntfy, Discord,
//! email and a MeshCore mesh network.

mod clock;
mod config;
mod meshcore;
mod notify;
mod probe;
mod radio;
mod scheduler;
mod status;
mod store;
mod web;

use clock::MonotonicClock;
use config::{AppConfig, MeshTransportKind, RadioMode};
use notify::{DiscordNotifier, Fanout, MeshNotifier, Notifier, NtfyNotifier, SmtpNotifier, TransportFactory};
use radio::{Mailbox, NmcliWifi, RadioArbiter, StaticLink, WifiLink};
use scheduler::Monitor;
use status::StatusLed;
use store::Store;
use web::{AppState, Server};

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Push edges waiting for the main loop.
const PUSH_QUEUE_DEPTH: usize = 32;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("meshwatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = Arc::new(AppConfig::load());
    tracing::info!("Starting meshwatch on port {}...", cfg.http_port);
    tracing::info!("Using service table at {}", cfg.data_path);

    let store = Arc::new(Store::open(&cfg.data_path)?);
    let clock = MonotonicClock::new();

    // Radio coexistence
    let wifi: Arc<dyn WifiLink> = match cfg.radio_mode {
        RadioMode::Single => Arc::new(NmcliWifi::new(&cfg.wifi_interface, &cfg.wifi_connection)),
        RadioMode::Dual => Arc::new(StaticLink::online()),
    };
    tracing::info!("Radio mode {} (Wi-Fi link: {})", cfg.radio_mode.as_str(), wifi.name());
    let arbiter = RadioArbiter::new(cfg.radio_mode, wifi);

    // Notification sinks
    let sinks = build_sinks(&cfg);
    let mesh = build_mesh(&cfg, &arbiter);
    let fanout = Arc::new(Fanout::new(sinks, mesh, arbiter.clone()));

    let mailbox = Arc::new(Mailbox::new());
    let led = Arc::new(StatusLed::default());
    let (push_tx, push_rx) = mpsc::channel(PUSH_QUEUE_DEPTH);

    let monitor = Monitor::new(
        store.clone(),
        fanout.clone(),
        arbiter.clone(),
        mailbox.clone(),
        led.clone(),
        clock,
    );
    tokio::spawn(monitor.run(push_rx));

    // Start web server
    let server = Server::new(AppState {
        config: cfg,
        store,
        fanout,
        arbiter,
        mailbox,
        led,
        push_tx,
        clock,
    });
    server.start().await?;

    Ok(())
}

/// Internet sinks that have their settings filled in.
fn build_sinks(cfg: &AppConfig) -> Vec<Arc<dyn Notifier>> {
    let mut sinks: Vec<Arc<dyn Notifier>> = Vec::new();

    if cfg.ntfy.is_configured() {
        match NtfyNotifier::new(cfg.ntfy.clone()) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => tracing::error!("ntfy disabled: {}", e),
        }
    }
    if cfg.discord.is_configured() {
        match DiscordNotifier::new(cfg.discord.clone()) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => tracing::error!("Discord disabled: {}", e),
        }
    }
    if cfg.smtp.is_configured() {
        match SmtpNotifier::new(cfg.smtp.clone()) {
            Ok(sink) => sinks.push(Arc::new(sink)),
            Err(e) => tracing::error!("SMTP disabled: {}", e),
        }
    }

    let names: Vec<&str> = sinks.iter().map(|s| s.channel().as_str()).collect();
    tracing::info!("Internet sinks: {:?}", names);
    sinks
}

fn build_mesh(cfg: &AppConfig, arbiter: &Arc<RadioArbiter>) -> Option<Arc<MeshNotifier>> {
    if !cfg.mesh.is_configured() {
        tracing::info!("MeshCore sink not configured");
        return None;
    }

    if let Err(reason) = cfg.mesh.transport.host_support() {
        tracing::error!(
            "MESH_TRANSPORT={}: {}; mesh sink disabled",
            cfg.mesh.transport.as_str(),
            reason
        );
        return None;
    }
    let factory: TransportFactory = match cfg.mesh.transport {
        MeshTransportKind::Ble => ble_factory(cfg),
        MeshTransportKind::None | MeshTransportKind::Lora => return None,
    };

    tracing::info!(
        "MeshCore sink over {} (channel '{}', room {})",
        cfg.mesh.transport.as_str(),
        cfg.mesh.channel,
        if cfg.mesh.room_key.is_empty() { "none" } else { "set" }
    );
    Some(Arc::new(MeshNotifier::new(cfg.mesh.clone(), factory, arbiter.clone())))
}

#[cfg(feature = "ble")]
fn ble_factory(cfg: &AppConfig) -> TransportFactory {
    use meshcore::transport::{BleCentralTransport, BleConfig};
    use meshcore::ByteTransport;

    let ble = BleConfig {
        peer_name: cfg.mesh.ble_peer_name.clone(),
        pairing_pin: cfg.mesh.ble_pairing_pin,
        scan_duration: std::time::Duration::from_secs(cfg.mesh.ble_scan_secs),
        ..Default::default()
    };
    Arc::new(move || {
        Ok(Box::new(BleCentralTransport::new(ble.clone())) as Box<dyn ByteTransport>)
    })
}

#[cfg(not(feature = "ble"))]
fn ble_factory(_cfg: &AppConfig) -> TransportFactory {
    use meshcore::TransportError;

    Arc::new(|| Err(TransportError::Bluetooth("built without the `ble` feature".to_string())))
}
