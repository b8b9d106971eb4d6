//! Configuration module for meshwatch.
//!
//! Loads configuration from `MESHWATCH_*` environment variables with sensible
//! defaults. A notification sink whose required fields are empty counts as
//! not configured and is skipped.

use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::meshcore::transport::LoraParams;

const PREFIX: &str = "MESHWATCH_";

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: String, value: String },
}

/// Whether Wi-Fi and the mesh radio can run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioMode {
    /// Wi-Fi must go down for every mesh session.
    Single,
    Dual,
}

impl RadioMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioMode::Single => "single",
            RadioMode::Dual => "dual",
        }
    }
}

impl FromStr for RadioMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "single" => Ok(RadioMode::Single),
            "dual" => Ok(RadioMode::Dual),
            other => Err(ConfigError::Invalid {
                key: "RADIO_MODE".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Link used to reach the MeshCore radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshTransportKind {
    None,
    Ble,
    Lora,
}

impl MeshTransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshTransportKind::None => "none",
            MeshTransportKind::Ble => "ble",
            MeshTransportKind::Lora => "lora",
        }
    }

    /// Whether this build can open the link on the host, with the reason
    /// when it cannot. LoRa has no host SX126x driver; `LoraTransport` only
    /// runs against an `Sx126xRadio` supplied by an embedding.
    pub fn host_support(&self) -> Result<(), &'static str> {
        match self {
            MeshTransportKind::None => Err("mesh transport is disabled"),
            MeshTransportKind::Ble if cfg!(feature = "ble") => Ok(()),
            MeshTransportKind::Ble => Err("built without the `ble` feature"),
            MeshTransportKind::Lora => Err("no SX126x driver is available on this host"),
        }
    }
}

impl FromStr for MeshTransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" => Ok(MeshTransportKind::None),
            "ble" => Ok(MeshTransportKind::Ble),
            "lora" => Ok(MeshTransportKind::Lora),
            other => Err(ConfigError::Invalid {
                key: "MESH_TRANSPORT".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NtfyConfig {
    pub server: String,
    pub topic: String,
    pub token: String,
    pub username: String,
    pub password: String,
}

impl NtfyConfig {
    pub fn is_configured(&self) -> bool {
        !self.server.is_empty() && !self.topic.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiscordConfig {
    pub webhook_url: String,
}

impl DiscordConfig {
    pub fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub username: String,
    pub password: String,
    pub from: String,
    pub to: Vec<String>,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 587,
            use_tls: true,
            username: String::new(),
            password: String::new(),
            from: String::new(),
            to: Vec::new(),
        }
    }
}

impl SmtpConfig {
    pub fn is_configured(&self) -> bool {
        !self.server.is_empty() && !self.from.is_empty() && !self.to.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub transport: MeshTransportKind,
    pub app_name: String,
    /// Channel to post alerts to.
    pub channel: String,
    /// Room server public key, 64 hex chars.
    pub room_key: String,
    pub room_password: String,
    pub ble_peer_name: String,
    pub ble_pairing_pin: u32,
    pub ble_scan_secs: u64,
    pub lora: LoraParams,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            transport: MeshTransportKind::None,
            app_name: "meshwatch".to_string(),
            channel: String::new(),
            room_key: String::new(),
            room_password: String::new(),
            ble_peer_name: String::new(),
            ble_pairing_pin: 123456,
            ble_scan_secs: 10,
            lora: LoraParams::default(),
        }
    }
}

impl MeshConfig {
    /// A transport plus at least one destination.
    pub fn is_configured(&self) -> bool {
        self.transport != MeshTransportKind::None
            && (!self.channel.is_empty() || !self.room_key.is_empty())
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// HTTP port for the admin API (default: 8080)
    pub http_port: u16,
    /// Path of the persisted service table (default: "services.json")
    pub data_path: String,
    pub web_username: String,
    pub web_password: String,
    pub radio_mode: RadioMode,
    pub wifi_interface: String,
    /// NetworkManager profile to bring up after a mesh session.
    pub wifi_connection: String,
    pub ntfy: NtfyConfig,
    pub discord: DiscordConfig,
    pub smtp: SmtpConfig,
    pub mesh: MeshConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            data_path: "services.json".to_string(),
            web_username: String::new(),
            web_password: String::new(),
            radio_mode: RadioMode::Single,
            wifi_interface: "wlan0".to_string(),
            wifi_connection: String::new(),
            ntfy: NtfyConfig {
                server: "https://ntfy.sh".to_string(),
                ..Default::default()
            },
            discord: DiscordConfig::default(),
            smtp: SmtpConfig::default(),
            mesh: MeshConfig::default(),
        }
    }
}

/// Reads prefixed keys from a lookup, trimming and dropping empty values.
struct Source<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Source<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", PREFIX, key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = self.get(key) {
            *target = value;
        }
    }

    /// Parse into `target`, keeping the default on a bad value.
    fn parse<T: FromStr>(&self, key: &str, target: &mut T) {
        if let Some(value) = self.get(key) {
            match value.parse() {
                Ok(parsed) => *target = parsed,
                Err(_) => tracing::warn!("Ignoring invalid {}{}='{}'", PREFIX, key, value),
            }
        }
    }

    fn flag(&self, key: &str, target: &mut bool) {
        if let Some(value) = self.get(key) {
            match value.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => *target = true,
                "0" | "false" | "no" | "off" => *target = false,
                _ => tracing::warn!("Ignoring invalid {}{}='{}'", PREFIX, key, value),
            }
        }
    }
}

fn parse_sync_word(value: &str) -> Option<u16> {
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Every key is prefixed `MESHWATCH_`, e.g. `MESHWATCH_HTTP_PORT`.
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        let src = Source { lookup };
        let mut cfg = Self::default();

        src.parse("HTTP_PORT", &mut cfg.http_port);
        src.string("DATA_PATH", &mut cfg.data_path);
        src.string("WEB_USERNAME", &mut cfg.web_username);
        src.string("WEB_PASSWORD", &mut cfg.web_password);
        src.parse("RADIO_MODE", &mut cfg.radio_mode);
        src.string("WIFI_INTERFACE", &mut cfg.wifi_interface);
        src.string("WIFI_CONNECTION", &mut cfg.wifi_connection);

        src.string("NTFY_SERVER", &mut cfg.ntfy.server);
        cfg.ntfy.server = cfg.ntfy.server.trim_end_matches('/').to_string();
        src.string("NTFY_TOPIC", &mut cfg.ntfy.topic);
        src.string("NTFY_TOKEN", &mut cfg.ntfy.token);
        src.string("NTFY_USERNAME", &mut cfg.ntfy.username);
        src.string("NTFY_PASSWORD", &mut cfg.ntfy.password);

        src.string("DISCORD_WEBHOOK_URL", &mut cfg.discord.webhook_url);

        src.string("SMTP_SERVER", &mut cfg.smtp.server);
        src.parse("SMTP_PORT", &mut cfg.smtp.port);
        src.flag("SMTP_USE_TLS", &mut cfg.smtp.use_tls);
        src.string("SMTP_USERNAME", &mut cfg.smtp.username);
        src.string("SMTP_PASSWORD", &mut cfg.smtp.password);
        src.string("SMTP_FROM", &mut cfg.smtp.from);
        if let Some(to) = src.get("SMTP_TO") {
            cfg.smtp.to = to
                .split(',')
                .map(|addr| addr.trim().to_string())
                .filter(|addr| !addr.is_empty())
                .collect();
        }

        let mesh = &mut cfg.mesh;
        src.parse("MESH_TRANSPORT", &mut mesh.transport);
        src.string("MESH_APP_NAME", &mut mesh.app_name);
        src.string("MESH_CHANNEL", &mut mesh.channel);
        src.string("MESH_ROOM_KEY", &mut mesh.room_key);
        src.string("MESH_ROOM_PASSWORD", &mut mesh.room_password);
        src.string("BLE_PEER_NAME", &mut mesh.ble_peer_name);
        src.parse("BLE_PAIRING_PIN", &mut mesh.ble_pairing_pin);
        src.parse("BLE_SCAN_SECS", &mut mesh.ble_scan_secs);

        let lora = &mut mesh.lora;
        src.parse("LORA_FREQUENCY", &mut lora.frequency_mhz);
        src.parse("LORA_BANDWIDTH", &mut lora.bandwidth_khz);
        src.parse("LORA_SF", &mut lora.spreading_factor);
        src.parse("LORA_CR", &mut lora.coding_rate);
        if let Some(value) = src.get("LORA_SYNC_WORD") {
            match parse_sync_word(&value) {
                Some(word) => lora.sync_word = word,
                None => tracing::warn!("Ignoring invalid {}LORA_SYNC_WORD='{}'", PREFIX, value),
            }
        }
        src.parse("LORA_TX_POWER", &mut lora.tx_power_dbm);
        src.parse("LORA_PREAMBLE", &mut lora.preamble_len);
        if let Some(value) = src.get("LORA_TCXO_VOLTAGE") {
            match value.parse::<f32>() {
                Ok(volts) => lora.tcxo_voltage = Some(volts),
                Err(_) => tracing::warn!("Ignoring invalid {}LORA_TCXO_VOLTAGE='{}'", PREFIX, value),
            }
        }

        cfg
    }

    pub fn auth_enabled(&self) -> bool {
        !self.web_username.is_empty() && !self.web_password.is_empty()
    }
}
