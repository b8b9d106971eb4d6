//! Service model types.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::StoreError;

/// Longest `regex:` pattern accepted for an HttpGet expectation.
pub const MAX_REGEX_LEN: usize = 256;
/// Checks never run more often than this.
pub const MIN_CHECK_INTERVAL_S: u32 = 10;
pub const DEFAULT_CHECK_INTERVAL_S: u32 = 60;
/// Longest pause accepted, in seconds (46 days).
pub const MAX_PAUSE_S: u64 = 46 * 24 * 60 * 60;
pub const MAX_PAUSE_MS: u64 = MAX_PAUSE_S * 1000;

/// Kind of check. Persisted as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", into = "u8")]
pub enum ServiceKind {
    HttpGet,
    Ping,
    SnmpGet,
    PortOpen,
    Push,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::HttpGet => "http_get",
            ServiceKind::Ping => "ping",
            ServiceKind::SnmpGet => "snmp_get",
            ServiceKind::PortOpen => "port_open",
            ServiceKind::Push => "push",
        }
    }

    /// Kinds that need a resolvable host.
    pub fn needs_network(&self) -> bool {
        !matches!(self, ServiceKind::Push)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ServiceKind> for u8 {
    fn from(kind: ServiceKind) -> u8 {
        match kind {
            ServiceKind::HttpGet => 0,
            ServiceKind::Ping => 1,
            ServiceKind::SnmpGet => 2,
            ServiceKind::PortOpen => 3,
            ServiceKind::Push => 4,
        }
    }
}

impl TryFrom<u8> for ServiceKind {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(ServiceKind::HttpGet),
            1 => Ok(ServiceKind::Ping),
            2 => Ok(ServiceKind::SnmpGet),
            3 => Ok(ServiceKind::PortOpen),
            4 => Ok(ServiceKind::Push),
            other => Err(format!("unknown service type {}", other)),
        }
    }
}

impl TryFrom<&str> for ServiceKind {
    type Error = String;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        match name {
            "http_get" | "http" => Ok(ServiceKind::HttpGet),
            "ping" => Ok(ServiceKind::Ping),
            "snmp_get" | "snmp" => Ok(ServiceKind::SnmpGet),
            "port_open" | "port" => Ok(ServiceKind::PortOpen),
            "push" => Ok(ServiceKind::Push),
            other => Err(format!("unknown service type '{}'", other)),
        }
    }
}

/// SNMP comparison operator. Persisted as its integer code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "CodeOrName", into = "u8")]
pub enum CompareOp {
    #[default]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

impl From<CompareOp> for u8 {
    fn from(op: CompareOp) -> u8 {
        match op {
            CompareOp::Eq => 0,
            CompareOp::Ne => 1,
            CompareOp::Lt => 2,
            CompareOp::Le => 3,
            CompareOp::Gt => 4,
            CompareOp::Ge => 5,
        }
    }
}

impl TryFrom<u8> for CompareOp {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(CompareOp::Eq),
            1 => Ok(CompareOp::Ne),
            2 => Ok(CompareOp::Lt),
            3 => Ok(CompareOp::Le),
            4 => Ok(CompareOp::Gt),
            5 => Ok(CompareOp::Ge),
            other => Err(format!("unknown compare operator {}", other)),
        }
    }
}

impl TryFrom<&str> for CompareOp {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "=" | "==" | "eq" => Ok(CompareOp::Eq),
            "!=" | "<>" | "ne" => Ok(CompareOp::Ne),
            "<" | "lt" => Ok(CompareOp::Lt),
            "<=" | "le" => Ok(CompareOp::Le),
            ">" | "gt" => Ok(CompareOp::Gt),
            ">=" | "ge" => Ok(CompareOp::Ge),
            other => Err(format!("unknown compare operator '{}'", other)),
        }
    }
}

/// Integer code or symbolic name, as accepted from JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CodeOrName {
    Code(u8),
    Name(String),
}

macro_rules! code_or_name {
    ($ty:ty) => {
        impl TryFrom<CodeOrName> for $ty {
            type Error = String;

            fn try_from(value: CodeOrName) -> Result<Self, Self::Error> {
                match value {
                    CodeOrName::Code(code) => <$ty>::try_from(code),
                    CodeOrName::Name(name) => <$ty>::try_from(name.trim().to_lowercase().as_str()),
                }
            }
        }
    };
}

code_or_name!(ServiceKind);
code_or_name!(CompareOp);

fn default_true() -> bool {
    true
}

fn default_community() -> String {
    "public".to_string()
}

/// A monitored target, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub expected_response: String,
    #[serde(default)]
    pub snmp_oid: String,
    #[serde(default = "default_community")]
    pub snmp_community: String,
    #[serde(default)]
    pub snmp_compare_op: CompareOp,
    #[serde(default)]
    pub snmp_expected_value: String,
    #[serde(default)]
    pub push_token: String,
    pub check_interval: u32,
    pub fail_threshold: u32,
    pub pass_threshold: u32,
    #[serde(default)]
    pub rearm_count: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Monotonic deadline (ms) until which checks are skipped; 0 when not
    /// paused. Monotonic time restarts with the process, so this is not saved.
    #[serde(skip)]
    pub pause_until: u64,
}

impl Service {
    /// `host[:port]` as shown in notifications.
    pub fn target(&self) -> String {
        match self.kind {
            ServiceKind::HttpGet if !self.url.is_empty() => self.url.clone(),
            ServiceKind::HttpGet | ServiceKind::PortOpen | ServiceKind::SnmpGet => {
                format!("{}:{}", self.host, self.port)
            }
            ServiceKind::Push => "push endpoint".to_string(),
            ServiceKind::Ping => self.host.clone(),
        }
    }

    /// Remaining pause in ms, treating anything beyond the clamp as already
    /// expired (the deadline lies behind `now`).
    pub fn pause_remaining_ms(&self, now_ms: u64) -> u64 {
        if self.pause_until == 0 {
            return 0;
        }
        let remaining = self.pause_until.wrapping_sub(now_ms);
        if remaining > MAX_PAUSE_MS {
            0
        } else {
            remaining
        }
    }

    pub fn is_paused(&self, now_ms: u64) -> bool {
        self.pause_remaining_ms(now_ms) > 0
    }

    /// Pause for `seconds` from now (clamped); 0 resumes.
    pub fn set_pause(&mut self, seconds: u64, now_ms: u64) {
        self.pause_until = if seconds == 0 {
            0
        } else {
            now_ms.wrapping_add(seconds.min(MAX_PAUSE_S) * 1000)
        };
    }
}

/// Runtime state of a service. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceRuntime {
    pub is_up: bool,
    /// Set on the first Up; gates "service up" notifications after boot.
    pub has_been_up: bool,
    pub consecutive_passes: u32,
    pub consecutive_fails: u32,
    pub failed_checks_since_alert: u32,
    pub last_check: Option<u64>,
    pub last_uptime: Option<u64>,
    pub last_error: String,
    pub last_push: Option<u64>,
}

/// A service and its runtime state.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub service: Service,
    pub runtime: ServiceRuntime,
}

impl ServiceEntry {
    pub fn new(service: Service) -> Self {
        Self {
            service,
            runtime: ServiceRuntime::default(),
        }
    }
}

/// A service as submitted through the admin API or an import file.
/// Everything is optional; [`ServiceInput::into_service`] validates and
/// fills defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInput {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<CodeOrName>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub path: Option<String>,
    pub url: Option<String>,
    pub expected_response: Option<String>,
    pub snmp_oid: Option<String>,
    pub snmp_community: Option<String>,
    pub snmp_compare_op: Option<CodeOrName>,
    pub snmp_expected_value: Option<String>,
    pub push_token: Option<String>,
    pub check_interval: Option<i64>,
    pub fail_threshold: Option<i64>,
    pub pass_threshold: Option<i64>,
    pub rearm_count: Option<i64>,
    pub enabled: Option<bool>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn is_push_token(token: &str) -> bool {
    token.len() == 16 && token.chars().all(|c| c.is_ascii_hexdigit())
}

/// Fresh 16-hex-char push token.
pub fn generate_push_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Fresh opaque service id.
pub fn generate_service_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

impl ServiceInput {
    /// Validate and build a service with a fresh id.
    pub fn into_service(self) -> Result<Service, StoreError> {
        let name = non_empty(self.name)
            .ok_or_else(|| StoreError::Invalid("name is required".to_string()))?;
        let kind = match self.kind {
            Some(raw) => ServiceKind::try_from(raw).map_err(StoreError::Invalid)?,
            None => return Err(StoreError::Invalid("type is required".to_string())),
        };

        let host = non_empty(self.host).unwrap_or_default();
        let url = non_empty(self.url).unwrap_or_default();
        if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(StoreError::Invalid("url must start with http:// or https://".to_string()));
        }
        let host_optional = kind == ServiceKind::Push || (kind == ServiceKind::HttpGet && !url.is_empty());
        if host.is_empty() && !host_optional {
            return Err(StoreError::Invalid("host is required".to_string()));
        }

        let default_port = if kind == ServiceKind::SnmpGet { 161 } else { 80 };
        let port = self.port.unwrap_or(default_port);
        if !(1..=65535).contains(&port) {
            return Err(StoreError::Invalid(format!("port {} out of range", port)));
        }

        let expected_response = non_empty(self.expected_response).unwrap_or_else(|| "*".to_string());
        if let Some(pattern) = expected_response.strip_prefix("regex:") {
            if pattern.len() > MAX_REGEX_LEN {
                return Err(StoreError::Invalid(format!(
                    "regex pattern longer than {} characters",
                    MAX_REGEX_LEN
                )));
            }
        }

        let snmp_oid = non_empty(self.snmp_oid).unwrap_or_default();
        if kind == ServiceKind::SnmpGet && snmp_oid.is_empty() {
            return Err(StoreError::Invalid("snmpOid is required".to_string()));
        }
        let snmp_compare_op = match self.snmp_compare_op {
            Some(raw) => CompareOp::try_from(raw).map_err(StoreError::Invalid)?,
            None => CompareOp::Eq,
        };

        let push_token = match non_empty(self.push_token) {
            Some(token) if is_push_token(&token) => token.to_lowercase(),
            Some(_) => return Err(StoreError::Invalid("pushToken must be 16 hex characters".to_string())),
            None if kind == ServiceKind::Push => generate_push_token(),
            None => String::new(),
        };

        let clamp_min = |value: Option<i64>, default: i64, min: i64| -> u32 {
            value.unwrap_or(default).clamp(min, u32::MAX as i64) as u32
        };

        Ok(Service {
            id: generate_service_id(),
            name,
            kind,
            host,
            port: port as u16,
            path: non_empty(self.path).unwrap_or_else(|| "/".to_string()),
            url,
            expected_response,
            snmp_oid,
            snmp_community: non_empty(self.snmp_community).unwrap_or_else(default_community),
            snmp_compare_op,
            snmp_expected_value: self.snmp_expected_value.unwrap_or_default(),
            push_token,
            check_interval: clamp_min(
                self.check_interval,
                DEFAULT_CHECK_INTERVAL_S as i64,
                MIN_CHECK_INTERVAL_S as i64,
            ),
            fail_threshold: clamp_min(self.fail_threshold, 1, 1),
            pass_threshold: clamp_min(self.pass_threshold, 1, 1),
            rearm_count: clamp_min(self.rearm_count, 0, 0),
            enabled: self.enabled.unwrap_or(true),
            pause_until: 0,
        })
    }
}
