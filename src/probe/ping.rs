//! ICMP ping check with native sockets and a `ping` command fallback.
//!
//! Native echoes run on a blocking socket inside `spawn_blocking`.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::ProbeError;

/// Echoes sent per check; one reply is enough to pass.
pub const PING_COUNT: u16 = 3;

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn detect_icmp_capability() -> IcmpCapability {
    if open_icmp_socket(Domain::IPV4).is_ok() {
        tracing::info!("Ping check: using native ICMP sockets");
        IcmpCapability::Native
    } else {
        tracing::info!("Ping check: native ICMP unavailable, using ping command");
        IcmpCapability::CommandOnly
    }
}

/// RAW needs CAP_NET_RAW; DGRAM works unprivileged where ping_group_range allows.
fn open_icmp_socket(domain: Domain) -> std::io::Result<Socket> {
    let protocol = if domain == Domain::IPV6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };
    Socket::new(domain, Type::RAW, Some(protocol))
        .or_else(|_| Socket::new(domain, Type::DGRAM, Some(protocol)))
}

/// Ping `host` up to [`PING_COUNT`] times. Returns the first round-trip time.
pub async fn check_ping(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

    if capability == IcmpCapability::Native {
        let ip = resolve_host(host).await?;
        let result = tokio::task::spawn_blocking(move || ping_blocking(ip, PING_COUNT, timeout))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(ProbeError::Network(msg)) if msg.contains("Permission") || msg.contains("not permitted") => {
                tracing::warn!("Native ping to {} not permitted, falling back to command", host);
            }
            other => return other,
        }
    }

    ping_command(host, timeout).await
}

pub(crate) async fn resolve_host(host: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    tokio::net::lookup_host(format!("{}:0", host))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn ping_blocking(ip: IpAddr, count: u16, timeout: Duration) -> Result<Duration, ProbeError> {
    let (domain, request_type, reply_type) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, ICMP_ECHO_REQUEST, ICMP_ECHO_REPLY),
        IpAddr::V6(_) => (Domain::IPV6, ICMPV6_ECHO_REQUEST, ICMPV6_ECHO_REPLY),
    };
    let socket = open_icmp_socket(domain)
        .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;
    socket
        .connect(&SocketAddr::new(ip, 0).into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;
    let socket: UdpSocket = socket.into();
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;

    let identifier: u16 = rand::random();
    let mut last_err = ProbeError::Timeout(timeout);

    for _ in 0..count {
        let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let packet = build_echo_request(request_type, identifier, sequence);
        match echo_once(&socket, &packet, reply_type, sequence, timeout) {
            Ok(rtt) => return Ok(rtt),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn echo_once(
    socket: &UdpSocket,
    packet: &[u8],
    reply_type: u8,
    sequence: u16,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let start = Instant::now();
    socket
        .send(packet)
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut buf = [0u8; 1500];
    loop {
        let len = socket.recv(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                ProbeError::Timeout(timeout)
            }
            _ => ProbeError::Network(format!("failed to receive: {}", e)),
        })?;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }
        if is_matching_reply(&buf[..len], reply_type, sequence) {
            return Ok(elapsed);
        }
    }
}

/// RAW IPv4 sockets hand us the IP header too; DGRAM sockets do not.
/// DGRAM sockets also rewrite the identifier, so replies are matched on
/// type and sequence only.
fn is_matching_reply(buf: &[u8], reply_type: u8, sequence: u16) -> bool {
    let offset = if reply_type == ICMP_ECHO_REPLY && buf.first().map(|b| b >> 4) == Some(4) {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    let Some(icmp) = buf.get(offset..offset + 8) else {
        return false;
    };
    icmp[0] == reply_type && u16::from_be_bytes([icmp[6], icmp[7]]) == sequence
}

fn build_echo_request(kind: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = kind;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(b"meshwtch");
    // The kernel fills in the ICMPv6 checksum.
    if kind == ICMP_ECHO_REQUEST {
        let checksum = icmp_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    }
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

async fn ping_command(host: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let timeout_secs = timeout.as_secs().max(1);

    let output = Command::new("ping")
        .args([
            "-c",
            &PING_COUNT.to_string(),
            "-W",
            &timeout_secs.to_string(),
            host,
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| ProbeError::Command(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    if !output.status.success() {
        if stdout.contains("100% packet loss") || stdout.contains("100.0% packet loss") {
            return Err(ProbeError::Timeout(timeout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ProbeError::Command(format!("ping failed: {}", stderr.trim())));
    }

    Ok(parse_ping_output(&stdout).unwrap_or_default())
}

/// First per-packet `time=X ms` from `ping` output.
fn parse_ping_output(output: &str) -> Option<Duration> {
    static TIME_RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = TIME_RE
        .get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").ok())
        .as_ref()?;
    let ms: f64 = re.captures(output)?.name("val")?.as_str().parse().ok()?;
    Some(Duration::from_secs_f64(ms / 1000.0))
}
