//! SNMPv2c GET check using hand-built BER packets over UDP.

use std::cmp::Ordering;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

use super::ping::resolve_host;
use super::ProbeError;
use crate::store::CompareOp;

const SNMP_VERSION_2C: i64 = 1;

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_IP_ADDRESS: u8 = 0x40;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_COUNTER64: u8 = 0x46;
const TAG_NO_SUCH_OBJECT: u8 = 0x80;
const TAG_NO_SUCH_INSTANCE: u8 = 0x81;
const TAG_END_OF_MIB_VIEW: u8 = 0x82;
const PDU_GET_REQUEST: u8 = 0xA0;
const PDU_GET_RESPONSE: u8 = 0xA2;

/// A decoded variable binding value.
#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    Unsigned(u64),
    Text(String),
    Oid(String),
    IpAddress(Ipv4Addr),
    Null,
}

impl SnmpValue {
    /// String form used for comparison.
    pub fn as_text(&self) -> String {
        match self {
            SnmpValue::Integer(v) => v.to_string(),
            SnmpValue::Unsigned(v) => v.to_string(),
            SnmpValue::Text(s) => s.clone(),
            SnmpValue::Oid(s) => s.clone(),
            SnmpValue::IpAddress(ip) => ip.to_string(),
            SnmpValue::Null => String::new(),
        }
    }
}

fn finite(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Compare numerically if both sides parse as finite numbers, else
/// lexicographically. `nan` and `inf` count as text.
pub fn compare_values(op: CompareOp, actual: &str, expected: &str) -> bool {
    let actual = actual.trim();
    let expected = expected.trim();
    let ordering = match (finite(actual), finite(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => actual.cmp(expected),
    };
    match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    }
}

fn push_length(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xFF {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.push(0x82);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    }
}

fn tlv(tag: u8, value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 4);
    out.push(tag);
    push_length(&mut out, value.len());
    out.extend_from_slice(value);
    out
}

fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Strip redundant sign-extension bytes.
    while start < 7 {
        let (b, next) = (bytes[start], bytes[start + 1]);
        if (b == 0x00 && next & 0x80 == 0) || (b == 0xFF && next & 0x80 != 0) {
            start += 1;
        } else {
            break;
        }
    }
    tlv(TAG_INTEGER, &bytes[start..])
}

fn encode_oid(oid: &str) -> Result<Vec<u8>, ProbeError> {
    let arcs: Vec<u64> = oid
        .trim()
        .trim_start_matches('.')
        .split('.')
        .map(|a| a.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ProbeError::Config(format!("invalid OID '{}'", oid)))?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        return Err(ProbeError::Config(format!("invalid OID '{}'", oid)));
    }

    let mut body = Vec::new();
    let mut push_arc = |mut arc: u64| {
        let mut chunk = vec![(arc & 0x7F) as u8];
        arc >>= 7;
        while arc > 0 {
            chunk.push(((arc & 0x7F) as u8) | 0x80);
            arc >>= 7;
        }
        chunk.reverse();
        body.extend_from_slice(&chunk);
    };
    push_arc(arcs[0] * 40 + arcs[1]);
    for &arc in &arcs[2..] {
        push_arc(arc);
    }
    Ok(tlv(TAG_OID, &body))
}

/// Build a GetRequest for one OID.
pub fn build_get_request(community: &str, oid: &str, request_id: i32) -> Result<Vec<u8>, ProbeError> {
    let varbind = tlv(TAG_SEQUENCE, &[encode_oid(oid)?, tlv(TAG_NULL, &[])].concat());
    let varbinds = tlv(TAG_SEQUENCE, &varbind);
    let pdu = tlv(
        PDU_GET_REQUEST,
        &[
            encode_integer(request_id as i64),
            encode_integer(0),
            encode_integer(0),
            varbinds,
        ]
        .concat(),
    );
    Ok(tlv(
        TAG_SEQUENCE,
        &[
            encode_integer(SNMP_VERSION_2C),
            tlv(TAG_OCTET_STRING, community.as_bytes()),
            pdu,
        ]
        .concat(),
    ))
}

/// Minimal BER reader.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn malformed() -> ProbeError {
        ProbeError::Protocol("malformed SNMP response".to_string())
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), ProbeError> {
        let (&tag, rest) = self.buf.split_first().ok_or_else(Self::malformed)?;
        let (&first, mut rest) = rest.split_first().ok_or_else(Self::malformed)?;
        let len = if first & 0x80 == 0 {
            first as usize
        } else {
            let n = (first & 0x7F) as usize;
            if n == 0 || n > 4 || rest.len() < n {
                return Err(Self::malformed());
            }
            let len = rest[..n].iter().fold(0usize, |acc, &b| (acc << 8) | b as usize);
            rest = &rest[n..];
            len
        };
        if rest.len() < len {
            return Err(Self::malformed());
        }
        let (value, rest) = rest.split_at(len);
        self.buf = rest;
        Ok((tag, value))
    }

    fn expect(&mut self, tag: u8) -> Result<&'a [u8], ProbeError> {
        match self.read_tlv()? {
            (t, value) if t == tag => Ok(value),
            _ => Err(Self::malformed()),
        }
    }
}

fn decode_signed(bytes: &[u8]) -> i64 {
    let init = if bytes.first().is_some_and(|b| b & 0x80 != 0) { -1i64 } else { 0 };
    bytes.iter().fold(init, |acc, &b| (acc << 8) | b as i64)
}

fn decode_unsigned(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

fn decode_oid(bytes: &[u8]) -> String {
    let mut arcs = Vec::new();
    let mut value = 0u64;
    for &b in bytes {
        value = (value << 7) | (b & 0x7F) as u64;
        if b & 0x80 == 0 {
            if arcs.is_empty() {
                let first = (value / 40).min(2);
                arcs.push(first);
                arcs.push(value - first * 40);
            } else {
                arcs.push(value);
            }
            value = 0;
        }
    }
    arcs.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(".")
}

/// Parse a GetResponse. Returns the request id and the first value.
pub fn parse_get_response(packet: &[u8]) -> Result<(i32, SnmpValue), ProbeError> {
    let mut outer = Reader::new(Reader::new(packet).expect(TAG_SEQUENCE)?);
    outer.expect(TAG_INTEGER)?;
    outer.expect(TAG_OCTET_STRING)?;

    let mut pdu = Reader::new(outer.expect(PDU_GET_RESPONSE)?);
    let request_id = decode_signed(pdu.expect(TAG_INTEGER)?) as i32;
    let error_status = decode_signed(pdu.expect(TAG_INTEGER)?);
    pdu.expect(TAG_INTEGER)?;
    if error_status != 0 {
        return Err(ProbeError::Protocol(format!("SNMP error status {}", error_status)));
    }

    let mut varbinds = Reader::new(pdu.expect(TAG_SEQUENCE)?);
    let mut varbind = Reader::new(varbinds.expect(TAG_SEQUENCE)?);
    varbind.expect(TAG_OID)?;
    let (tag, raw) = varbind.read_tlv()?;

    let value = match tag {
        TAG_INTEGER => SnmpValue::Integer(decode_signed(raw)),
        TAG_OCTET_STRING => SnmpValue::Text(String::from_utf8_lossy(raw).into_owned()),
        TAG_OID => SnmpValue::Oid(decode_oid(raw)),
        TAG_IP_ADDRESS if raw.len() == 4 => {
            SnmpValue::IpAddress(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
        }
        TAG_COUNTER32 | TAG_GAUGE32 | TAG_TIMETICKS | TAG_COUNTER64 => {
            SnmpValue::Unsigned(decode_unsigned(raw))
        }
        TAG_NULL => SnmpValue::Null,
        TAG_NO_SUCH_OBJECT => return Err(ProbeError::Protocol("noSuchObject".to_string())),
        TAG_NO_SUCH_INSTANCE => return Err(ProbeError::Protocol("noSuchInstance".to_string())),
        TAG_END_OF_MIB_VIEW => return Err(ProbeError::Protocol("endOfMibView".to_string())),
        other => {
            return Err(ProbeError::Protocol(format!(
                "unsupported SNMP value type 0x{:02X}",
                other
            )))
        }
    };
    Ok((request_id, value))
}

/// GET one OID from `host:port`.
pub async fn snmp_get(
    host: &str,
    port: u16,
    community: &str,
    oid: &str,
    timeout: Duration,
) -> Result<SnmpValue, ProbeError> {
    let request_id = rand::random::<i32>() & 0x7FFF_FFFF;
    let packet = build_get_request(community, oid, request_id)?;

    let ip = resolve_host(host).await?;
    let bind: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect((ip, port))
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;
    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let exchange = async {
        let mut buf = [0u8; 1500];
        loop {
            let n = socket
                .recv(&mut buf)
                .await
                .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;
            match parse_get_response(&buf[..n]) {
                Ok((id, value)) if id == request_id => return Ok(value),
                Ok((id, _)) => tracing::debug!("SNMP: ignoring response for request {}", id),
                Err(e) => return Err(e),
            }
        }
    };
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}
