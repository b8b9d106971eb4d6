//! Service checks.
//!
//! Supports HTTP GET, ping, TCP port, SNMP GET and push heartbeat checks.

mod http;
mod ping;
mod port;
mod snmp;

pub use http::*;
pub use ping::*;
pub use port::*;
pub use snmp::*;

use std::time::Duration;
use thiserror::Error;

use crate::store::{Service, ServiceKind};

/// Per-step timeout for network checks.
pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Slack added to a push service's interval before it counts as missed.
pub const PUSH_GRACE_MS: u64 = 5_000;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
    #[error("unexpected response: {0}")]
    Mismatch(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no push received")]
    NoPush,
}

/// Pass iff a push arrived within the interval plus grace.
pub fn check_push(service: &Service, last_push: Option<u64>, now_ms: u64) -> Result<(), ProbeError> {
    let last = last_push.ok_or(ProbeError::NoPush)?;
    let window = service.check_interval as u64 * 1000 + PUSH_GRACE_MS;
    let age = now_ms.saturating_sub(last);
    if age <= window {
        Ok(())
    } else {
        Err(ProbeError::Mismatch(format!("last push {}s ago", age / 1000)))
    }
}

/// Run the check for one service. `last_push` is only read for push services.
pub async fn run_check(service: &Service, last_push: Option<u64>, now_ms: u64) -> Result<(), ProbeError> {
    match service.kind {
        ServiceKind::HttpGet => check_http(service, CHECK_TIMEOUT).await,
        ServiceKind::Ping => check_ping(&service.host, CHECK_TIMEOUT).await.map(|rtt| {
            tracing::trace!("Ping {} answered in {:?}", service.host, rtt);
        }),
        ServiceKind::PortOpen => check_port(&service.host, service.port, CHECK_TIMEOUT).await,
        ServiceKind::SnmpGet => {
            let value = snmp_get(
                &service.host,
                service.port,
                &service.snmp_community,
                &service.snmp_oid,
                CHECK_TIMEOUT,
            )
            .await?;
            let actual = value.as_text();
            if compare_values(service.snmp_compare_op, &actual, &service.snmp_expected_value) {
                Ok(())
            } else {
                Err(ProbeError::Mismatch(format!(
                    "got '{}', expected {} '{}'",
                    actual,
                    service.snmp_compare_op.symbol(),
                    service.snmp_expected_value
                )))
            }
        }
        ServiceKind::Push => check_push(service, last_push, now_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ServiceInput;

    fn push_service(interval: i64) -> Service {
        ServiceInput {
            name: Some("cron".into()),
            kind: Some(crate::store::CodeOrName::Code(4)),
            check_interval: Some(interval),
            ..Default::default()
        }
        .into_service()
        .unwrap()
    }

    #[test]
    fn test_push_window() {
        let svc = push_service(60);
        assert!(matches!(check_push(&svc, None, 1_000), Err(ProbeError::NoPush)));
        assert!(check_push(&svc, Some(10_000), 10_000 + 65_000).is_ok());
        assert!(check_push(&svc, Some(10_000), 10_000 + 66_000).is_err());
    }

    #[tokio::test]
    async fn test_run_check_dispatches_push() {
        let svc = push_service(60);
        assert!(run_check(&svc, Some(0), 30_000).await.is_ok());
        assert!(run_check(&svc, None, 30_000).await.is_err());
    }
}
