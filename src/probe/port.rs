//! TCP port-open check.

use std::time::Duration;
use tokio::net::TcpStream;

use super::ProbeError;

/// Connect to `host:port`; the connection is dropped as soon as it opens.
pub async fn check_port(host: &str, port: u16, timeout: Duration) -> Result<(), ProbeError> {
    let connect = TcpStream::connect((host, port));
    match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(ProbeError::Network(format!("connect to {}:{} failed: {}", host, port, e))),
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
