//! HTTP GET check.

use regex::Regex;
use std::time::Duration;

use super::ProbeError;
use crate::store::{Service, MAX_REGEX_LEN};

/// URL to fetch: the explicit `url`, else `http://host:port/path`.
pub fn http_url(service: &Service) -> String {
    if !service.url.is_empty() {
        return service.url.clone();
    }
    let path = if service.path.starts_with('/') {
        service.path.clone()
    } else {
        format!("/{}", service.path)
    };
    format!("http://{}:{}{}", service.host, service.port, path)
}

/// Check a response body against an expectation: `*` accepts anything,
/// `regex:<pattern>` matches a regular expression, anything else is a
/// substring.
pub fn match_expected(expected: &str, body: &str) -> Result<(), ProbeError> {
    if expected == "*" || expected.is_empty() {
        return Ok(());
    }

    if let Some(pattern) = expected.strip_prefix("regex:") {
        if pattern.len() > MAX_REGEX_LEN {
            return Err(ProbeError::Config(format!(
                "regex pattern exceeds {} characters",
                MAX_REGEX_LEN
            )));
        }
        let re = Regex::new(pattern)
            .map_err(|e| ProbeError::Config(format!("invalid regex: {}", e)))?;
        return if re.is_match(body) {
            Ok(())
        } else {
            Err(ProbeError::Mismatch("regex did not match".to_string()))
        };
    }

    if body.contains(expected) {
        Ok(())
    } else {
        Err(ProbeError::Mismatch(format!("response missing '{}'", expected)))
    }
}

/// Fetch the service URL and verify status 200 and the expected body.
pub async fn check_http(service: &Service, timeout: Duration) -> Result<(), ProbeError> {
    let url = http_url(service);

    // Appliance targets are mostly LAN devices with self-signed certificates.
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let response = client.get(&url).send().await.map_err(|e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    })?;

    let status = response.status();
    if status != reqwest::StatusCode::OK {
        return Err(ProbeError::Status(status.as_u16()));
    }

    let body = response
        .text()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    match_expected(&service.expected_response, &body)
}
