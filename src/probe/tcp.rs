//! TCP connect probe implementation.

use super::{ProbeError, ProbeOutcome};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};

pub const DEFAULT_TCP_TIMEOUT_SECS: u64 = 8;
pub const MAX_TCP_TIMEOUT_SECS: u64 = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpProbeConfig {
    /// IP address or hostname.
    pub address: String,
    pub port: u16,
    pub timeout_secs: u64,
}

impl Default for TcpProbeConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: 0,
            timeout_secs: DEFAULT_TCP_TIMEOUT_SECS,
        }
    }
}

impl TcpProbeConfig {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.address.trim().is_empty() || self.port == 0 {
            return Err(ProbeError::Config("TCP probe needs an address and a port".to_string()));
        }
        if self.timeout_secs == 0 || self.timeout_secs > MAX_TCP_TIMEOUT_SECS {
            return Err(ProbeError::Config(format!(
                "TCP timeout must be between 1 and {} seconds",
                MAX_TCP_TIMEOUT_SECS
            )));
        }
        Ok(())
    }
}

/// Succeed when a connection to `address:port` is established in time.
///
/// A refused or unreachable target is a failed outcome. A name that does
/// not resolve is a [`ProbeError::Network`], recorded as a run error.
pub async fn run_tcp_probe(config: &TcpProbeConfig) -> Result<ProbeOutcome, ProbeError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match tokio::time::timeout(timeout, connect(config)).await {
        Ok(result) => result,
        Err(_) => Ok(ProbeOutcome::failure("timed out", Vec::new())),
    }
}

async fn connect(config: &TcpProbeConfig) -> Result<ProbeOutcome, ProbeError> {
    let addrs: Vec<SocketAddr> = lookup_host((config.address.as_str(), config.port))
        .await
        .map_err(|e| ProbeError::Network(format!("could not resolve {}: {}", config.address, e)))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(_stream) => return Ok(ProbeOutcome::success()),
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Ok(ProbeOutcome::failure(e.to_string(), Vec::new())),
        None => Err(ProbeError::Network(format!(
            "{} resolved to no addresses",
            config.address
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = TcpProbeConfig {
            address: "127.0.0.1".to_string(),
            port,
            timeout_secs: 2,
        };
        let outcome = run_tcp_probe(&cfg).await.unwrap();
        assert!(outcome.succeeded);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        let cfg = TcpProbeConfig {
            address: "127.0.0.1".to_string(),
            port,
            timeout_secs: 2,
        };
        let outcome = run_tcp_probe(&cfg).await.unwrap();
        assert!(!outcome.succeeded);
        assert!(outcome.error.is_some());
        assert!(outcome.tags.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_network_error() {
        let cfg = TcpProbeConfig {
            address: "no-such-host.invalid".to_string(),
            port: 80,
            timeout_secs: MAX_TCP_TIMEOUT_SECS,
        };
        assert!(matches!(
            run_tcp_probe(&cfg).await,
            Err(ProbeError::Network(_))
        ));
    }

    #[test]
    fn test_validate_limits() {
        assert!(TcpProbeConfig {
            address: "db".to_string(),
            port: 5432,
            timeout_secs: MAX_TCP_TIMEOUT_SECS,
        }
        .validate()
        .is_ok());
        assert!(TcpProbeConfig {
            address: "db".to_string(),
            port: 5432,
            timeout_secs: MAX_TCP_TIMEOUT_SECS + 1,
        }
        .validate()
        .is_err());
        assert!(TcpProbeConfig::default().validate().is_err());
    }
}
