//! Network module - Handles the TCP session with the target device
//!
//! Provides:
//! - Connection for strictly sequential command/response exchanges
//! - FirmwareUploader driving the OTA update over one connection

mod connection;
mod uploader;

pub use uploader::*;

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::NetworkSettings;

/// Configuration for network operations
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Port the device listens on
    pub port: u16,
    /// Connection timeout; None waits indefinitely
    pub connect_timeout: Option<Duration>,
    /// Time allowed for each response; None waits indefinitely
    pub read_timeout: Option<Duration>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::protocol::DEFAULT_PORT,
            connect_timeout: None,
            read_timeout: None,
        }
    }
}

impl NetworkConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn from_settings(settings: &NetworkSettings) -> Self {
        Self {
            port: settings.port,
            connect_timeout: settings.connect_timeout_ms.map(Duration::from_millis),
            read_timeout: settings.read_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

/// Resolve a hostname to every socket address it maps to
///
/// IPv4 addresses come first, in resolver order, followed by IPv6.
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    use tokio::net::lookup_host;

    let addrs = prefer_ipv4(lookup_host((host, port)).await?);

    if addrs.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        ));
    }
    Ok(addrs)
}

fn prefer_ipv4(addrs: impl IntoIterator<Item = SocketAddr>) -> Vec<SocketAddr> {
    let (mut v4, v6): (Vec<_>, Vec<_>) = addrs.into_iter().partition(SocketAddr::is_ipv4);
    v4.extend(v6);
    v4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_timeouts() {
        let config = NetworkConfig::default();
        assert_eq!(config.port, 80);
        assert!(config.connect_timeout.is_none());
        assert!(config.read_timeout.is_none());
    }

    #[test]
    fn test_from_settings() {
        let settings = NetworkSettings {
            port: 8080,
            connect_timeout_ms: Some(1500),
            read_timeout_ms: None,
        };
        let config = NetworkConfig::from_settings(&settings);
        assert_eq!(config.port, 8080);
        assert_eq!(config.connect_timeout, Some(Duration::from_millis(1500)));
        assert!(config.read_timeout.is_none());
    }

    #[tokio::test]
    async fn test_resolve_loopback() {
        let addrs = resolve_host("127.0.0.1", 80).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:80".parse::<SocketAddr>().unwrap()]);
    }

    #[test]
    fn test_ipv4_addresses_come_first() {
        let addrs: Vec<SocketAddr> = ["[::1]:80", "127.0.0.1:80", "[fe80::1]:80", "10.0.0.7:80"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();

        let ordered = prefer_ipv4(addrs);
        let expected: Vec<SocketAddr> = ["127.0.0.1:80", "10.0.0.7:80", "[::1]:80", "[fe80::1]:80"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        assert_eq!(ordered, expected);
    }
}
