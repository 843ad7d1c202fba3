use std::net::SocketAddr;
use std::path::PathBuf;

use serde::Deserialize;

fn socket_addr(address: &str, port: u16) -> Result<SocketAddr, std::net::AddrParseError> {
    if address.contains(':') && !address.starts_with('[') {
        return format!("[{address}]:{port}").parse();
    }
    format!("{address}:{port}").parse()
}

/// Gemini listener serving the browsing and account interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub certificate: PathBuf,
    pub key: PathBuf,
    pub address: String,
    pub port: u16,
    /// Public host name, used to build absolute links.
    pub host: String,
}

impl GeminiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        socket_addr(&self.address, self.port)
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            certificate: PathBuf::from("cert.pem"),
            key: PathBuf::from("key.pem"),
            address: "127.0.0.1".to_string(),
            port: 1965,
            host: "localhost".to_string(),
        }
    }
}

/// Smart HTTP transfer listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
}

impl HttpConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        socket_addr(&self.address, self.port)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// SSH transfer listener.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    /// Path of the SSH host key.
    pub secret: PathBuf,
}

impl RemoteConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        socket_addr(&self.address, self.port)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: "127.0.0.1".to_string(),
            port: 2222,
            secret: PathBuf::from("ssh_host_ed25519_key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_addr_v4_and_v6() {
        let http = HttpConfig {
            address: "0.0.0.0".into(),
            port: 80,
            ..Default::default()
        };
        assert_eq!(http.socket_addr().unwrap().port(), 80);

        let remote = RemoteConfig {
            address: "::1".into(),
            ..Default::default()
        };
        assert!(remote.socket_addr().unwrap().is_ipv6());
    }
}
