//! Live-view server configuration

use std::net::SocketAddr;
use std::time::Duration;

/// Port used when `VIEWER_PORT` is unset or invalid
pub const DEFAULT_VIEWER_PORT: u16 = 8080;

/// Environment variable holding the listen port
pub const VIEWER_PORT_VAR: &str = "VIEWER_PORT";

/// Server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Maximum concurrent connections (0 = unlimited)
    pub max_connections: usize,

    /// Per-connection outbound queue length, in messages
    pub outbound_capacity: usize,

    /// WebSocket handshake must complete within this time
    pub handshake_timeout: Duration,

    /// Time allowed for connections to close at shutdown
    pub close_timeout: Duration,

    /// Enable TCP_NODELAY (disable Nagle's algorithm)
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_VIEWER_PORT)),
            max_connections: 0, // Unlimited
            outbound_capacity: 64,
            handshake_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a new config with custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Default config listening on the port from `VIEWER_PORT`
    pub fn from_env() -> Self {
        let port = port_from(std::env::var(VIEWER_PORT_VAR).ok().as_deref());
        Self::default().port(port)
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the listen port, keeping the bind IP
    pub fn port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-connection outbound queue length (at least 1)
    pub fn outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the shutdown close timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

fn port_from(value: Option<&str>) -> u16 {
    match value.map(str::trim) {
        None | Some("") => DEFAULT_VIEWER_PORT,
        Some(raw) => match raw.parse() {
            Ok(port) => port,
            Err(_) => {
                tracing::warn!(
                    value = %raw,
                    default = DEFAULT_VIEWER_PORT,
                    "Invalid {}, using default",
                    VIEWER_PORT_VAR
                );
                DEFAULT_VIEWER_PORT
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.max_connections, 0);
        assert_eq!(config.outbound_capacity, 64);
        assert!(config.tcp_nodelay);
    }

    #[test]
    fn test_with_addr() {
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let config = ServerConfig::with_addr(addr);

        assert_eq!(config.bind_addr.port(), 9000);
    }

    #[test]
    fn test_port_from_env_value() {
        assert_eq!(port_from(None), 8080);
        assert_eq!(port_from(Some("")), 8080);
        assert_eq!(port_from(Some("3000")), 3000);
        assert_eq!(port_from(Some(" 3001 ")), 3001);
        assert_eq!(port_from(Some("eighty")), 8080);
        assert_eq!(port_from(Some("70000")), 8080);
    }

    #[test]
    fn test_builder_outbound_capacity_floor() {
        let config = ServerConfig::default().outbound_capacity(0);

        assert_eq!(config.outbound_capacity, 1);
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::default()
            .bind(addr)
            .port(8181)
            .max_connections(50)
            .handshake_timeout(Duration::from_secs(5))
            .close_timeout(Duration::from_secs(1));

        assert_eq!(config.bind_addr, "127.0.0.1:8181".parse::<SocketAddr>().unwrap());
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.close_timeout, Duration::from_secs(1));
    }
}
