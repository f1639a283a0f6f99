use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for a [`TcpHost`](crate::TcpHost).
///
/// All fields have sensible defaults. Use the builder pattern:
///
/// ```rust
/// use agora_transport::HostConfig;
///
/// let config = HostConfig::new()
///     .listen_addr("127.0.0.1:0".parse().unwrap())
///     .max_message_size(256 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub(crate) listen_addr: SocketAddr,
    /// Maximum length of a single frame, newline excluded.
    pub(crate) max_message_size: usize,
    pub(crate) handshake_timeout: Duration,
    pub(crate) connect_timeout: Duration,
    /// Channel buffer size for inbound frames.
    pub(crate) inbound_buffer: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HostConfig {
    /// Create a new config with defaults.
    ///
    /// If the `AGORA_LISTEN_ADDR` environment variable holds a socket
    /// address it is used as the listen address. This can be overridden
    /// with [`.listen_addr()`](Self::listen_addr).
    pub fn new() -> Self {
        let listen_addr = std::env::var("AGORA_LISTEN_ADDR")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

        Self {
            listen_addr,
            max_message_size: 1024 * 1024, // 1 MB
            handshake_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            inbound_buffer: 256,
        }
    }

    /// Set the TCP listen address (default: `0.0.0.0:0`).
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Set the maximum frame size (default: 1 MB).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set the handshake deadline (default: 5 s).
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the TCP connect deadline (default: 10 s).
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the channel buffer size for inbound frames (default: 256, minimum 1).
    pub fn inbound_buffer(mut self, capacity: usize) -> Self {
        self.inbound_buffer = capacity.max(1);
        self
    }

    pub fn get_listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn get_max_message_size(&self) -> usize {
        self.max_message_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_inbound_buffer_is_clamped() {
        assert_eq!(HostConfig::new().inbound_buffer(0).inbound_buffer, 1);
        assert_eq!(HostConfig::new().inbound_buffer(8).inbound_buffer, 8);
    }
}
