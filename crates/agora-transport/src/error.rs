use std::net::SocketAddr;

use crate::PeerId;

/// Errors returned by the Agora transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: anyhow::Error,
    },

    #[error("stream open to {peer} failed: {reason}")]
    StreamOpen { peer: PeerId, reason: String },

    #[error("no stream registered for {peer}")]
    NotConnected { peer: PeerId },

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: PeerId,
        #[source]
        source: anyhow::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("transport is shut down")]
    Shutdown,
}
