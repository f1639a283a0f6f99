//! Agora transport layer.
//!
//! A TCP host that identifies peers by their Ed25519 public key, a
//! one-line JSON handshake that negotiates a protocol tag, and a
//! [`StreamManager`] that keeps one newline-framed stream per remote peer.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agora_transport::{HostConfig, StreamManager, TcpHost, ORDERS_PROTOCOL};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), agora_transport::TransportError> {
//! let cancel = CancellationToken::new();
//! let host = Arc::new(TcpHost::bind(&[7u8; 32], HostConfig::new()).await?);
//! let (streams, mut inbound) = StreamManager::new(host.clone(), ORDERS_PROTOCOL, cancel.clone());
//! tokio::spawn(host.clone().listen(cancel.clone()));
//!
//! let peer = host.connect("127.0.0.1:4001".parse().unwrap()).await?;
//! streams.open(peer).await?;
//! streams.send(peer, r#"{"hello":"world"}"#).await?;
//!
//! while let Some(frame) = inbound.recv().await {
//!     println!("{}: {}", frame.peer, frame.line);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod handshake;
mod host;
mod stream;

pub use config::HostConfig;
pub use error::TransportError;
pub use host::{RawStream, StreamHandler, TcpHost};
pub use stream::{InboundFrame, StreamManager};

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{SigningKey, VerifyingKey};

/// Protocol tag for order dissemination streams.
pub const ORDERS_PROTOCOL: &str = "/agora/orders/1.0.0";

/// Reserved tag used by [`TcpHost::connect`] to learn a peer's identity
/// without opening an application stream.
pub const IDENTIFY_PROTOCOL: &str = "/agora/identify/1.0.0";

/// Agora network identity: an Ed25519 public key.
///
/// Displayed and parsed as a 64-character hex string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Derive the identity that belongs to a 32-byte Ed25519 secret seed.
    pub fn from_secret_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        Self(signing_key.verifying_key().to_bytes())
    }

    /// Wrap a raw public key, rejecting bytes that are not a valid curve point.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, TransportError> {
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| TransportError::InvalidPeerId(hex::encode(bytes)))?;
        Ok(Self(bytes))
    }

    /// Get the raw 32-byte public key.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Ed25519 verifying key for signature checks.
    pub fn verifying_key(&self) -> Result<VerifyingKey, TransportError> {
        VerifyingKey::from_bytes(&self.0)
            .map_err(|_| TransportError::InvalidPeerId(self.to_string()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.0);
        write!(f, "PeerId({}...)", &hex[..12])
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        Self::from_bytes(bytes)
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
