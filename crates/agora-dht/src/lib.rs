//! Rendezvous peer routing for Agora.
//!
//! Peers advertise a listen port under a topic string and look up who else
//! advertised the same topic. [`DhtRouting`] does this on the Mainline DHT
//! (BEP-0005 `announce_peer` / `get_peers`, topic hashed to an info-hash).
//! [`MemoryRouting`] keeps the same contract in-process for tests and for
//! nodes that only use seed peers.

mod memory;
mod mainline_routing;

pub use mainline_routing::{DhtConfig, DhtRouting};
pub use memory::MemoryRouting;

use std::fmt;
use std::net::SocketAddr;

use sha1::{Digest, Sha1};

/// Errors returned by a [`PeerRouting`] backend.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("routing backend unavailable: {0}")]
    Unavailable(String),

    #[error("announce failed for {topic}: {reason}")]
    Announce { topic: String, reason: String },

    #[error("lookup failed for {topic}: {reason}")]
    Query { topic: String, reason: String },
}

/// A rendezvous string peers meet under.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// SHA-1 of the topic string, used as the DHT info-hash.
    pub fn info_hash(&self) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(self.0.as_bytes());
        hasher.finalize().into()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Content routing used for rendezvous discovery.
#[async_trait::async_trait]
pub trait PeerRouting: Send + Sync + 'static {
    /// Join the routing network. Failure here is fatal for discovery.
    async fn bootstrap(&self) -> Result<(), RoutingError>;

    /// Publish that this node accepts connections on `port` under `topic`.
    async fn announce(&self, topic: &Topic, port: u16) -> Result<(), RoutingError>;

    /// Addresses currently advertised under `topic`. May include our own.
    async fn find_peers(&self, topic: &Topic) -> Result<Vec<SocketAddr>, RoutingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_deterministic() {
        let topic = Topic::new("agora/rendezvous");
        assert_eq!(topic.info_hash(), topic.info_hash());
        assert_eq!(topic.info_hash(), Topic::from("agora/rendezvous").info_hash());
    }

    #[test]
    fn info_hash_differs_per_topic() {
        assert_ne!(
            Topic::new("agora/rendezvous").info_hash(),
            Topic::new("agora/rendezvous/abc").info_hash()
        );
    }

    #[test]
    fn info_hash_matches_sha1() {
        // sha1("abc")
        assert_eq!(
            Topic::new("abc").info_hash(),
            [
                0xa9, 0x99, 0x3e, 0x36, 0x47, 0x06, 0x81, 0x6a, 0xba, 0x3e, 0x25, 0x71, 0x78, 0x50,
                0xc2, 0x6c, 0x9c, 0xd0, 0xd8, 0x9d
            ]
        );
    }
}
