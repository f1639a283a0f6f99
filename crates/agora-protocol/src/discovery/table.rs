use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Notify;

use crate::channel::ChannelId;
use crate::types::{now_ms, PeerId};

/// What discovery knows about one remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub addr: SocketAddr,
    /// Rendezvous topics the peer was found under.
    pub topics: BTreeSet<String>,
    pub last_seen: u64,
}

#[derive(Default)]
struct Inner {
    peers: HashMap<PeerId, PeerRecord>,
    watched: BTreeSet<String>,
}

/// Shared view of discovered peers and of the topics we look for.
///
/// Written by the discovery loop, read by the channel router.
pub struct PeerTable {
    local_id: PeerId,
    rendezvous: String,
    inner: RwLock<Inner>,
    topics_changed: Notify,
}

impl PeerTable {
    pub fn new(local_id: PeerId, rendezvous: impl Into<String>) -> Self {
        Self {
            local_id,
            rendezvous: rendezvous.into(),
            inner: RwLock::new(Inner::default()),
            topics_changed: Notify::new(),
        }
    }

    /// Global rendezvous topic.
    pub fn rendezvous(&self) -> &str {
        &self.rendezvous
    }

    /// `"<rendezvous>/<channel_id>"`.
    pub fn channel_topic(&self, channel_id: &ChannelId) -> String {
        format!("{}/{}", self.rendezvous, channel_id)
    }

    /// Remember `peer` at `addr` under `topic`. Returns true for a new peer.
    ///
    /// Our own id is never recorded.
    pub fn record(&self, peer: PeerId, addr: SocketAddr, topic: &str) -> bool {
        if peer == self.local_id {
            return false;
        }
        let mut inner = self.write();
        let now = now_ms();
        match inner.peers.get_mut(&peer) {
            Some(record) => {
                record.addr = addr;
                record.topics.insert(topic.to_string());
                record.last_seen = now;
                false
            }
            None => {
                inner.peers.insert(
                    peer,
                    PeerRecord {
                        addr,
                        topics: BTreeSet::from([topic.to_string()]),
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Forget a peer entirely, e.g. after its stream closed.
    pub fn remove(&self, peer: &PeerId) -> bool {
        self.write().peers.remove(peer).is_some()
    }

    pub fn get(&self, peer: &PeerId) -> Option<PeerRecord> {
        self.read().peers.get(peer).cloned()
    }

    /// Peer last seen at `addr`, if any.
    pub fn peer_at(&self, addr: SocketAddr) -> Option<PeerId> {
        self.read()
            .peers
            .iter()
            .find(|(_, record)| record.addr == addr)
            .map(|(peer, _)| *peer)
    }

    /// Peers found under `topic`.
    pub fn peers_for(&self, topic: &str) -> HashSet<PeerId> {
        self.read()
            .peers
            .iter()
            .filter(|(_, record)| record.topics.contains(topic))
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn all_peers(&self) -> Vec<PeerId> {
        self.read().peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().peers.is_empty()
    }

    /// Start looking for peers under `topic`.
    pub fn watch(&self, topic: &str) {
        if self.write().watched.insert(topic.to_string()) {
            self.topics_changed.notify_one();
        }
    }

    /// Stop looking for `topic` and drop it from every peer record.
    pub fn unwatch(&self, topic: &str) {
        let mut inner = self.write();
        if inner.watched.remove(topic) {
            for record in inner.peers.values_mut() {
                record.topics.remove(topic);
            }
            drop(inner);
            self.topics_changed.notify_one();
        }
    }

    /// Watched channel topics, not including the global rendezvous.
    pub fn watched_topics(&self) -> Vec<String> {
        self.read().watched.iter().cloned().collect()
    }

    /// Resolves once the watched topic set changed since the last call.
    pub async fn topics_changed(&self) {
        self.topics_changed.notified().await
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
