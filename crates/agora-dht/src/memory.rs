use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{PeerRouting, RoutingError, Topic};

type Table = HashMap<[u8; 20], BTreeSet<SocketAddr>>;

/// In-process [`PeerRouting`].
///
/// Clones share one table, so every node of a test gets its own clone with
/// [`with_ip`](Self::with_ip) and they all see each other's announcements.
#[derive(Clone)]
pub struct MemoryRouting {
    table: Arc<Mutex<Table>>,
    ip: IpAddr,
    available: bool,
}

impl Default for MemoryRouting {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRouting {
    /// Empty table; announcements are recorded under 127.0.0.1.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            available: true,
        }
    }

    /// Address announcements from this handle are recorded under.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    /// A handle whose bootstrap always fails.
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Forget every address announced under `topic` at `addr`.
    pub fn withdraw(&self, topic: &Topic, addr: SocketAddr) {
        if let Some(peers) = self.lock().get_mut(&topic.info_hash()) {
            peers.remove(&addr);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl PeerRouting for MemoryRouting {
    async fn bootstrap(&self) -> Result<(), RoutingError> {
        if self.available {
            Ok(())
        } else {
            Err(RoutingError::Unavailable("memory routing disabled".into()))
        }
    }

    async fn announce(&self, topic: &Topic, port: u16) -> Result<(), RoutingError> {
        self.lock()
            .entry(topic.info_hash())
            .or_default()
            .insert(SocketAddr::new(self.ip, port));
        Ok(())
    }

    async fn find_peers(&self, topic: &Topic) -> Result<Vec<SocketAddr>, RoutingError> {
        Ok(self
            .lock()
            .get(&topic.info_hash())
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default())
    }
}
