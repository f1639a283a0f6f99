use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;

use futures_lite::StreamExt;
use mainline::{Dht, Id};

use crate::{PeerRouting, RoutingError, Topic};

/// Settings for the Mainline DHT client.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Replaces the default public bootstrap nodes when non-empty.
    pub bootstrap: Vec<String>,
    /// UDP port for the DHT socket, random when `None`.
    pub port: Option<u16>,
    /// Upper bound on one `get_peers` traversal.
    pub query_timeout: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap: Vec::new(),
            port: None,
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// [`PeerRouting`] over the Mainline DHT.
pub struct DhtRouting {
    dht: Dht,
    query_timeout: Duration,
}

impl DhtRouting {
    /// Create a DHT client. Does not wait for the routing table to fill.
    pub fn new(config: DhtConfig) -> Result<Self, RoutingError> {
        let dht = if config.bootstrap.is_empty() && config.port.is_none() {
            Dht::client()
        } else {
            let mut builder = Dht::builder();
            if !config.bootstrap.is_empty() {
                builder.bootstrap(config.bootstrap.as_slice());
            }
            if let Some(port) = config.port {
                builder.port(port);
            }
            builder.build()
        }
        .map_err(|e| RoutingError::Unavailable(e.to_string()))?;

        tracing::info!("DHT client created");
        Ok(Self {
            dht,
            query_timeout: config.query_timeout,
        })
    }

    fn info_hash(topic: &Topic) -> Result<Id, RoutingError> {
        Id::from_bytes(topic.info_hash()).map_err(|e| RoutingError::Query {
            topic: topic.to_string(),
            reason: format!("{e:?}"),
        })
    }
}

#[async_trait::async_trait]
impl PeerRouting for DhtRouting {
    async fn bootstrap(&self) -> Result<(), RoutingError> {
        let dht = self.dht.clone().as_async();
        if dht.bootstrapped().await {
            tracing::info!("DHT bootstrapped");
            Ok(())
        } else {
            Err(RoutingError::Unavailable(
                "routing table empty after bootstrap".into(),
            ))
        }
    }

    async fn announce(&self, topic: &Topic, port: u16) -> Result<(), RoutingError> {
        let id = Self::info_hash(topic)?;
        let dht = self.dht.clone().as_async();
        dht.announce_peer(id, Some(port))
            .await
            .map_err(|e| RoutingError::Announce {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        tracing::debug!(%topic, port, "announced on DHT");
        Ok(())
    }

    async fn find_peers(&self, topic: &Topic) -> Result<Vec<SocketAddr>, RoutingError> {
        let id = Self::info_hash(topic)?;
        let dht = self.dht.clone().as_async();
        let mut stream = dht.get_peers(id);

        let mut found = BTreeSet::new();
        let collect = async {
            while let Some(batch) = stream.next().await {
                for addr in batch {
                    found.insert(SocketAddr::from(addr));
                }
            }
        };
        // A traversal that outlives the deadline still yields what it found so far.
        let _ = tokio::time::timeout(self.query_timeout, collect).await;

        tracing::debug!(%topic, count = found.len(), "DHT lookup finished");
        Ok(found.into_iter().collect())
    }
}
