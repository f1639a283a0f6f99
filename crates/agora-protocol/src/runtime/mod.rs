//! Node runtime: wires transport, discovery, channels and orders together.
//!
//! [`Node::start`] binds the host, bootstraps discovery, then runs three
//! background tasks until [`Node::shutdown`]: the TCP accept loop, the
//! discovery loop and the inbound frame dispatcher.
mod dispatch;

use std::net::SocketAddr;
use std::sync::Arc;

use agora_dht::PeerRouting;
use agora_transport::{HostConfig, StreamManager, TcpHost};
use futures_util::Stream;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::channel::{Channel, ChannelId, ChannelRouter};
use crate::discovery::{DiscoveryConfig, DiscoveryService, DiscoveryState, PeerTable};
use crate::error::{NodeError, OrderError};
use crate::identity::{IdentityProvider, NodeIdentity};
use crate::notify::{NoopNotifier, Notifier};
use crate::order::{CreateRequest, Order, OrderId, OrderService};
use crate::storage::{MemoryStorage, Storage};
use crate::types::{PeerId, ORDERS_PROTOCOL};

// ── Configuration ─────────────────────────────────────────────────────

/// Configuration for a [`Node`].
#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub(crate) host: HostConfig,
    pub(crate) discovery: DiscoveryConfig,
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }

    pub fn discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn get_host(&self) -> &HostConfig {
        &self.host
    }

    pub fn get_discovery(&self) -> &DiscoveryConfig {
        &self.discovery
    }
}

/// Services the application hands to the node.
#[derive(Clone)]
pub struct Collaborators {
    pub storage: Arc<dyn Storage>,
    pub identity: Arc<dyn IdentityProvider>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    pub fn new(
        storage: Arc<dyn Storage>,
        identity: Arc<dyn IdentityProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            storage,
            identity,
            notifier,
        }
    }

    /// In-memory storage, a random identity, no notifications.
    pub fn ephemeral() -> Self {
        Self::new(
            Arc::new(MemoryStorage::new()),
            Arc::new(NodeIdentity::generate()),
            Arc::new(NoopNotifier),
        )
    }
}

// ── Node ──────────────────────────────────────────────────────────────

/// A running exchange node.
pub struct Node {
    host: Arc<TcpHost>,
    streams: StreamManager,
    discovery: Arc<DiscoveryService>,
    orders: Arc<OrderService>,
    cancel: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

impl Node {
    /// Bind, bootstrap discovery and start the background tasks.
    ///
    /// Fails if the listener cannot bind or the routing layer cannot
    /// bootstrap; unreachable seeds are only logged.
    pub async fn start(
        config: NodeConfig,
        collaborators: Collaborators,
        routing: Arc<dyn PeerRouting>,
    ) -> Result<Self, NodeError> {
        let cancel = CancellationToken::new();
        let host = Arc::new(TcpHost::bind(&collaborators.identity.secret_seed(), config.host).await?);
        let local_id = host.identity();
        let span = tracing::info_span!("node", peer = %local_id);

        let (streams, inbound) = StreamManager::new(host.clone(), ORDERS_PROTOCOL, cancel.clone());
        let mut tasks = JoinSet::new();
        tasks.spawn(host.clone().listen(cancel.clone()).instrument(span.clone()));

        let table = Arc::new(PeerTable::new(local_id, config.discovery.get_rendezvous()));
        let router = Arc::new(ChannelRouter::new(local_id, table.clone()));
        let discovery = Arc::new(DiscoveryService::new(
            host.clone(),
            streams.clone(),
            routing,
            table,
            config.discovery,
        ));
        let orders = Arc::new(OrderService::new(
            collaborators,
            router,
            Arc::new(streams.clone()),
        ));

        let seeds = match discovery.bootstrap().instrument(span.clone()).await {
            Ok(seeds) => seeds,
            Err(e) => {
                cancel.cancel();
                streams.shutdown().await;
                tasks.shutdown().await;
                return Err(e.into());
            }
        };

        tasks.spawn(discovery.clone().serve(cancel.clone()).instrument(span.clone()));
        tasks.spawn(
            dispatch::run_dispatch(orders.clone(), streams.clone(), inbound, cancel.clone())
                .instrument(span),
        );

        tracing::info!(peer = %local_id, addr = %host.local_addr(), seeds, "node started");
        Ok(Self {
            host,
            streams,
            discovery,
            orders,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    // ── Channels ──────────────────────────────────────────────────────

    /// Subscribe to the `asset`/`counter_asset` channel.
    pub fn join(&self, asset: &str, counter_asset: &str) -> Result<Channel, OrderError> {
        self.orders.router().join(asset, counter_asset)
    }

    pub fn unsubscribe(&self, channel_id: &ChannelId) {
        self.orders.router().unsubscribe(channel_id)
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        self.orders.router()
    }

    // ── Orders ────────────────────────────────────────────────────────

    pub async fn create(&self, request: CreateRequest) -> Result<Order, OrderError> {
        self.orders.create(request).await
    }

    pub async fn delete(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<(), OrderError> {
        self.orders.delete(channel_id, order_id).await
    }

    pub async fn lock(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        self.orders.lock(channel_id, order_id).await
    }

    pub async fn unlock(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        self.orders.unlock(channel_id, order_id).await
    }

    pub fn get_order(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        self.orders.get_order(channel_id, order_id)
    }

    pub fn get_all_orders(&self, channel_id: &ChannelId) -> Result<Vec<Order>, OrderError> {
        self.orders.get_all_orders(channel_id)
    }

    pub fn verify_order(&self, public_key: &PeerId, order: &Order) -> bool {
        self.orders.verify_order(public_key, order)
    }

    pub fn orders(&self) -> &Arc<OrderService> {
        &self.orders
    }

    // ── Network ───────────────────────────────────────────────────────

    pub fn peer_id(&self) -> PeerId {
        self.host.identity()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.host.local_addr()
    }

    /// Peers with an open order stream.
    pub async fn connected_peers(&self) -> Vec<PeerId> {
        self.streams.connected_peers().await
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.discovery.state()
    }

    pub fn subscribe_discovery_state(&self) -> watch::Receiver<DiscoveryState> {
        self.discovery.subscribe_state()
    }

    /// Peers as discovery finds them.
    pub fn discovered_peers(&self) -> impl Stream<Item = PeerId> + Send + Unpin + 'static {
        self.discovery.discovered_peers()
    }

    /// Resolves once [`shutdown`](Self::shutdown) was called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop every background task and close all streams. Idempotent.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.streams.shutdown().await;

        let mut tasks = self.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                if !e.is_cancelled() {
                    tracing::warn!("node task failed: {e}");
                }
            }
        }
        tracing::info!(peer = %self.peer_id(), "node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
