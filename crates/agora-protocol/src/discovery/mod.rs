//! Peer discovery.
//!
//! `Uninitialized → Bootstrapping → Advertising → Discovering → Running`.
//!
//! Bootstrapping dials the configured seeds concurrently and then joins the
//! routing layer (fatal if that fails). Advertising announces our listen
//! port under the global rendezvous and every watched channel topic. One
//! lookup task per topic then follows [`DiscoveryService::discover`] and opens
//! an order stream to every new peer it yields.

mod table;

pub use table::{PeerRecord, PeerTable};

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use agora_dht::{PeerRouting, Topic};
use agora_transport::{StreamManager, TcpHost};
use futures_util::{Stream, StreamExt};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::DiscoveryError;
use crate::types::{PeerId, DEFAULT_RENDEZVOUS};

/// Lifecycle of the discovery service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Uninitialized,
    Bootstrapping,
    Advertising,
    Discovering,
    Running,
    Stopped,
}

/// Floor for both discovery intervals; shorter values are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration for [`DiscoveryService`].
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub(crate) rendezvous: String,
    pub(crate) seeds: Vec<SocketAddr>,
    /// Delay between two lookups of the same topic.
    pub(crate) requery_interval: Duration,
    pub(crate) advertise_interval: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self {
            rendezvous: DEFAULT_RENDEZVOUS.to_string(),
            seeds: Vec::new(),
            requery_interval: Duration::from_secs(15),
            advertise_interval: Duration::from_secs(300),
        }
    }

    /// Set the global rendezvous topic.
    pub fn rendezvous(mut self, topic: impl Into<String>) -> Self {
        self.rendezvous = topic.into();
        self
    }

    /// Addresses dialed during bootstrap.
    pub fn seeds(mut self, seeds: Vec<SocketAddr>) -> Self {
        self.seeds = seeds;
        self
    }

    /// At least [`MIN_INTERVAL`].
    pub fn requery_interval(mut self, interval: Duration) -> Self {
        self.requery_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// At least [`MIN_INTERVAL`].
    pub fn advertise_interval(mut self, interval: Duration) -> Self {
        self.advertise_interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn get_requery_interval(&self) -> Duration {
        self.requery_interval
    }

    pub fn get_advertise_interval(&self) -> Duration {
        self.advertise_interval
    }

    pub fn get_rendezvous(&self) -> &str {
        &self.rendezvous
    }
}

/// Finds peers through seeds and rendezvous lookups and keeps a stream open to each.
pub struct DiscoveryService {
    host: Arc<TcpHost>,
    streams: StreamManager,
    routing: Arc<dyn PeerRouting>,
    table: Arc<PeerTable>,
    config: DiscoveryConfig,
    state: watch::Sender<DiscoveryState>,
    discovered_tx: broadcast::Sender<PeerId>,
    /// Addresses that turned out to be our own listener.
    own_addrs: Mutex<HashSet<SocketAddr>>,
}

impl DiscoveryService {
    pub fn new(
        host: Arc<TcpHost>,
        streams: StreamManager,
        routing: Arc<dyn PeerRouting>,
        table: Arc<PeerTable>,
        config: DiscoveryConfig,
    ) -> Self {
        let (state, _) = watch::channel(DiscoveryState::Uninitialized);
        let (discovered_tx, _) = broadcast::channel(256);
        Self {
            host,
            streams,
            routing,
            table,
            config,
            state,
            discovered_tx,
            own_addrs: Mutex::new(HashSet::new()),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DiscoveryState> {
        self.state.subscribe()
    }

    pub fn table(&self) -> &Arc<PeerTable> {
        &self.table
    }

    /// Start looking for peers under a channel topic.
    pub fn watch_topic(&self, topic: &str) {
        self.table.watch(topic);
    }

    pub fn unwatch_topic(&self, topic: &str) {
        self.table.unwatch(topic);
    }

    /// Peers as they are discovered for the first time.
    pub fn discovered_peers(&self) -> impl Stream<Item = PeerId> + Send + Unpin + 'static {
        tokio_stream::StreamExt::filter_map(
            BroadcastStream::new(self.discovered_tx.subscribe()),
            Result::ok,
        )
    }

    fn set_state(&self, state: DiscoveryState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(?previous, ?state, "discovery state changed");
        }
    }

    /// Dial every seed, then join the routing layer.
    ///
    /// Returns how many seeds answered. Seed failures are logged; a routing
    /// layer that cannot bootstrap is fatal.
    pub async fn bootstrap(&self) -> Result<usize, DiscoveryError> {
        self.set_state(DiscoveryState::Bootstrapping);

        let mut seeds = JoinSet::new();
        for addr in self.config.seeds.iter().copied() {
            let host = self.host.clone();
            seeds.spawn(
                async move { (addr, host.connect(addr).await) }
                    .instrument(tracing::debug_span!("seed", %addr)),
            );
        }

        let mut connected = Vec::new();
        while let Some(joined) = seeds.join_next().await {
            match joined {
                Ok((addr, Ok(peer))) if peer == self.host.identity() => {
                    tracing::debug!(%addr, "seed is ourselves");
                }
                Ok((addr, Ok(peer))) => {
                    tracing::info!(%peer, %addr, "connected to seed");
                    connected.push((peer, addr));
                }
                Ok((addr, Err(e))) => tracing::warn!(%addr, "seed unreachable: {e}"),
                Err(e) => tracing::warn!("seed task failed: {e}"),
            }
        }

        if let Err(e) = self.routing.bootstrap().await {
            tracing::warn!("routing bootstrap failed: {e}");
            self.set_state(DiscoveryState::Stopped);
            return Err(DiscoveryError::DhtUnavailable(e));
        }

        for (peer, addr) in &connected {
            match self.streams.open(*peer).await {
                Ok(()) => self.remember(*peer, *addr, self.table.rendezvous()),
                Err(e) => tracing::warn!(%peer, "stream to seed failed: {e}"),
            }
        }

        Ok(connected.len())
    }

    /// Announce our listen port under `topic`.
    pub async fn announce(&self, topic: &str) -> Result<(), DiscoveryError> {
        let port = self.host.local_addr().port();
        self.routing
            .announce(&Topic::new(topic), port)
            .await
            .map_err(DiscoveryError::Announce)
    }

    /// Announce under the rendezvous and every watched topic. Returns the
    /// number of successful announcements.
    pub async fn advertise(&self) -> usize {
        let mut topics = vec![self.table.rendezvous().to_string()];
        topics.extend(self.table.watched_topics());

        let mut announced = 0;
        for topic in &topics {
            match self.announce(topic).await {
                Ok(()) => announced += 1,
                Err(e) => tracing::warn!(%topic, "{e}"),
            }
        }
        tracing::debug!(announced, total = topics.len(), "advertised");
        announced
    }

    /// Lazy, unbounded sequence of addresses advertised under `topic`.
    ///
    /// Queries immediately, then every `requery_interval`, yielding the
    /// addresses found in each round. Ends only when `cancel` fires.
    pub fn discover(
        &self,
        topic: Topic,
        cancel: CancellationToken,
    ) -> impl Stream<Item = SocketAddr> + Send + 'static {
        struct Cursor {
            routing: Arc<dyn PeerRouting>,
            topic: Topic,
            pending: VecDeque<SocketAddr>,
            first: bool,
            interval: Duration,
            cancel: CancellationToken,
        }

        let cursor = Cursor {
            routing: self.routing.clone(),
            topic,
            pending: VecDeque::new(),
            first: true,
            interval: self.config.requery_interval,
            cancel,
        };

        futures_util::stream::unfold(cursor, |mut cur| async move {
            loop {
                if cur.cancel.is_cancelled() {
                    return None;
                }
                if let Some(addr) = cur.pending.pop_front() {
                    return Some((addr, cur));
                }
                if !cur.first {
                    tokio::select! {
                        _ = cur.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(cur.interval) => {}
                    }
                }
                cur.first = false;

                match cur.routing.find_peers(&cur.topic).await {
                    Ok(addrs) => {
                        let unique: BTreeSet<SocketAddr> = addrs.into_iter().collect();
                        cur.pending.extend(unique);
                    }
                    Err(e) => {
                        tracing::warn!(topic = %cur.topic, "{}", DiscoveryError::Query(e));
                    }
                }
            }
        })
    }

    /// Bootstrap, then serve until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), DiscoveryError> {
        self.bootstrap().await?;
        self.serve(cancel).await;
        Ok(())
    }

    /// Advertise, follow every topic and keep the peer table current.
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) {
        self.set_state(DiscoveryState::Advertising);
        self.advertise().await;

        self.set_state(DiscoveryState::Discovering);
        let mut lookups: HashMap<String, CancellationToken> = HashMap::new();
        let mut tasks = JoinSet::new();
        self.reconcile_lookups(&mut lookups, &mut tasks, &cancel);

        self.set_state(DiscoveryState::Running);
        tracing::info!(topics = lookups.len(), "discovery running");

        let mut closed = self.streams.closed_peers();
        let mut readvertise = tokio::time::interval(self.config.advertise_interval);
        readvertise.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = readvertise.tick() => {
                    self.advertise().await;
                }
                _ = self.table.topics_changed() => {
                    for topic in self.reconcile_lookups(&mut lookups, &mut tasks, &cancel) {
                        if let Err(e) = self.announce(&topic).await {
                            tracing::warn!(%topic, "{e}");
                        }
                    }
                }
                peer = closed.recv() => match peer {
                    Ok(peer) => {
                        if self.table.remove(&peer) {
                            tracing::debug!(%peer, "stream closed, peer forgotten");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "closed-peer notifications lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = joined {
                        if !e.is_cancelled() {
                            tracing::warn!("lookup task failed: {e}");
                        }
                    }
                }
            }
        }

        for token in lookups.values() {
            token.cancel();
        }
        tasks.shutdown().await;
        self.set_state(DiscoveryState::Stopped);
        tracing::info!("discovery stopped");
    }

    /// Start lookups for newly watched topics and stop the dropped ones.
    /// Returns the topics that were started.
    fn reconcile_lookups(
        self: &Arc<Self>,
        lookups: &mut HashMap<String, CancellationToken>,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Vec<String> {
        let mut wanted: HashSet<String> = self.table.watched_topics().into_iter().collect();
        wanted.insert(self.table.rendezvous().to_string());

        lookups.retain(|topic, token| {
            let keep = wanted.contains(topic);
            if !keep {
                token.cancel();
                tracing::debug!(%topic, "lookup stopped");
            }
            keep
        });

        let mut started = Vec::new();
        for topic in wanted {
            if lookups.contains_key(&topic) {
                continue;
            }
            let token = cancel.child_token();
            lookups.insert(topic.clone(), token.clone());

            let this = self.clone();
            let span = tracing::debug_span!("lookup", %topic);
            let name = topic.clone();
            tasks.spawn(async move { this.follow(name, token).await }.instrument(span));
            started.push(topic);
        }
        started
    }

    async fn follow(self: Arc<Self>, topic: String, cancel: CancellationToken) {
        let addrs = self.discover(Topic::new(topic.clone()), cancel);
        futures_util::pin_mut!(addrs);
        while let Some(addr) = addrs.next().await {
            if let Err(e) = self.handle_discovered(addr, &topic).await {
                tracing::debug!(%addr, "skipping discovered address: {e}");
            }
        }
    }

    async fn handle_discovered(&self, addr: SocketAddr, topic: &str) -> Result<(), DiscoveryError> {
        if addr == self.host.local_addr() || self.is_own_addr(addr) {
            return Ok(());
        }

        if let Some(peer) = self.table.peer_at(addr) {
            if self.streams.is_connected(&peer).await {
                self.remember(peer, addr, topic);
                return Ok(());
            }
        }

        let peer = self.host.connect(addr).await?;
        if peer == self.host.identity() {
            tracing::debug!(%addr, "address is our own listener");
            self.own_addrs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(addr);
            return Ok(());
        }

        self.streams.open(peer).await?;
        self.remember(peer, addr, topic);
        Ok(())
    }

    fn remember(&self, peer: PeerId, addr: SocketAddr, topic: &str) {
        if self.table.record(peer, addr, topic) {
            tracing::info!(%peer, %addr, %topic, "peer discovered");
            let _ = self.discovered_tx.send(peer);
        }
    }

    fn is_own_addr(&self, addr: SocketAddr) -> bool {
        self.own_addrs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&addr)
    }
}
