use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agora_transport::{StreamManager, TransportError};

use crate::channel::{validate_asset, ChannelId, ChannelRouter};
use crate::error::OrderError;
use crate::identity::IdentityProvider;
use crate::notify::{Notifier, OrderEvent};
use crate::order::{order_id, verify_order, CreateRequest, Operation, Order, OrderId, OrderState, WireMessage};
use crate::runtime::Collaborators;
use crate::storage::{channel_prefix, order_key, Storage};
use crate::types::{now_ns, PeerId};

/// Where broadcast frames go.
///
/// In production: the [`StreamManager`]. In tests: a recording mock.
#[async_trait::async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, peer: PeerId, frame: &str) -> Result<(), TransportError>;
}

// ── Impl for StreamManager (production) ─────────────────────────────

#[async_trait::async_trait]
impl FrameSink for StreamManager {
    async fn send_frame(&self, peer: PeerId, frame: &str) -> Result<(), TransportError> {
        self.open(peer).await?;
        self.send(peer, frame).await
    }
}

fn check_pair(channel_id: &ChannelId, asset: &str, counter_asset: &str) -> Result<(), OrderError> {
    if ChannelId::for_pair(asset, counter_asset) != *channel_id {
        return Err(OrderError::ChannelMismatch {
            channel_id: channel_id.clone(),
            asset: asset.to_string(),
            counter_asset: counter_asset.to_string(),
        });
    }
    Ok(())
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

/// What [`OrderService::receive`] did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Stored {
        operation: Operation,
        order_id: OrderId,
    },
    Removed {
        order_id: OrderId,
    },
}

/// Order lifecycle manager.
///
/// Local operations persist first, then broadcast the signed envelope to the
/// channel members; a failed send never fails the operation. Remote
/// operations are verified and merged last-write-wins, never re-broadcast.
pub struct OrderService {
    storage: Arc<dyn Storage>,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    router: Arc<ChannelRouter>,
    sink: Arc<dyn FrameSink>,
    last_created: AtomicU64,
}

impl OrderService {
    pub fn new(collaborators: Collaborators, router: Arc<ChannelRouter>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            storage: collaborators.storage,
            identity: collaborators.identity,
            notifier: collaborators.notifier,
            router,
            sink,
            last_created: AtomicU64::new(0),
        }
    }

    pub fn router(&self) -> &Arc<ChannelRouter> {
        &self.router
    }

    /// Create, sign, persist and broadcast a new `Open` order.
    pub async fn create(&self, request: CreateRequest) -> Result<Order, OrderError> {
        validate_asset(&request.asset)?;
        validate_asset(&request.counter_asset)?;
        if !request.price.is_finite() {
            return Err(OrderError::InvalidPrice(request.price));
        }
        check_pair(&request.channel_id, &request.asset, &request.counter_asset)?;

        let created = self.next_created();
        let id = order_id(&self.identity.secret_seed(), &request, created)?;
        let mut order = Order::new(id, created, &request);
        order.sign(self.identity.as_ref())?;

        let channel_id = request.channel_id;
        let message = WireMessage::signed(Operation::Create, channel_id.clone(), &order, self.identity.as_ref())?;
        let line = message.encode()?;

        self.store(&channel_id, &order)?;
        tracing::info!(order = %order.id, channel = %channel_id, "order created");
        self.emit(Operation::Create, &channel_id, &order, self.identity.peer_id());

        self.broadcast(&channel_id, &line).await;
        Ok(order)
    }

    /// Remove an order and announce the removal.
    ///
    /// Orders created elsewhere are only removed locally: peers would reject
    /// our signature on them.
    pub async fn delete(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<(), OrderError> {
        let order = self.get_order(channel_id, order_id)?;
        let local = self.identity.peer_id();
        let owned = verify_order(&local, &order);
        let line = if owned {
            Some(WireMessage::signed(Operation::Delete, channel_id.clone(), &order, self.identity.as_ref())?.encode()?)
        } else {
            None
        };

        self.storage.delete(&order_key(channel_id, order_id))?;
        tracing::info!(order = %order_id, channel = %channel_id, "order deleted");
        self.emit(Operation::Delete, channel_id, &order, local);

        match line {
            Some(line) => {
                self.broadcast(channel_id, &line).await;
            }
            None => tracing::debug!(order = %order_id, "foreign order removed locally only"),
        }
        Ok(())
    }

    /// `Open → Locked`.
    pub async fn lock(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        self.transition(channel_id, order_id, OrderState::Locked, Operation::Lock)
            .await
    }

    /// `Locked → Open`.
    pub async fn unlock(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        self.transition(channel_id, order_id, OrderState::Open, Operation::Unlock)
            .await
    }

    async fn transition(
        &self,
        channel_id: &ChannelId,
        order_id: &OrderId,
        target: OrderState,
        operation: Operation,
    ) -> Result<Order, OrderError> {
        let mut order = self.get_order(channel_id, order_id)?;
        let local = self.identity.peer_id();
        if !verify_order(&local, &order) {
            return Err(OrderError::NotOwner(*order_id));
        }
        if order.state == target {
            return Err(OrderError::InvalidTransition {
                order_id: *order_id,
                action: match operation {
                    Operation::Lock => "locked",
                    _ => "unlocked",
                },
                state: order.state,
            });
        }

        order.state = target;
        order.sign(self.identity.as_ref())?;
        let line = WireMessage::signed(operation, channel_id.clone(), &order, self.identity.as_ref())?.encode()?;

        self.store(channel_id, &order)?;
        tracing::info!(order = %order_id, channel = %channel_id, state = %target, "order state changed");
        self.emit(operation, channel_id, &order, local);

        self.broadcast(channel_id, &line).await;
        Ok(order)
    }

    /// Apply one line received from `origin`.
    ///
    /// Checks, in order: the line decodes, the envelope was signed by
    /// `origin`, the order was signed by `origin`, the channel is joined.
    /// Create/Lock/Unlock overwrite the stored copy, Delete removes it.
    pub fn receive(&self, line: &str, origin: PeerId) -> Result<ReceiveOutcome, OrderError> {
        let message = WireMessage::decode(line)?;
        if message.origin != origin {
            return Err(OrderError::Verification(format!(
                "envelope claims origin {} but arrived from {origin}",
                message.origin
            )));
        }
        message.verify_signature(self.identity.as_ref())?;

        let order = message.order()?;
        check_pair(&message.channel_id, &order.asset, &order.counter_asset)
            .map_err(|e| OrderError::Verification(e.to_string()))?;
        if !self.identity.verify(&origin, &order.signature, &order.signing_bytes()?) {
            return Err(OrderError::Verification(format!(
                "order {} is not signed by {origin}",
                order.id
            )));
        }

        if !self.router.is_subscribed(&message.channel_id) {
            return Err(OrderError::UnknownChannel(message.channel_id));
        }

        let outcome = match message.operation {
            Operation::Create | Operation::Lock | Operation::Unlock => {
                self.store(&message.channel_id, &order)?;
                ReceiveOutcome::Stored {
                    operation: message.operation,
                    order_id: order.id,
                }
            }
            Operation::Delete => {
                self.storage.delete(&order_key(&message.channel_id, &order.id))?;
                ReceiveOutcome::Removed { order_id: order.id }
            }
        };

        tracing::debug!(
            operation = ?message.operation,
            order = %order.id,
            channel = %message.channel_id,
            %origin,
            "remote order applied"
        );
        self.emit(message.operation, &message.channel_id, &order, origin);
        Ok(outcome)
    }

    pub fn get_order(&self, channel_id: &ChannelId, order_id: &OrderId) -> Result<Order, OrderError> {
        match self.storage.get(&order_key(channel_id, order_id))? {
            Some(bytes) => Order::from_bytes(&bytes),
            None => Err(OrderError::NotFound {
                channel_id: channel_id.clone(),
                order_id: *order_id,
            }),
        }
    }

    /// Every stored order of `channel_id`, oldest first.
    ///
    /// Records that fail to decode are skipped with a warning.
    pub fn get_all_orders(&self, channel_id: &ChannelId) -> Result<Vec<Order>, OrderError> {
        let mut orders: Vec<Order> = self
            .storage
            .scan_prefix(&channel_prefix(channel_id))?
            .filter_map(|(key, value)| match Order::from_bytes(&value) {
                Ok(order) => Some(order),
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(&key), "skipping corrupt order record: {e}");
                    None
                }
            })
            .collect();
        orders.sort_by(|a, b| a.created.cmp(&b.created).then(a.id.cmp(&b.id)));
        Ok(orders)
    }

    /// Whether `order` carries a valid signature of `public_key`.
    pub fn verify_order(&self, public_key: &PeerId, order: &Order) -> bool {
        verify_order(public_key, order)
    }

    /// Id this node would give `request` at `created`.
    pub fn order_id(&self, request: &CreateRequest, created: u64) -> Result<OrderId, OrderError> {
        order_id(&self.identity.secret_seed(), request, created)
    }

    fn next_created(&self) -> u64 {
        let now = now_ns();
        let previous = self
            .last_created
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn store(&self, channel_id: &ChannelId, order: &Order) -> Result<(), OrderError> {
        self.storage
            .put(&order_key(channel_id, &order.id), &order.to_bytes()?)?;
        Ok(())
    }

    fn emit(&self, operation: Operation, channel_id: &ChannelId, order: &Order, origin: PeerId) {
        self.notifier.notify(OrderEvent {
            operation,
            channel_id: channel_id.clone(),
            order: order.clone(),
            origin,
        });
    }

    /// Send `line` to every member of the channel except ourselves.
    async fn broadcast(&self, channel_id: &ChannelId, line: &str) -> BroadcastReport {
        let local = self.identity.peer_id();
        let targets: Vec<PeerId> = self
            .router
            .members_of(channel_id)
            .into_iter()
            .filter(|peer| *peer != local)
            .collect();

        let results = futures_util::future::join_all(
            targets.iter().map(|peer| self.sink.send_frame(*peer, line)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(%peer, channel = %channel_id, "broadcast send failed: {e}");
                }
            }
        }
        tracing::debug!(
            channel = %channel_id,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast finished"
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Fake sink recording every frame.
    #[derive(Clone, Default)]
    pub struct MockSink {
        sent: Arc<Mutex<Vec<(PeerId, String)>>>,
        fail_sends: Arc<Mutex<bool>>,
    }

    impl MockSink {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn sent(&self) -> Vec<(PeerId, String)> {
            self.sent.lock().unwrap().clone()
        }

        pub fn set_fail_sends(&self, fail: bool) {
            *self.fail_sends.lock().unwrap() = fail;
        }
    }

    #[async_trait::async_trait]
    impl FrameSink for MockSink {
        async fn send_frame(&self, peer: PeerId, frame: &str) -> Result<(), TransportError> {
            if *self.fail_sends.lock().unwrap() {
                return Err(TransportError::NotConnected { peer });
            }
            self.sent.lock().unwrap().push((peer, frame.to_string()));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockSink;
    use super::*;
    use crate::discovery::PeerTable;
    use crate::identity::NodeIdentity;
    use crate::notify::OrderFeed;
    use crate::storage::MemoryStorage;

    struct Fixture {
        service: OrderService,
        sink: MockSink,
        table: Arc<PeerTable>,
        feed: OrderFeed,
        identity: Arc<NodeIdentity>,
        storage: Arc<MemoryStorage>,
    }

    fn fixture(seed: u8) -> Fixture {
        let identity = Arc::new(NodeIdentity::from_seed([seed; 32]));
        let storage = Arc::new(MemoryStorage::new());
        let feed = OrderFeed::new(64);
        let table = Arc::new(PeerTable::new(identity.peer_id(), "rv"));
        let router = Arc::new(ChannelRouter::new(identity.peer_id(), table.clone()));
        let sink = MockSink::new();
        let service = OrderService::new(
            Collaborators {
                storage: storage.clone(),
                identity: identity.clone(),
                notifier: Arc::new(feed.clone()),
            },
            router,
            Arc::new(sink.clone()),
        );
        Fixture {
            service,
            sink,
            table,
            feed,
            identity,
            storage,
        }
    }

    fn eth_btc(service: &OrderService) -> CreateRequest {
        let channel = service.router().join("ETH", "BTC").unwrap();
        CreateRequest {
            channel_id: channel.id,
            asset: "ETH".into(),
            counter_asset: "BTC".into(),
            amount: 52617562718,
            price: 0.1,
        }
    }

    fn add_member(fx: &Fixture, channel_id: &ChannelId, seed: u8) -> PeerId {
        let peer = PeerId::from_secret_seed(&[seed; 32]);
        let port = 4000 + seed as u16;
        fx.table.record(
            peer,
            std::net::SocketAddr::from(([127, 0, 0, 1], port)),
            &fx.table.channel_topic(channel_id),
        );
        peer
    }

    #[tokio::test]
    async fn create_then_get() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let order = fx.service.create(request.clone()).await.unwrap();

        assert_eq!(order.state, OrderState::Open);
        assert!(fx.service.verify_order(&fx.identity.peer_id(), &order));
        assert_eq!(fx.service.get_order(&request.channel_id, &order.id).unwrap(), order);
        assert_eq!(fx.service.order_id(&request, order.created).unwrap(), order.id);
    }

    #[tokio::test]
    async fn sequential_creates_get_distinct_ids() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let mut ids = std::collections::HashSet::new();
        for _ in 0..20 {
            ids.insert(fx.service.create(request.clone()).await.unwrap().id);
        }
        assert_eq!(ids.len(), 20);

        let all = fx.service.get_all_orders(&request.channel_id).unwrap();
        assert_eq!(all.len(), 20);
        assert!(all.iter().all(|o| o.state == OrderState::Open));
        assert!(all.windows(2).all(|w| w[0].created < w[1].created));
    }

    #[tokio::test]
    async fn create_rejects_bad_assets() {
        let fx = fixture(1);
        let mut request = eth_btc(&fx.service);
        request.asset = String::new();
        assert!(matches!(
            fx.service.create(request).await,
            Err(OrderError::InvalidAsset(_))
        ));
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn create_rejects_non_finite_prices() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        for price in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let request = CreateRequest {
                price,
                ..request.clone()
            };
            assert!(matches!(
                fx.service.create(request).await,
                Err(OrderError::InvalidPrice(_))
            ));
        }
        assert!(fx.storage.is_empty());
        assert!(fx.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_pair_outside_its_channel() {
        let fx = fixture(1);
        let request = CreateRequest {
            asset: "DOGE".into(),
            counter_asset: "USD".into(),
            ..eth_btc(&fx.service)
        };
        assert!(matches!(
            fx.service.create(request).await,
            Err(OrderError::ChannelMismatch { .. })
        ));

        let reversed = CreateRequest {
            asset: "BTC".into(),
            counter_asset: "ETH".into(),
            ..eth_btc(&fx.service)
        };
        assert!(matches!(
            fx.service.create(reversed).await,
            Err(OrderError::ChannelMismatch { .. })
        ));
        assert!(fx.storage.is_empty());
    }

    #[tokio::test]
    async fn lock_unlock_cycle() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let order = fx.service.create(request.clone()).await.unwrap();

        let locked = fx.service.lock(&request.channel_id, &order.id).await.unwrap();
        assert_eq!(locked.state, OrderState::Locked);
        assert!(fx.service.verify_order(&fx.identity.peer_id(), &locked));
        assert_eq!(
            fx.service.get_order(&request.channel_id, &order.id).unwrap().state,
            OrderState::Locked
        );

        assert!(matches!(
            fx.service.lock(&request.channel_id, &order.id).await,
            Err(OrderError::InvalidTransition { .. })
        ));

        let unlocked = fx.service.unlock(&request.channel_id, &order.id).await.unwrap();
        assert_eq!(unlocked.state, OrderState::Open);
        assert!(fx.service.verify_order(&fx.identity.peer_id(), &unlocked));
        assert!(matches!(
            fx.service.unlock(&request.channel_id, &order.id).await,
            Err(OrderError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn missing_orders_are_not_found() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let missing = OrderId::from_bytes([0xee; 32]);

        assert!(matches!(
            fx.service.get_order(&request.channel_id, &missing),
            Err(OrderError::NotFound { .. })
        ));
        assert!(matches!(
            fx.service.delete(&request.channel_id, &missing).await,
            Err(OrderError::NotFound { .. })
        ));
        assert!(matches!(
            fx.service.lock(&request.channel_id, &missing).await,
            Err(OrderError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn delete_removes_and_broadcasts() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let member = add_member(&fx, &request.channel_id, 50);
        let order = fx.service.create(request.clone()).await.unwrap();

        fx.service.delete(&request.channel_id, &order.id).await.unwrap();
        assert!(matches!(
            fx.service.get_order(&request.channel_id, &order.id),
            Err(OrderError::NotFound { .. })
        ));

        let sent = fx.sink.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|(peer, _)| *peer == member));
        let last = WireMessage::decode(&sent[1].1).unwrap();
        assert_eq!(last.operation, Operation::Delete);
        assert_eq!(last.order().unwrap().id, order.id);
    }

    #[tokio::test]
    async fn broadcast_targets_members_only() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        let a = add_member(&fx, &request.channel_id, 60);
        let b = add_member(&fx, &request.channel_id, 61);
        // Known under the rendezvous only: not a member.
        fx.table.record(
            PeerId::from_secret_seed(&[62; 32]),
            "127.0.0.1:5062".parse().unwrap(),
            "rv",
        );

        fx.service.create(request).await.unwrap();

        let mut targets: Vec<PeerId> = fx.sink.sent().into_iter().map(|(p, _)| p).collect();
        targets.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(targets, expected);
        assert!(!targets.contains(&fx.identity.peer_id()));
    }

    #[tokio::test]
    async fn failed_sends_do_not_fail_the_operation() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        add_member(&fx, &request.channel_id, 70);
        fx.sink.set_fail_sends(true);

        let order = fx.service.create(request.clone()).await.unwrap();
        assert!(fx.service.get_order(&request.channel_id, &order.id).is_ok());
    }

    #[tokio::test]
    async fn unsubscribed_channel_gets_no_broadcast() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        add_member(&fx, &request.channel_id, 80);
        fx.service.router().unsubscribe(&request.channel_id);

        fx.service.create(request).await.unwrap();
        assert!(fx.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn local_operations_are_notified() {
        let fx = fixture(1);
        let mut events = fx.feed.subscribe();
        let request = eth_btc(&fx.service);
        let order = fx.service.create(request.clone()).await.unwrap();
        fx.service.lock(&request.channel_id, &order.id).await.unwrap();

        let created = events.recv().await.unwrap();
        assert_eq!(created.operation, Operation::Create);
        assert_eq!(created.origin, fx.identity.peer_id());
        let locked = events.recv().await.unwrap();
        assert_eq!(locked.operation, Operation::Lock);
        assert_eq!(locked.order.state, OrderState::Locked);
    }

    #[tokio::test]
    async fn receive_applies_remote_create_idempotently() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        let bob_id = add_member(&alice, &request.channel_id, 2);

        let order = alice.service.create(request.clone()).await.unwrap();
        let (to, line) = alice.sink.sent().pop().unwrap();
        assert_eq!(to, bob_id);

        let alice_id = alice.identity.peer_id();
        let outcome = bob.service.receive(&line, alice_id).unwrap();
        assert_eq!(
            outcome,
            ReceiveOutcome::Stored {
                operation: Operation::Create,
                order_id: order.id
            }
        );
        bob.service.receive(&line, alice_id).unwrap();

        let all = bob.service.get_all_orders(&request.channel_id).unwrap();
        assert_eq!(all, vec![order]);
        // Receiving never re-broadcasts.
        assert!(bob.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn receive_follows_lock_and_delete() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        add_member(&alice, &request.channel_id, 2);
        let alice_id = alice.identity.peer_id();

        let order = alice.service.create(request.clone()).await.unwrap();
        alice.service.lock(&request.channel_id, &order.id).await.unwrap();
        alice.service.delete(&request.channel_id, &order.id).await.unwrap();
        let lines: Vec<String> = alice.sink.sent().into_iter().map(|(_, l)| l).collect();
        assert_eq!(lines.len(), 3);

        bob.service.receive(&lines[0], alice_id).unwrap();
        bob.service.receive(&lines[1], alice_id).unwrap();
        assert_eq!(
            bob.service.get_order(&request.channel_id, &order.id).unwrap().state,
            OrderState::Locked
        );

        assert_eq!(
            bob.service.receive(&lines[2], alice_id).unwrap(),
            ReceiveOutcome::Removed { order_id: order.id }
        );
        assert!(bob.service.get_all_orders(&request.channel_id).unwrap().is_empty());
        // Delete of an absent order is fine.
        bob.service.receive(&lines[2], alice_id).unwrap();
    }

    #[tokio::test]
    async fn receive_rejects_wrong_origin() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        add_member(&alice, &request.channel_id, 2);
        alice.service.create(request).await.unwrap();
        let (_, line) = alice.sink.sent().pop().unwrap();

        let mallory = PeerId::from_secret_seed(&[66; 32]);
        assert!(matches!(
            bob.service.receive(&line, mallory),
            Err(OrderError::Verification(_))
        ));
    }

    #[tokio::test]
    async fn receive_rejects_order_signed_by_someone_else() {
        let alice = fixture(1);
        let mallory = fixture(3);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        let order = alice.service.create(request.clone()).await.unwrap();

        // Mallory re-wraps Alice's order in an envelope of her own.
        let line = WireMessage::signed(
            Operation::Lock,
            request.channel_id.clone(),
            &order,
            mallory.identity.as_ref(),
        )
        .unwrap()
        .encode()
        .unwrap();

        assert!(matches!(
            bob.service.receive(&line, mallory.identity.peer_id()),
            Err(OrderError::Verification(_))
        ));
        assert!(bob.service.get_all_orders(&request.channel_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn receive_rejects_unknown_channel() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        add_member(&alice, &request.channel_id, 2);
        alice.service.create(request).await.unwrap();
        let (_, line) = alice.sink.sent().pop().unwrap();

        assert!(matches!(
            bob.service.receive(&line, alice.identity.peer_id()),
            Err(OrderError::UnknownChannel(_))
        ));
        assert!(bob.storage.is_empty());
    }

    #[tokio::test]
    async fn receive_rejects_garbage() {
        let bob = fixture(2);
        assert!(matches!(
            bob.service.receive("{not json", PeerId::from_secret_seed(&[1; 32])),
            Err(OrderError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn remote_orders_cannot_be_locked() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        add_member(&alice, &request.channel_id, 2);
        let order = alice.service.create(request.clone()).await.unwrap();
        let (_, line) = alice.sink.sent().pop().unwrap();
        bob.service.receive(&line, alice.identity.peer_id()).unwrap();

        assert!(matches!(
            bob.service.lock(&request.channel_id, &order.id).await,
            Err(OrderError::NotOwner(_))
        ));

        // A foreign delete stays local.
        add_member(&bob, &request.channel_id, 1);
        bob.service.delete(&request.channel_id, &order.id).await.unwrap();
        assert!(bob.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn last_write_wins_by_arrival() {
        let alice = fixture(1);
        let bob = fixture(2);
        let request = eth_btc(&alice.service);
        eth_btc(&bob.service);
        add_member(&alice, &request.channel_id, 2);
        let alice_id = alice.identity.peer_id();

        let order = alice.service.create(request.clone()).await.unwrap();
        alice.service.lock(&request.channel_id, &order.id).await.unwrap();
        let lines: Vec<String> = alice.sink.sent().into_iter().map(|(_, l)| l).collect();

        // Lock arrives before Create: the later arrival wins.
        bob.service.receive(&lines[1], alice_id).unwrap();
        bob.service.receive(&lines[0], alice_id).unwrap();
        assert_eq!(
            bob.service.get_order(&request.channel_id, &order.id).unwrap().state,
            OrderState::Open
        );
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped_in_listing() {
        let fx = fixture(1);
        let request = eth_btc(&fx.service);
        fx.service.create(request.clone()).await.unwrap();
        fx.storage
            .put(&order_key(&request.channel_id, &OrderId::from_bytes([0; 32])), b"junk")
            .unwrap();
        assert_eq!(fx.service.get_all_orders(&request.channel_id).unwrap().len(), 1);
    }
}
