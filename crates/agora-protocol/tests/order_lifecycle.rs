/// Integration tests: the order lifecycle through a started node.
///
/// Single node on localhost with an in-memory routing table; no peers,
/// so every operation is local.
use std::sync::Arc;

use agora_dht::MemoryRouting;
use agora_protocol::{
    Collaborators, CreateRequest, IdentityProvider, MemoryStorage, Node, NodeConfig,
    NodeIdentity, Operation, OrderError, OrderFeed, OrderState,
};
use agora_transport::HostConfig;

async fn start(feed: &OrderFeed) -> Node {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
    let identity = Arc::new(NodeIdentity::generate());
    let collaborators = Collaborators::new(
        Arc::new(MemoryStorage::new()),
        identity as Arc<dyn IdentityProvider>,
        Arc::new(feed.clone()),
    );
    let config =
        NodeConfig::new().host(HostConfig::new().listen_addr("127.0.0.1:0".parse().unwrap()));
    Node::start(config, collaborators, Arc::new(MemoryRouting::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn create_get_lock_unlock_verify() {
    let feed = OrderFeed::default();
    let mut events = feed.subscribe();
    let node = start(&feed).await;

    let channel = node.join("ETH", "BTC").unwrap();
    let order = node
        .create(CreateRequest {
            channel_id: channel.id.clone(),
            asset: "ETH".into(),
            counter_asset: "BTC".into(),
            amount: 52617562718,
            price: 0.1,
        })
        .await
        .unwrap();

    assert_eq!(order.state, OrderState::Open);
    assert_ne!(order.id.as_bytes(), &[0u8; 32]);
    assert_eq!(order.amount, 52617562718);
    assert_eq!(order.price, 0.1);
    assert_eq!(node.get_order(&channel.id, &order.id).unwrap(), order);
    assert!(node.verify_order(&node.peer_id(), &order));

    let locked = node.lock(&channel.id, &order.id).await.unwrap();
    assert_eq!(locked.state, OrderState::Locked);
    assert!(locked.is_signed());
    assert!(node.verify_order(&node.peer_id(), &locked));

    let unlocked = node.unlock(&channel.id, &order.id).await.unwrap();
    assert_eq!(unlocked.state, OrderState::Open);
    assert!(node.verify_order(&node.peer_id(), &unlocked));

    let operations: Vec<Operation> = (0..3)
        .map(|_| events.try_recv().unwrap().operation)
        .collect();
    assert_eq!(
        operations,
        vec![Operation::Create, Operation::Lock, Operation::Unlock]
    );

    node.shutdown().await;
}

#[tokio::test]
async fn rejected_transitions() {
    let node = start(&OrderFeed::default()).await;
    let channel = node.join("ETH", "BTC").unwrap();
    let order = node
        .create(CreateRequest {
            channel_id: channel.id.clone(),
            asset: "ETH".into(),
            counter_asset: "BTC".into(),
            amount: 1,
            price: 2.5,
        })
        .await
        .unwrap();

    let err = node.unlock(&channel.id, &order.id).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition { state: OrderState::Open, .. }));

    node.lock(&channel.id, &order.id).await.unwrap();
    let err = node.lock(&channel.id, &order.id).await.unwrap_err();
    assert!(matches!(err, OrderError::InvalidTransition { state: OrderState::Locked, .. }));

    node.delete(&channel.id, &order.id).await.unwrap();
    assert!(matches!(
        node.lock(&channel.id, &order.id).await,
        Err(OrderError::NotFound { .. })
    ));
    assert!(matches!(
        node.delete(&channel.id, &order.id).await,
        Err(OrderError::NotFound { .. })
    ));

    node.shutdown().await;
}

#[tokio::test]
async fn concurrent_creates_get_distinct_ids() {
    let node = Arc::new(start(&OrderFeed::default()).await);
    let channel = node.join("ETH", "BTC").unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let node = node.clone();
        let channel_id = channel.id.clone();
        handles.push(tokio::spawn(async move {
            node.create(CreateRequest {
                channel_id,
                asset: "ETH".into(),
                counter_asset: "BTC".into(),
                amount: 7,
                price: 0.1,
            })
            .await
            .unwrap()
            .id
        }));
    }

    let mut ids = std::collections::HashSet::new();
    for handle in handles {
        ids.insert(handle.await.unwrap());
    }
    assert_eq!(ids.len(), 32);
    assert_eq!(node.get_all_orders(&channel.id).unwrap().len(), 32);

    node.shutdown().await;
}
