//! Agora protocol layer.
//!
//! Peers find each other through a rendezvous topic on a DHT, join one
//! channel per asset pair and exchange signed limit orders over
//! newline-framed JSON streams.
//!
//! Modules:
//! - `channel`: channel ids and subscriptions
//! - `discovery`: bootstrap, advertising and per-topic lookups
//! - `identity`: Ed25519 node keypair
//! - `order`: order ids, signatures, wire envelope and lifecycle
//! - `storage`: key-value persistence (SQLite or memory)
//! - `notify`: order event feed
//! - `runtime`: the [`Node`] tying it together
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agora_dht::{DhtConfig, DhtRouting};
//! use agora_protocol::{Collaborators, CreateRequest, Node, NodeConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let routing = Arc::new(DhtRouting::new(DhtConfig::default())?);
//! let node = Node::start(NodeConfig::new(), Collaborators::ephemeral(), routing).await?;
//!
//! let channel = node.join("ETH", "BTC")?;
//! let order = node
//!     .create(CreateRequest {
//!         channel_id: channel.id.clone(),
//!         asset: "ETH".into(),
//!         counter_asset: "BTC".into(),
//!         amount: 52617562718,
//!         price: 0.1,
//!     })
//!     .await?;
//! node.lock(&channel.id, &order.id).await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod notify;
pub mod order;
pub mod runtime;
pub mod storage;
pub mod types;

pub use channel::{Channel, ChannelId, ChannelRouter};
pub use discovery::{DiscoveryConfig, DiscoveryService, DiscoveryState, PeerRecord, PeerTable};
pub use error::{DiscoveryError, NodeError, OrderError, StorageError};
pub use identity::{IdentityProvider, NodeIdentity};
pub use notify::{NoopNotifier, Notifier, OrderEvent, OrderFeed};
pub use order::{
    BroadcastReport, CreateRequest, FrameSink, Operation, Order, OrderId, OrderService, OrderState,
    ReceiveOutcome, WireMessage,
};
pub use runtime::{Collaborators, Node, NodeConfig};
pub use storage::{MemoryStorage, SqliteStorage, Storage};
pub use types::PeerId;
