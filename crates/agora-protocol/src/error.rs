use crate::channel::ChannelId;
use crate::order::OrderId;

/// Failures of a [`Storage`](crate::storage::Storage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored value could not be decoded: {0}")]
    Codec(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

/// Errors of the discovery service.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no DHT could be obtained: {0}")]
    DhtUnavailable(#[source] agora_dht::RoutingError),

    #[error("advertise failed: {0}")]
    Announce(#[source] agora_dht::RoutingError),

    #[error("peer query failed: {0}")]
    Query(#[source] agora_dht::RoutingError),

    #[error("transport error: {0}")]
    Transport(#[from] agora_transport::TransportError),
}

/// Errors of the order lifecycle manager and channel router.
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("order {order_id} not found in channel {channel_id}")]
    NotFound {
        channel_id: ChannelId,
        order_id: OrderId,
    },

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("order {0} was not created by this node")]
    NotOwner(OrderId),

    #[error("order {order_id} cannot be {action}: it is {state}")]
    InvalidTransition {
        order_id: OrderId,
        action: &'static str,
        state: crate::order::OrderState,
    },

    #[error("channel {0} is not joined")]
    UnknownChannel(ChannelId),

    #[error("invalid asset identifier {0:?}")]
    InvalidAsset(String),

    #[error("invalid price {0}: must be finite")]
    InvalidPrice(f64),

    #[error("pair {asset}/{counter_asset} does not belong to channel {channel_id}")]
    ChannelMismatch {
        channel_id: ChannelId,
        asset: String,
        counter_asset: String,
    },
}

impl From<rmp_serde::encode::Error> for OrderError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        OrderError::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for OrderError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        OrderError::Decode(e.to_string())
    }
}

/// Errors raised while starting a [`Node`](crate::runtime::Node).
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] agora_transport::TransportError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
