use std::fmt;
use std::str::FromStr;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::channel::ChannelId;
use crate::error::OrderError;
use crate::identity::IdentityProvider;
use crate::types::{hex_bytes, PeerId};

/// 32-byte order id, hex on the wire and in storage keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId([u8; 32]);

impl OrderId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderId({}...)", &hex::encode(self.0)[..12])
    }
}

impl FromStr for OrderId {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| OrderError::Decode(format!("order id: {e}")))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| OrderError::Decode(format!("order id {s:?} is not 32 bytes")))?;
        Ok(Self(bytes))
    }
}

impl Serialize for OrderId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for OrderId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Order lifecycle state. `Open` is initial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Open,
    Locked,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderState::Open => f.write_str("OPEN"),
            OrderState::Locked => f.write_str("LOCKED"),
        }
    }
}

/// Terms of a new order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub channel_id: ChannelId,
    pub asset: String,
    pub counter_asset: String,
    /// Quantity of `asset`, in its smallest unit.
    pub amount: u64,
    /// Price of one unit of `asset` in `counter_asset`.
    pub price: f64,
}

/// A signed limit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Creation time, nanoseconds since the UNIX epoch.
    pub created: u64,
    pub asset: String,
    pub counter_asset: String,
    pub amount: u64,
    pub price: f64,
    pub state: OrderState,
    /// Ed25519 signature over [`signing_bytes`](Self::signing_bytes). Empty if unsigned.
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

/// Fields covered by the order signature (everything but `signature`).
#[derive(Serialize)]
struct SignableOrder<'a> {
    id: &'a OrderId,
    created: u64,
    asset: &'a str,
    counter_asset: &'a str,
    amount: u64,
    price: f64,
    state: OrderState,
}

impl Order {
    /// Unsigned `Open` order for `request`.
    pub fn new(id: OrderId, created: u64, request: &CreateRequest) -> Self {
        Self {
            id,
            created,
            asset: request.asset.clone(),
            counter_asset: request.counter_asset.clone(),
            amount: request.amount,
            price: request.price,
            state: OrderState::Open,
            signature: Vec::new(),
        }
    }

    /// Canonical MessagePack bytes to sign and verify.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, OrderError> {
        let signable = SignableOrder {
            id: &self.id,
            created: self.created,
            asset: &self.asset,
            counter_asset: &self.counter_asset,
            amount: self.amount,
            price: self.price,
            state: self.state,
        };
        Ok(rmp_serde::to_vec(&signable)?)
    }

    /// Replace `signature` with a fresh one from `identity`.
    pub fn sign(&mut self, identity: &dyn IdentityProvider) -> Result<(), OrderError> {
        self.signature = identity.sign(&self.signing_bytes()?);
        Ok(())
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// MessagePack encoding used for storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OrderError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, OrderError> {
        Ok(rmp_serde::from_slice(data)?)
    }
}

/// Order id: HMAC-SHA256 keyed with `secret` over
/// `msgpack(request) ‖ created (u64 big-endian)`.
pub fn order_id(secret: &[u8], request: &CreateRequest, created: u64) -> Result<OrderId, OrderError> {
    let request_bytes = rmp_serde::to_vec(request)?;
    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|e| OrderError::Encode(format!("hmac key: {e}")))?;
    mac.update(&request_bytes);
    mac.update(&created.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let mut id = [0u8; 32];
    id.copy_from_slice(&digest);
    Ok(OrderId(id))
}

/// True when `order.signature` is a valid signature of `public_key` over the order.
pub fn verify_order(public_key: &PeerId, order: &Order) -> bool {
    match order.signing_bytes() {
        Ok(bytes) => crate::identity::verify_signature(public_key, &order.signature, &bytes),
        Err(_) => false,
    }
}
