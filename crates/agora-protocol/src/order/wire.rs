//! Wire envelope carrying one order operation between nodes.
//!
//! Encoded as a single line of JSON. The envelope is signed by its origin
//! over every field but `signature`; the order inside carries the signature
//! of the node that created it.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelId;
use crate::error::OrderError;
use crate::identity::IdentityProvider;
use crate::order::Order;
use crate::types::{hex_bytes, now_ms, PeerId};

/// Order operation announced by a [`WireMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Create,
    Delete,
    Lock,
    Unlock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub operation: Operation,
    pub channel_id: ChannelId,
    /// JSON of the affected order; the last signed copy for `Delete`.
    #[serde(with = "hex_bytes")]
    pub payload: Vec<u8>,
    pub origin: PeerId,
    /// Send time, milliseconds since the UNIX epoch.
    pub timestamp: u64,
    #[serde(with = "hex_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignableMessage<'a> {
    operation: Operation,
    channel_id: &'a ChannelId,
    payload: &'a [u8],
    origin: &'a PeerId,
    timestamp: u64,
}

impl WireMessage {
    /// Unsigned envelope for `order`.
    pub fn new(
        operation: Operation,
        channel_id: ChannelId,
        order: &Order,
        origin: PeerId,
    ) -> Result<Self, OrderError> {
        let payload =
            serde_json::to_vec(order).map_err(|e| OrderError::Encode(format!("order: {e}")))?;
        Ok(Self {
            operation,
            channel_id,
            payload,
            origin,
            timestamp: now_ms(),
            signature: Vec::new(),
        })
    }

    /// Build and sign in one step.
    pub fn signed(
        operation: Operation,
        channel_id: ChannelId,
        order: &Order,
        identity: &dyn IdentityProvider,
    ) -> Result<Self, OrderError> {
        let mut message = Self::new(operation, channel_id, order, identity.peer_id())?;
        message.sign(identity)?;
        Ok(message)
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, OrderError> {
        let signable = SignableMessage {
            operation: self.operation,
            channel_id: &self.channel_id,
            payload: &self.payload,
            origin: &self.origin,
            timestamp: self.timestamp,
        };
        Ok(rmp_serde::to_vec(&signable)?)
    }

    pub fn sign(&mut self, identity: &dyn IdentityProvider) -> Result<(), OrderError> {
        self.signature = identity.sign(&self.signing_bytes()?);
        Ok(())
    }

    /// Check the envelope signature against `origin`.
    pub fn verify_signature(&self, identity: &dyn IdentityProvider) -> Result<(), OrderError> {
        let bytes = self.signing_bytes()?;
        if identity.verify(&self.origin, &self.signature, &bytes) {
            Ok(())
        } else {
            Err(OrderError::Verification(format!(
                "envelope signature of {} is invalid",
                self.origin
            )))
        }
    }

    /// Decode the carried order.
    pub fn order(&self) -> Result<Order, OrderError> {
        serde_json::from_slice(&self.payload).map_err(|e| OrderError::Decode(format!("payload: {e}")))
    }

    /// One line of JSON, no trailing newline.
    pub fn encode(&self) -> Result<String, OrderError> {
        serde_json::to_string(self).map_err(|e| OrderError::Encode(e.to_string()))
    }

    pub fn decode(line: &str) -> Result<Self, OrderError> {
        serde_json::from_str(line.trim_end()).map_err(|e| OrderError::Decode(e.to_string()))
    }
}
