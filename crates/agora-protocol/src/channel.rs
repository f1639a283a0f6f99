//! Channels: one broadcast group per ordered asset pair.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::discovery::PeerTable;
use crate::error::OrderError;
use crate::types::PeerId;

/// Separator between the two legs when hashing a pair.
const LEG_SEPARATOR: u8 = 0x1F;

/// Hex SHA-256 of `asset ‖ 0x1F ‖ counter_asset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Deterministic id of the pair; the order of the legs matters.
    pub fn for_pair(asset: &str, counter_asset: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(asset.as_bytes());
        hasher.update([LEG_SEPARATOR]);
        hasher.update(counter_asset.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an id received from the network or the user.
    pub fn from_hex(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A joined asset pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub asset: String,
    pub counter_asset: String,
}

pub(crate) fn validate_asset(asset: &str) -> Result<(), OrderError> {
    if asset.is_empty()
        || asset.chars().any(char::is_whitespace)
        || asset.as_bytes().contains(&LEG_SEPARATOR)
    {
        return Err(OrderError::InvalidAsset(asset.to_string()));
    }
    Ok(())
}

struct Subscription {
    channel: Channel,
    active: bool,
}

/// Local channel subscriptions and their member sets.
///
/// Membership is not stored: [`members_of`](Self::members_of) reads the
/// discovery peer table on every call.
pub struct ChannelRouter {
    local_id: PeerId,
    peers: Arc<PeerTable>,
    channels: RwLock<HashMap<ChannelId, Subscription>>,
}

impl ChannelRouter {
    pub fn new(local_id: PeerId, peers: Arc<PeerTable>) -> Self {
        Self {
            local_id,
            peers,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Subscribe to the `asset`/`counter_asset` channel and start discovering its peers.
    ///
    /// Joining again returns the same channel and resubscribes it.
    pub fn join(&self, asset: &str, counter_asset: &str) -> Result<Channel, OrderError> {
        validate_asset(asset)?;
        validate_asset(counter_asset)?;

        let id = ChannelId::for_pair(asset, counter_asset);
        let channel = {
            let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
            let sub = channels.entry(id.clone()).or_insert_with(|| Subscription {
                channel: Channel {
                    id: id.clone(),
                    asset: asset.to_string(),
                    counter_asset: counter_asset.to_string(),
                },
                active: true,
            });
            sub.active = true;
            sub.channel.clone()
        };

        self.peers.watch(&self.peers.channel_topic(&id));
        tracing::info!(channel = %id, asset, counter_asset, "joined channel");
        Ok(channel)
    }

    /// Stop targeting the channel. Local only; stored orders are kept.
    pub fn unsubscribe(&self, channel_id: &ChannelId) {
        let changed = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(channel_id)
            .map(|sub| std::mem::replace(&mut sub.active, false))
            .unwrap_or(false);
        if changed {
            self.peers.unwatch(&self.peers.channel_topic(channel_id));
            tracing::info!(channel = %channel_id, "unsubscribed from channel");
        }
    }

    /// Peers to target for `channel_id`, never including ourselves.
    pub fn members_of(&self, channel_id: &ChannelId) -> HashSet<PeerId> {
        if !self.is_subscribed(channel_id) {
            return HashSet::new();
        }
        let mut members = self.peers.peers_for(&self.peers.channel_topic(channel_id));
        members.remove(&self.local_id);
        members
    }

    pub fn channel(&self, channel_id: &ChannelId) -> Option<Channel> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .map(|sub| sub.channel.clone())
    }

    pub fn is_subscribed(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel_id)
            .is_some_and(|sub| sub.active)
    }

    /// Currently subscribed channels.
    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|sub| sub.active)
            .map(|sub| sub.channel.clone())
            .collect();
        channels.sort_by(|a, b| a.id.cmp(&b.id));
        channels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_secret_seed(&[seed; 32])
    }

    fn router() -> (ChannelRouter, Arc<PeerTable>) {
        let table = Arc::new(PeerTable::new(peer(0), "agora/test"));
        (ChannelRouter::new(peer(0), table.clone()), table)
    }

    #[test]
    fn channel_id_is_deterministic() {
        assert_eq!(
            ChannelId::for_pair("ETH", "BTC"),
            ChannelId::for_pair("ETH", "BTC")
        );
        assert_eq!(ChannelId::for_pair("ETH", "BTC").as_str().len(), 64);
    }

    #[test]
    fn channel_id_depends_on_leg_order() {
        assert_ne!(
            ChannelId::for_pair("ETH", "BTC"),
            ChannelId::for_pair("BTC", "ETH")
        );
    }

    #[test]
    fn separator_prevents_concatenation_collisions() {
        assert_ne!(
            ChannelId::for_pair("AB", "C"),
            ChannelId::for_pair("A", "BC")
        );
    }

    #[test]
    fn join_is_idempotent() {
        let (router, table) = router();
        let first = router.join("ETH", "BTC").unwrap();
        let second = router.join("ETH", "BTC").unwrap();
        assert_eq!(first, second);
        assert_eq!(router.channels().len(), 1);
        assert!(table
            .watched_topics()
            .contains(&table.channel_topic(&first.id)));
    }

    #[test]
    fn join_rejects_bad_assets() {
        let (router, _) = router();
        for bad in ["", "E TH", "ETH\n", "E\u{1f}TH"] {
            assert!(matches!(
                router.join(bad, "BTC"),
                Err(OrderError::InvalidAsset(_))
            ));
            assert!(matches!(
                router.join("BTC", bad),
                Err(OrderError::InvalidAsset(_))
            ));
        }
        assert!(router.channels().is_empty());
    }

    #[test]
    fn members_come_from_channel_topic() {
        let (router, table) = router();
        let channel = router.join("ETH", "BTC").unwrap();
        let topic = table.channel_topic(&channel.id);
        let addr = "127.0.0.1:1".parse().unwrap();

        table.record(peer(1), addr, &topic);
        table.record(peer(2), "127.0.0.1:2".parse().unwrap(), "agora/test");
        table.record(peer(0), "127.0.0.1:3".parse().unwrap(), &topic);

        let members = router.members_of(&channel.id);
        assert_eq!(members, HashSet::from([peer(1)]));
    }

    #[test]
    fn unknown_channel_has_no_members() {
        let (router, _) = router();
        assert!(router
            .members_of(&ChannelId::for_pair("ETH", "BTC"))
            .is_empty());
    }

    #[test]
    fn unsubscribe_stops_targeting() {
        let (router, table) = router();
        let channel = router.join("ETH", "BTC").unwrap();
        let topic = table.channel_topic(&channel.id);
        table.record(peer(1), "127.0.0.1:1".parse().unwrap(), &topic);
        assert_eq!(router.members_of(&channel.id).len(), 1);

        router.unsubscribe(&channel.id);
        router.unsubscribe(&channel.id);
        assert!(!router.is_subscribed(&channel.id));
        assert!(router.members_of(&channel.id).is_empty());
        assert!(router.channels().is_empty());
        assert!(!table.watched_topics().contains(&topic));
        // Still known, so a later join reuses it.
        assert!(router.channel(&channel.id).is_some());

        router.join("ETH", "BTC").unwrap();
        assert!(router.is_subscribed(&channel.id));
    }
}
