use std::time::{SystemTime, UNIX_EPOCH};

pub use agora_transport::PeerId;

/// Protocol tag order streams are negotiated under.
pub use agora_transport::ORDERS_PROTOCOL;

/// Default global rendezvous topic.
pub const DEFAULT_RENDEZVOUS: &str = "agora/rendezvous/1";

/// Storage key prefix of order records.
pub const ORDER_PREFIX: &str = "o/";

/// Storage key of the node keypair.
pub const KEYPAIR_KEY: &[u8] = b"i/keypair";

/// Current UNIX time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current UNIX time in nanoseconds.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

/// Serde adapter writing byte vectors as lowercase hex strings.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
