//! Key-value persistence behind a small synchronous trait.
//!
//! Production: [`SqliteStorage`] (single `kv` table).
//! Testing and ephemeral nodes: [`MemoryStorage`].
//!
//! Keys are `<entity prefix><channel scope><entity id>`; orders live under
//! `o/<channel_id>/<order_id hex>` so one channel can be listed or purged by
//! prefix.

mod memory;
mod sqlite;

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

use crate::channel::ChannelId;
use crate::error::StorageError;
use crate::order::OrderId;
use crate::types::ORDER_PREFIX;

/// One stored `(key, value)` pair.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Abstract key-value store. Implementations are internally synchronized.
pub trait Storage: Send + Sync {
    /// Insert or overwrite a value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Remove a key. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Remove every key starting with `prefix`, returning how many went.
    fn delete_all_with_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError>;

    /// Pairs whose key starts with `prefix`, in key order.
    fn scan_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = KvPair> + 'a>, StorageError>;
}

/// Key prefix of all orders in `channel_id`.
pub fn channel_prefix(channel_id: &ChannelId) -> Vec<u8> {
    format!("{ORDER_PREFIX}{channel_id}/").into_bytes()
}

/// Storage key of one order.
pub fn order_key(channel_id: &ChannelId, order_id: &OrderId) -> Vec<u8> {
    format!("{ORDER_PREFIX}{channel_id}/{order_id}").into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_key_is_scoped_by_channel() {
        let channel = ChannelId::from_hex("c0ffee");
        let order = OrderId::from_bytes([0xab; 32]);
        let key = order_key(&channel, &order);
        assert!(key.starts_with(&channel_prefix(&channel)));
        assert_eq!(
            String::from_utf8(key).unwrap(),
            format!("o/c0ffee/{}", "ab".repeat(32))
        );
    }

    #[test]
    fn channel_prefixes_do_not_overlap() {
        // "ab" must not match keys of channel "abc".
        let short = channel_prefix(&ChannelId::from_hex("ab"));
        let key = order_key(&ChannelId::from_hex("abc"), &OrderId::from_bytes([1; 32]));
        assert!(!key.starts_with(&short));
    }
}
