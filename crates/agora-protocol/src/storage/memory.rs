use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{KvPair, Storage};
use crate::error::StorageError;

/// In-memory key-value store, ordered so prefix scans are range reads.
#[derive(Default)]
pub struct MemoryStorage {
    data: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn matching(&self, prefix: &[u8]) -> Vec<KvPair> {
        self.lock()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.lock().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.lock().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.lock().remove(key);
        Ok(())
    }

    fn delete_all_with_prefix(&self, prefix: &[u8]) -> Result<usize, StorageError> {
        let mut data = self.lock();
        let keys: Vec<Vec<u8>> = data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            data.remove(key);
        }
        Ok(keys.len())
    }

    fn scan_prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> Result<Box<dyn Iterator<Item = KvPair> + 'a>, StorageError> {
        Ok(Box::new(self.matching(prefix).into_iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let store = MemoryStorage::new();
        store.put(b"key1", b"value1").unwrap();
        store.put(b"key2", b"value2").unwrap();

        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key3").unwrap(), None);

        store.delete(b"key1").unwrap();
        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_overwrites() {
        let store = MemoryStorage::new();
        store.put(b"k", b"1").unwrap();
        store.put(b"k", b"2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStorage::new();
        store.put(b"o/a/2", b"two").unwrap();
        store.put(b"o/a/1", b"one").unwrap();
        store.put(b"o/b/1", b"other").unwrap();
        store.put(b"i/keypair", b"secret").unwrap();

        let keys: Vec<Vec<u8>> = store.scan_prefix(b"o/a/").unwrap().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"o/a/1".to_vec(), b"o/a/2".to_vec()]);

        assert_eq!(store.scan_prefix(b"").unwrap().count(), 4);
        assert_eq!(store.scan_prefix(b"x/").unwrap().count(), 0);
    }

    #[test]
    fn delete_all_with_prefix() {
        let store = MemoryStorage::new();
        store.put(b"o/a/1", b"1").unwrap();
        store.put(b"o/a/2", b"2").unwrap();
        store.put(b"o/b/1", b"3").unwrap();

        assert_eq!(store.delete_all_with_prefix(b"o/a/").unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.delete_all_with_prefix(b"o/a/").unwrap(), 0);
    }
}
