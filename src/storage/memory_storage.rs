//! Thread-safe in-memory storage backend.

use crate::storage::storage_trait::{Storage, StorageError};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory storage backed by a hash map.
///
/// Used for tests, and as the backing store of every conflict-detection
/// changelog (the changelog never needs durability).
pub struct MemoryStorage {
    inner: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.inner
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(StorageError::KeyNotFound)
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.inner.lock().unwrap().insert(key.to_vec(), value);
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), StorageError> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_missing_key_is_key_not_found() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(b"missing"), Err(StorageError::KeyNotFound));
    }

    #[test]
    fn put_then_get_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put(b"k", b"v".to_vec()).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn put_overwrites_previous_value() {
        let storage = MemoryStorage::new();
        storage.put(b"k", b"v1".to_vec()).unwrap();
        storage.put(b"k", b"v2".to_vec()).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn del_removes_key() {
        let storage = MemoryStorage::new();
        storage.put(b"k", b"v".to_vec()).unwrap();
        storage.del(b"k").unwrap();
        assert_eq!(storage.get(b"k"), Err(StorageError::KeyNotFound));
    }

    #[test]
    fn del_missing_key_is_ok() {
        let storage = MemoryStorage::new();
        assert!(storage.del(b"never-stored").is_ok());
    }

    #[test]
    fn concurrent_writers_do_not_lose_entries() {
        let storage = Arc::new(MemoryStorage::new());

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let s = Arc::clone(&storage);
                thread::spawn(move || {
                    s.put(&[i], vec![i]).unwrap();
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(storage.len(), 8);
        for i in 0..8u8 {
            assert_eq!(storage.get(&[i]).unwrap(), vec![i]);
        }
    }
}
