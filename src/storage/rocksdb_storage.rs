//! RocksDB-backed persistent storage.

use crate::storage::storage_trait::{Storage, StorageError};
use rocksdb::{Options, DB};
use std::path::Path;

/// Persistent storage backend over a RocksDB database.
///
/// One database holds the full node state: trie nodes for every state trie
/// plus whatever the embedding node stores alongside them. Keys are opaque
/// bytes, so the engine's content-addressed layout maps onto RocksDB
/// directly.
pub struct RocksDbStorage {
    db: DB,
}

impl RocksDbStorage {
    /// Opens (creating if necessary) a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    /// Destroys the database at the given path. Test and tooling helper.
    pub fn destroy(path: impl AsRef<Path>) -> Result<(), StorageError> {
        DB::destroy(&Options::default(), path).map_err(|e| StorageError::Backend(e.to_string()))
    }
}

impl Storage for RocksDbStorage {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        match self.db.get(key) {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Err(StorageError::KeyNotFound),
            Err(e) => Err(StorageError::Backend(e.to_string())),
        }
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn del(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

    /// Unique temp path per test so parallel tests do not collide.
    fn temp_db_path(name: &str) -> PathBuf {
        let n = DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "chainstate-rocksdb-{}-{}-{}",
            name,
            std::process::id(),
            n
        ))
    }

    #[test]
    fn put_get_del_roundtrip() {
        let path = temp_db_path("roundtrip");
        {
            let storage = RocksDbStorage::open(&path).unwrap();
            storage.put(b"k", b"v".to_vec()).unwrap();
            assert_eq!(storage.get(b"k").unwrap(), b"v".to_vec());

            storage.del(b"k").unwrap();
            assert_eq!(storage.get(b"k"), Err(StorageError::KeyNotFound));
        }
        RocksDbStorage::destroy(&path).unwrap();
    }

    #[test]
    fn values_survive_reopen() {
        let path = temp_db_path("reopen");
        {
            let storage = RocksDbStorage::open(&path).unwrap();
            storage.put(b"persisted", b"value".to_vec()).unwrap();
        }
        {
            let storage = RocksDbStorage::open(&path).unwrap();
            assert_eq!(storage.get(b"persisted").unwrap(), b"value".to_vec());
        }
        RocksDbStorage::destroy(&path).unwrap();
    }
}
