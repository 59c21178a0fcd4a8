//! Byte-addressable storage abstraction.
//!
//! Defines the [`Storage`] trait the world state persists through. Backends
//! only need to be a flat key/value map; versioning, conflict detection and
//! authenticated structures are layered on top by
//! [`MvccDb`](crate::storage::mvcc::MvccDb) and
//! [`Trie`](crate::storage::trie::Trie).

use chainstate_derive::Error;

/// Errors that can occur while interacting with storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The requested key does not exist.
    #[error("key not found")]
    KeyNotFound,
    /// Backend-specific failure (I/O, corruption, ...), surfaced verbatim.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Persistent key/value backend for state data.
///
/// Implementations must be thread-safe (`Send + Sync`): a single backend is
/// shared by the block-level overlay and by every per-transaction view
/// derived from it.
pub trait Storage: Send + Sync {
    /// Retrieves the value stored under `key`.
    ///
    /// Returns [`StorageError::KeyNotFound`] if the key is absent.
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StorageError>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StorageError>;

    /// Removes `key` if present. Deleting an absent key is not an error.
    fn del(&self, key: &[u8]) -> Result<(), StorageError>;
}
