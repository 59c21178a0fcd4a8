//! Storage subsystem for the world-state engine.
//!
//! This module provides the persistence abstractions and the transactional
//! machinery the state layer is built on:
//!
//! - [`storage_trait`]: the byte-addressable [`Storage`](storage_trait::Storage)
//!   trait every backend implements
//! - [`memory_storage`]: thread-safe in-memory backend for tests and the
//!   conflict-detection changelog
//! - [`rocksdb_storage`]: RocksDB-backed persistent implementation
//! - [`mvcc`]: versioned overlay ([`MvccDb`](mvcc::MvccDb)) providing
//!   per-transaction views with optimistic conflict detection
//! - [`trie`]: merkle radix trie with content-addressed nodes stored through
//!   an [`MvccDb`](mvcc::MvccDb) overlay

pub mod memory_storage;
pub mod mvcc;
pub mod rocksdb_storage;
pub mod storage_trait;
pub mod trie;
