//! Core type definitions for the world-state engine.
//!
//! - `Hash`: fixed-size 32-byte SHA3-256 hashes, used for trie nodes,
//!   transaction identity and derived addresses
//! - `encoding`: deterministic binary serialization traits backing the
//!   `BinaryCodec` derive

pub mod encoding;
pub mod hash;
