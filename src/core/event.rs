//! Contract-emitted events.
//!
//! Events are buffered in memory while a transaction executes and persisted
//! into the events trie when the transaction replays into its parent. The
//! persisted key is `tx_hash ∥ i64_be(seq)` with `seq` counting from 1 per
//! transaction, so a prefix scan over the transaction hash yields the events
//! in emission order. Values are JSON so downstream consumers can read them
//! without the engine's binary codec.

use crate::core::errors::StateError;
use crate::types::hash::Hash;
use serde::{Deserialize, Serialize};

/// A single event emitted during contract execution.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    /// Namespaced event category, e.g. `chain.transferFromContract`.
    pub topic: String,
    /// Event payload; conventionally JSON-encoded by the emitter.
    pub data: String,
}

impl Event {
    /// Creates an event.
    pub fn new(topic: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            data: data.into(),
        }
    }

    /// JSON-encodes the event for the events trie and the changelog.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an event persisted in the events trie.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Builds the events-trie key for the `seq`-th event of a transaction.
pub fn event_key(tx_hash: &Hash, seq: i64) -> Vec<u8> {
    tx_hash.concat_i64_be(seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let event = Event::new("chain.transfer", r#"{"amount":"10"}"#);
        let bytes = event.to_json_bytes().unwrap();
        assert_eq!(Event::from_json_bytes(&bytes).unwrap(), event);
    }

    #[test]
    fn invalid_json_is_a_codec_error() {
        let err = Event::from_json_bytes(b"not-json").unwrap_err();
        assert!(matches!(err, StateError::EventCodec(_)));
    }

    #[test]
    fn event_key_is_hash_then_big_endian_seq() {
        let tx = Hash::sha3().chain(b"tx").finalize();
        let key = event_key(&tx, 3);
        assert_eq!(&key[..32], tx.as_slice());
        assert_eq!(&key[32..], &[0, 0, 0, 0, 0, 0, 0, 3]);
    }
}
