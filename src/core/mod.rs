//! Core state-engine data structures and the transactional world state.
//!
//! This module contains the building blocks of the chain's mutable state:
//! - `Account`: user and contract account records persisted in the accounts trie
//! - `AccountState`: dirty-tracking account mapping over a trie
//! - `Event`: contract-emitted events, JSON-encoded in the events trie
//! - `consensus`: the consensus plug-in contract and the dynasty implementation
//! - `world_state`: the `States` bundle, `WorldState` and `TxWorldState`
//!   implementing per-transaction optimistic concurrency control

pub mod account;
pub mod account_state;
pub mod consensus;
pub mod errors;
pub mod event;
pub mod world_state;
