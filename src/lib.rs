//! Transactional world-state engine.
//!
//! Holds the chain's mutable state - accounts, transactions, events and
//! consensus state - and coordinates concurrent per-transaction execution
//! against it with optimistic concurrency control, deterministic replay and
//! atomic commit/rollback at the block boundary.

pub mod core;
pub mod service;
pub mod storage;
pub mod types;
pub mod utils;
