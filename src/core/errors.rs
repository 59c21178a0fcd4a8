//! Error surface of the world-state engine.

use crate::core::account::Address;
use crate::storage::mvcc::MvccError;
use crate::storage::storage_trait::StorageError;
use crate::storage::trie::TrieError;
use crate::types::encoding::DecodeError;
use chainstate_derive::Error;

/// Errors surfaced by the state layer.
///
/// Caller-protocol violations (`CannotPrepareTxStateTwice`,
/// `CannotUpdateTxStateBeforePrepare`) are never retried; backend and
/// arithmetic failures are propagated verbatim and fail the enclosing
/// operation. A non-empty dependency list from `check_and_update` is *not*
/// an error and is reported through the return value instead.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StateError {
    /// `prepare` was called twice with the same transaction id.
    #[error("cannot prepare a transaction state twice")]
    CannotPrepareTxStateTwice,
    /// The operation targeted a transaction id with no live state.
    #[error("cannot update a transaction state before prepare")]
    CannotUpdateTxStateBeforePrepare,
    /// The requested key does not exist.
    #[error("key not found")]
    KeyNotFound,
    /// No account exists under the given address.
    #[error("account not found: {0}")]
    AccountNotFound(Address),
    /// The account exists but is not a contract account.
    #[error("account {0} is not a contract")]
    NotAContract(Address),
    /// A contract account already exists under the derived address.
    #[error("contract account already exists: {0}")]
    ContractAlreadyExists(Address),
    /// Crediting a balance would exceed the representable maximum.
    #[error("balance overflow: adding {increment} to {current}")]
    BalanceOverflow { current: u128, increment: u128 },
    /// Debiting a balance below zero.
    #[error("insufficient balance: expected at least {expected} but got {actual}")]
    InsufficientBalance { actual: u128, expected: u128 },
    /// The gas ledger sum for this payer overflowed.
    #[error("gas ledger overflow for {0}")]
    GasOverflow(Address),
    /// A replayed or loaded consensus state has an unexpected concrete type.
    #[error("consensus state has an unexpected type")]
    InvalidConsensusState,
    /// Storage backend failure.
    #[error("{0}")]
    Storage(StorageError),
    /// MVCC overlay failure.
    #[error("{0}")]
    Mvcc(MvccError),
    /// Trie failure.
    #[error("{0}")]
    Trie(TrieError),
    /// A persisted state record failed to deserialize.
    #[error("failed to decode state record: {0}")]
    Decode(String),
    /// An event failed to (de)serialize as JSON.
    #[error("failed to encode or decode event: {0}")]
    EventCodec(String),
}

impl From<StorageError> for StateError {
    fn from(value: StorageError) -> Self {
        match value {
            StorageError::KeyNotFound => StateError::KeyNotFound,
            other => StateError::Storage(other),
        }
    }
}

impl From<MvccError> for StateError {
    fn from(value: MvccError) -> Self {
        match value {
            MvccError::Storage(StorageError::KeyNotFound) => StateError::KeyNotFound,
            other => StateError::Mvcc(other),
        }
    }
}

impl From<TrieError> for StateError {
    fn from(value: TrieError) -> Self {
        match value {
            TrieError::KeyNotFound => StateError::KeyNotFound,
            other => StateError::Trie(other),
        }
    }
}

impl From<DecodeError> for StateError {
    fn from(value: DecodeError) -> Self {
        StateError::Decode(value.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(value: serde_json::Error) -> Self {
        StateError::EventCodec(value.to_string())
    }
}
