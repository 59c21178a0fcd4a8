//! Consensus plug-in contract and the dynasty-based implementation.
//!
//! The engine treats consensus state as an opaque sub-state that must commit,
//! copy and replay under the same transactional boundary as accounts, txs
//! and events. [`Consensus`] constructs states from persisted roots;
//! [`ConsensusState`] is the per-world-state instance.

use crate::core::account_state::AccountState;
use crate::core::errors::StateError;
use crate::storage::mvcc::{MvccDb, TxId};
use crate::storage::trie::{Trie, TrieError};
use crate::types::hash::Hash;
use chainstate_derive::BinaryCodec;
use std::any::Any;
use std::sync::Arc;

/// Persisted identity of a consensus-state snapshot.
#[derive(BinaryCodec, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsensusRoot {
    /// Chain time of the snapshot in seconds.
    pub timestamp: i64,
    /// Validator expected to propose at `timestamp`.
    pub proposer: Hash,
    /// Root of the dynasty trie.
    pub dynasty_root: Hash,
}

/// Factory for consensus states; the plug-in half of the engine contract.
pub trait Consensus<I: TxId>: Send + Sync {
    /// Builds a consensus state over the given overlay, resuming from a
    /// persisted root when one is supplied.
    fn new_state(
        &self,
        root: Option<&ConsensusRoot>,
        db: &MvccDb<I>,
        track_delta: bool,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError>;
}

/// A consensus-state snapshot bound to one `States` bundle.
pub trait ConsensusState<I: TxId>: Send {
    /// Concrete-type escape hatch used by `replay`.
    fn as_any(&self) -> &dyn Any;

    /// Returns the persistable identity of this snapshot.
    fn root(&self) -> ConsensusRoot;

    /// Returns the current validator set in dynasty order.
    fn dynasty(&self) -> Result<Vec<Hash>, StateError>;

    /// Returns the root of the dynasty trie.
    fn dynasty_root(&self) -> Hash;

    /// Adopts the changes of `other`, a state advanced by a child
    /// transaction. Fails with [`StateError::InvalidConsensusState`] when
    /// `other` was produced by a different plug-in.
    fn replay(&mut self, other: &dyn ConsensusState<I>) -> Result<(), StateError>;

    /// Re-roots this state onto another overlay.
    fn copy_to(
        &self,
        db: &MvccDb<I>,
        track_delta: bool,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError>;

    /// Produces the state `elapsed_secs` later, consulting the world's
    /// account state where the algorithm needs it.
    fn next_state(
        &self,
        elapsed_secs: i64,
        accounts: &mut AccountState<I>,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError>;
}

/// Proof-of-stake-style consensus with a fixed validator dynasty and
/// time-sliced proposer rotation.
pub struct DynastyConsensus {
    /// Genesis validator set, in dynasty order.
    validators: Vec<Hash>,
    /// Seconds per proposer slot.
    block_interval_secs: i64,
}

impl DynastyConsensus {
    pub const DEFAULT_BLOCK_INTERVAL_SECS: i64 = 5;

    /// Creates a plug-in seeding new states with the given validator set.
    pub fn new(validators: Vec<Hash>) -> Arc<Self> {
        Arc::new(Self {
            validators,
            block_interval_secs: Self::DEFAULT_BLOCK_INTERVAL_SECS,
        })
    }

    /// Creates a plug-in with a custom proposer slot length.
    pub fn with_block_interval(validators: Vec<Hash>, block_interval_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            validators,
            block_interval_secs,
        })
    }
}

impl<I: TxId> Consensus<I> for DynastyConsensus {
    fn new_state(
        &self,
        root: Option<&ConsensusRoot>,
        db: &MvccDb<I>,
        track_delta: bool,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError> {
        let state = match root {
            Some(root) => DynastyState {
                timestamp: root.timestamp,
                proposer: root.proposer,
                dynasty: Trie::with_root(root.dynasty_root, db.clone(), track_delta)?,
                block_interval_secs: self.block_interval_secs,
            },
            None => {
                let mut dynasty = Trie::new(db.clone(), track_delta);
                for (idx, validator) in self.validators.iter().enumerate() {
                    dynasty.put(&(idx as u64).to_be_bytes(), validator.to_vec())?;
                }
                DynastyState {
                    timestamp: 0,
                    proposer: self.validators.first().copied().unwrap_or_else(Hash::zero),
                    dynasty,
                    block_interval_secs: self.block_interval_secs,
                }
            }
        };
        Ok(Box::new(state))
    }
}

/// Dynasty consensus state: chain time, expected proposer and the validator
/// trie, keyed by big-endian dynasty index.
struct DynastyState<I: TxId> {
    timestamp: i64,
    proposer: Hash,
    dynasty: Trie<I>,
    block_interval_secs: i64,
}

impl<I: TxId> ConsensusState<I> for DynastyState<I> {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn root(&self) -> ConsensusRoot {
        ConsensusRoot {
            timestamp: self.timestamp,
            proposer: self.proposer,
            dynasty_root: self.dynasty.root_hash(),
        }
    }

    fn dynasty(&self) -> Result<Vec<Hash>, StateError> {
        let iter = match self.dynasty.iterator(&[]) {
            Ok(iter) => iter,
            Err(TrieError::KeyNotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut validators = Vec::new();
        for entry in iter {
            let (_, bytes) = entry?;
            let validator = Hash::from_slice(&bytes)
                .ok_or_else(|| StateError::Decode("dynasty entry is not a hash".to_string()))?;
            validators.push(validator);
        }
        Ok(validators)
    }

    fn dynasty_root(&self) -> Hash {
        self.dynasty.root_hash()
    }

    fn replay(&mut self, other: &dyn ConsensusState<I>) -> Result<(), StateError> {
        let other = other
            .as_any()
            .downcast_ref::<DynastyState<I>>()
            .ok_or(StateError::InvalidConsensusState)?;

        self.timestamp = other.timestamp;
        self.proposer = other.proposer;
        self.dynasty.replay(&other.dynasty)?;
        Ok(())
    }

    fn copy_to(
        &self,
        db: &MvccDb<I>,
        track_delta: bool,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError> {
        Ok(Box::new(DynastyState {
            timestamp: self.timestamp,
            proposer: self.proposer,
            dynasty: self.dynasty.copy_to(db, track_delta)?,
            block_interval_secs: self.block_interval_secs,
        }))
    }

    fn next_state(
        &self,
        elapsed_secs: i64,
        _accounts: &mut AccountState<I>,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError> {
        let timestamp = self.timestamp + elapsed_secs;
        let validators = self.dynasty()?;

        let proposer = if validators.is_empty() {
            Hash::zero()
        } else {
            let slot = timestamp.div_euclid(self.block_interval_secs);
            validators[slot.rem_euclid(validators.len() as i64) as usize]
        };

        Ok(Box::new(DynastyState {
            timestamp,
            proposer,
            dynasty: self.dynasty.clone(),
            block_interval_secs: self.block_interval_secs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_storage::MemoryStorage;
    use crate::storage::mvcc::MvccDb;
    use crate::utils::test_utils::utils::random_hash;

    fn overlay() -> MvccDb<&'static str> {
        MvccDb::new(Arc::new(MemoryStorage::new()), true)
    }

    fn three_validators() -> Vec<Hash> {
        (0..3).map(|_| random_hash()).collect()
    }

    #[test]
    fn new_state_seeds_the_dynasty() {
        let validators = three_validators();
        let consensus = DynastyConsensus::new(validators.clone());
        let db = overlay();

        let state = consensus.new_state(None, &db, false).unwrap();
        assert_eq!(state.dynasty().unwrap(), validators);
        assert_eq!(state.root().proposer, validators[0]);
        assert_ne!(state.dynasty_root(), Hash::zero());
    }

    #[test]
    fn state_roundtrips_through_its_root() {
        let consensus = DynastyConsensus::new(three_validators());
        let db = overlay();

        let state = consensus.new_state(None, &db, false).unwrap();
        let root = state.root();

        let reloaded = consensus.new_state(Some(&root), &db, false).unwrap();
        assert_eq!(reloaded.root(), root);
        assert_eq!(reloaded.dynasty().unwrap(), state.dynasty().unwrap());
    }

    #[test]
    fn proposer_rotates_with_elapsed_time() {
        let validators = three_validators();
        let consensus = DynastyConsensus::with_block_interval(validators.clone(), 5);
        let db = overlay();
        let mut accounts = AccountState::new(None, &db, false).unwrap();

        let genesis = consensus.new_state(None, &db, false).unwrap();
        let slot1 = genesis.next_state(5, &mut accounts).unwrap();
        let slot2 = slot1.next_state(5, &mut accounts).unwrap();

        assert_eq!(slot1.root().timestamp, 5);
        assert_eq!(slot1.root().proposer, validators[1]);
        assert_eq!(slot2.root().proposer, validators[2]);
    }

    #[test]
    fn advancing_preserves_the_dynasty_root() {
        let consensus = DynastyConsensus::new(three_validators());
        let db = overlay();
        let mut accounts = AccountState::new(None, &db, false).unwrap();

        let genesis = consensus.new_state(None, &db, false).unwrap();
        let advanced = genesis.next_state(7, &mut accounts).unwrap();
        assert_eq!(advanced.dynasty_root(), genesis.dynasty_root());
    }

    #[test]
    fn replay_adopts_the_advanced_snapshot() {
        let consensus = DynastyConsensus::new(three_validators());
        let db = overlay();
        let mut accounts = AccountState::new(None, &db, false).unwrap();

        let mut parent = consensus.new_state(None, &db, false).unwrap();
        let child = parent.next_state(10, &mut accounts).unwrap();
        let expected = child.root();

        parent.replay(child.as_ref()).unwrap();
        assert_eq!(parent.root(), expected);
    }
}
