//! Transactional world state with optimistic per-transaction concurrency.
//!
//! A [`WorldState`] bundles the four chain sub-states (accounts, transactions,
//! events, consensus) behind one transactional boundary. For every pending
//! transaction the block executor derives a [`TxWorldState`] via
//! [`prepare`](WorldState::prepare), executes it on its own thread, then
//! serializes the results back through
//! [`check_and_update`](WorldState::check_and_update): a clean transaction is
//! replayed into the parent, a conflicting one reports the transactions it
//! depends on and leaves the parent untouched.
//!
//! Conflict detection is driven by the *changelog*, an auxiliary MVCC overlay
//! on throwaway in-memory storage that records every key a transaction read
//! or produced. The *storage overlay* is the authoritative transactional view
//! of the backing store, shared by the sub-states so their roots are computed
//! against the transaction's own data.

use crate::core::account::{Account, Address};
use crate::core::account_state::AccountState;
use crate::core::consensus::{Consensus, ConsensusRoot, ConsensusState};
use crate::core::errors::StateError;
use crate::core::event::{event_key, Event};
use crate::storage::memory_storage::MemoryStorage;
use crate::storage::mvcc::{MvccDb, TxId};
use crate::storage::storage_trait::Storage;
use crate::storage::trie::{Trie, TrieError};
use crate::types::encoding::Encode;
use crate::types::hash::Hash;
use crate::warn;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// The four sub-state roots identifying a block boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockRoots {
    pub accounts: Hash,
    pub txs: Hash,
    pub events: Hash,
    pub consensus: ConsensusRoot,
}

/// Builds the conflict-detection changelog: an overlay on fresh in-memory
/// storage where every overlapping key set counts as a conflict.
fn new_changelog<I: TxId>() -> MvccDb<I> {
    let db = MvccDb::new(Arc::new(MemoryStorage::new()), false);
    db.set_strict_global_version_check(true);
    db
}

/// Builds the storage overlay: the authoritative transactional view of the
/// backing store. Trie nodes are content-addressed, so byte-identical writes
/// under one key are compatible.
fn new_storage_overlay<I: TxId>(backing: Arc<dyn Storage>) -> MvccDb<I> {
    MvccDb::new(backing, true)
}

/// The transactional bundle owning the four sub-states and both overlays.
///
/// A bundle is either the block-level parent (no transaction id) or a
/// per-transaction child produced by [`prepare`](States::prepare). Children
/// are moved to their executing thread; the bundle itself is not shared.
pub struct States<I: TxId> {
    acc_state: AccountState<I>,
    txs_trie: Trie<I>,
    events_trie: Trie<I>,
    consensus_state: Box<dyn ConsensusState<I>>,

    consensus: Arc<dyn Consensus<I>>,
    changelog: MvccDb<I>,
    storage: MvccDb<I>,
    backing: Arc<dyn Storage>,
    txid: Option<I>,

    gas_consumed: HashMap<Address, u128>,
    events: BTreeMap<Hash, Vec<Event>>,
    /// Roots captured at `begin`, restored on `roll_back`.
    begin_roots: Option<BlockRoots>,
}

impl<I: TxId> States<I> {
    /// Creates an empty bundle over the given consensus plug-in and backing
    /// storage.
    pub fn new(
        consensus: Arc<dyn Consensus<I>>,
        backing: Arc<dyn Storage>,
    ) -> Result<Self, StateError> {
        let changelog = new_changelog();
        let storage = new_storage_overlay(Arc::clone(&backing));

        let acc_state = AccountState::new(None, &storage, false)?;
        let txs_trie = Trie::new(storage.clone(), false);
        let events_trie = Trie::new(storage.clone(), false);
        let consensus_state = consensus.new_state(None, &storage, false)?;

        Ok(Self {
            acc_state,
            txs_trie,
            events_trie,
            consensus_state,
            consensus,
            changelog,
            storage,
            backing,
            txid: None,
            gas_consumed: HashMap::new(),
            events: BTreeMap::new(),
            begin_roots: None,
        })
    }

    /// Returns the transaction id this bundle was prepared for, if any.
    pub fn tx_id(&self) -> Option<&I> {
        self.txid.as_ref()
    }

    // ── Transactional protocol ────────────────────────────────────────────

    /// Opens the block-level boundary on both overlays.
    ///
    /// A failure on the second overlay closes the first again so no partial
    /// boundary is left open.
    pub fn begin(&mut self) -> Result<(), StateError> {
        let roots = self.current_roots()?;
        self.changelog.begin()?;
        if let Err(e) = self.storage.begin() {
            let _ = self.changelog.rollback();
            return Err(e.into());
        }
        self.begin_roots = Some(roots);
        Ok(())
    }

    /// Commits the block.
    ///
    /// The changelog is rolled back on purpose: it holds conflict-detection
    /// scratch for in-flight transactions, never authoritative state.
    pub fn commit(&mut self) -> Result<(), StateError> {
        self.changelog.rollback()?;
        self.storage.commit()?;
        self.events.clear();
        self.gas_consumed.clear();
        self.acc_state.commit_accounts()?;
        self.begin_roots = None;
        Ok(())
    }

    /// Discards the block, restoring every sub-state to its pre-`begin` root.
    pub fn roll_back(&mut self) -> Result<(), StateError> {
        self.changelog.rollback()?;
        self.storage.rollback()?;
        self.events.clear();
        self.gas_consumed.clear();
        self.acc_state.roll_back_accounts();

        if let Some(roots) = self.begin_roots.take() {
            self.load_accounts_root(roots.accounts)?;
            self.load_txs_root(roots.txs)?;
            self.load_events_root(roots.events)?;
            self.load_consensus_root(&roots.consensus)?;
        }
        Ok(())
    }

    /// Derives a child bundle for `txid`: prepared views of both overlays
    /// plus copies of the four sub-states rooted on the child's view.
    pub fn prepare(&self, txid: I) -> Result<States<I>, StateError> {
        let changelog = self.changelog.prepare(txid.clone())?;
        let storage = match self.storage.prepare(txid.clone()) {
            Ok(storage) => storage,
            Err(e) => {
                let _ = changelog.close();
                return Err(e.into());
            }
        };

        let built: Result<States<I>, StateError> = (|| {
            Ok(States {
                acc_state: self.acc_state.copy_to(&storage, true)?,
                txs_trie: self.txs_trie.copy_to(&storage, true)?,
                events_trie: self.events_trie.copy_to(&storage, true)?,
                consensus_state: self.consensus_state.copy_to(&storage, true)?,
                consensus: Arc::clone(&self.consensus),
                changelog: changelog.clone(),
                storage: storage.clone(),
                backing: Arc::clone(&self.backing),
                txid: Some(txid),
                gas_consumed: HashMap::new(),
                events: BTreeMap::new(),
                begin_roots: None,
            })
        })();

        if built.is_err() {
            let _ = changelog.close();
            let _ = storage.close();
        }
        built
    }

    /// Validates this child bundle and, when clean, publishes its storage
    /// writes. Returns the dependency set from the changelog.
    pub fn check_and_update(&mut self) -> Result<Vec<I>, StateError> {
        self.record_accounts()?;
        let dependencies = self.changelog.check_and_update()?;
        if dependencies.is_empty() {
            // Publication is gated on a clean changelog so a conflicting
            // transaction leaves no trace in the parent's overlay.
            self.storage.check_and_update()?;
        }
        Ok(dependencies)
    }

    /// Re-baselines this child bundle, returning it to the open state.
    pub fn reset(&mut self) -> Result<(), StateError> {
        self.changelog.reset()?;
        self.storage.reset()?;
        Ok(())
    }

    /// Closes this child bundle's overlay views. The bundle must not be
    /// used afterward.
    pub fn close(&mut self) -> Result<(), StateError> {
        self.changelog.close()?;
        self.storage.close()?;
        Ok(())
    }

    /// Serializes every touched account into the changelog so account access
    /// participates in conflict detection.
    fn record_accounts(&mut self) -> Result<(), StateError> {
        for account in self.acc_state.dirty_accounts() {
            self.changelog
                .put(account.address().as_slice(), account.to_bytes())?;
        }
        Ok(())
    }

    // ── Replay (child → parent) ───────────────────────────────────────────

    /// Merges a validated child bundle into this one.
    pub fn replay(&mut self, done: &mut States<I>) -> Result<(), StateError> {
        self.acc_state.replay(&done.acc_state)?;
        self.replay_events(done)?;
        self.txs_trie.replay(&done.txs_trie)?;
        self.consensus_state.replay(done.consensus_state.as_ref())?;

        for (from, gas) in &done.gas_consumed {
            let consumed = self.gas_consumed.entry(*from).or_insert(0);
            *consumed = consumed
                .checked_add(*gas)
                .ok_or(StateError::GasOverflow(*from))?;
        }
        Ok(())
    }

    /// Writes the child's buffered events into this bundle's events trie at
    /// `tx_hash ∥ i64_be(seq)`, `seq` counting from 1 per transaction, then
    /// drains the child's buffer.
    fn replay_events(&mut self, done: &mut States<I>) -> Result<(), StateError> {
        for (tx_hash, events) in &done.events {
            for (idx, event) in events.iter().enumerate() {
                let key = event_key(tx_hash, (idx + 1) as i64);
                self.events_trie.put(&key, event.to_json_bytes()?)?;
            }
        }
        done.events.clear();
        Ok(())
    }

    /// Deep copy: fresh changelog, fresh overlay on the same backing
    /// storage, all sub-states re-rooted, buffers empty.
    pub fn try_clone(&self) -> Result<States<I>, StateError> {
        let changelog = new_changelog();
        let storage = new_storage_overlay(Arc::clone(&self.backing));

        Ok(States {
            acc_state: self.acc_state.copy_to(&storage, false)?,
            txs_trie: self.txs_trie.copy_to(&storage, false)?,
            events_trie: self.events_trie.copy_to(&storage, false)?,
            consensus_state: self.consensus_state.copy_to(&storage, false)?,
            consensus: Arc::clone(&self.consensus),
            changelog,
            storage,
            backing: Arc::clone(&self.backing),
            txid: self.txid.clone(),
            gas_consumed: HashMap::new(),
            events: BTreeMap::new(),
            begin_roots: None,
        })
    }

    // ── Accounts ──────────────────────────────────────────────────────────

    /// Returns the account under `addr`, creating a fresh user account if
    /// none exists.
    pub fn get_or_create_user_account(
        &mut self,
        addr: Address,
    ) -> Result<&mut Account, StateError> {
        self.acc_state.get_or_create_user_account(addr)
    }

    /// Returns the contract account under `addr`.
    pub fn get_contract_account(&mut self, addr: Address) -> Result<&Account, StateError> {
        self.acc_state.get_contract_account(addr)
    }

    /// Creates the contract account derived from `(owner, birth_place)`.
    pub fn create_contract_account(
        &mut self,
        owner: Address,
        birth_place: Hash,
    ) -> Result<Account, StateError> {
        Ok(self
            .acc_state
            .create_contract_account(owner, birth_place)?
            .clone())
    }

    /// Lists every account persisted in the accounts trie.
    pub fn accounts(&self) -> Result<Vec<Account>, StateError> {
        self.acc_state.accounts()
    }

    // ── Transactions ──────────────────────────────────────────────────────

    /// Retrieves transaction bytes; the lookup registers in the changelog.
    pub fn get_tx(&self, tx_hash: &Hash) -> Result<Vec<u8>, StateError> {
        let bytes = self.txs_trie.get(tx_hash.as_slice())?;
        match self.changelog.get(tx_hash.as_slice()) {
            Ok(_) => {}
            Err(e) if e.is_key_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        Ok(bytes)
    }

    /// Stores transaction bytes; the write registers in the changelog.
    pub fn put_tx(&mut self, tx_hash: &Hash, tx_bytes: Vec<u8>) -> Result<(), StateError> {
        self.txs_trie.put(tx_hash.as_slice(), tx_bytes.clone())?;
        self.changelog.put(tx_hash.as_slice(), tx_bytes)?;
        Ok(())
    }

    // ── Events ────────────────────────────────────────────────────────────

    /// Buffers an event emitted by `tx_hash` and registers the write in the
    /// changelog under the key it will later persist at.
    pub fn record_event(&mut self, tx_hash: Hash, event: Event) -> Result<(), StateError> {
        let buffered = self.events.entry(tx_hash).or_default();
        let seq = (buffered.len() + 1) as i64;
        let key = event_key(&tx_hash, seq);
        let bytes = event.to_json_bytes()?;

        buffered.push(event);
        self.changelog.put(&key, bytes)?;
        Ok(())
    }

    /// Reads the committed events of a transaction from the events trie, in
    /// emission order. Never consults the in-memory buffer.
    pub fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, StateError> {
        let iter = match self.events_trie.iterator(tx_hash.as_slice()) {
            Ok(iter) => iter,
            Err(TrieError::KeyNotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for entry in iter {
            let (key, bytes) = entry?;
            events.push(Event::from_json_bytes(&bytes)?);
            match self.changelog.get(&key) {
                Ok(_) => {}
                Err(e) if e.is_key_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(events)
    }

    /// Reads the events a transaction emitted so far in this bundle, from
    /// the in-memory buffer only.
    pub fn fetch_cache_events(&self, tx_hash: &Hash) -> Vec<Event> {
        self.events.get(tx_hash).cloned().unwrap_or_default()
    }

    // ── Gas ───────────────────────────────────────────────────────────────

    /// Adds `gas` to the payer's ledger entry; overflow is fatal.
    pub fn record_gas(&mut self, from: Address, gas: u128) -> Result<(), StateError> {
        let consumed = self.gas_consumed.entry(from).or_insert(0);
        *consumed = consumed
            .checked_add(gas)
            .ok_or(StateError::GasOverflow(from))?;
        Ok(())
    }

    /// Drains and returns the gas ledger; a second call returns an empty map.
    pub fn get_gas(&mut self) -> HashMap<Address, u128> {
        std::mem::take(&mut self.gas_consumed)
    }

    // ── Roots ─────────────────────────────────────────────────────────────

    /// Returns the accounts root over every touched account.
    pub fn accounts_root(&mut self) -> Result<Hash, StateError> {
        self.acc_state.root_hash()
    }

    /// Returns the transactions trie root.
    pub fn txs_root(&self) -> Hash {
        self.txs_trie.root_hash()
    }

    /// Returns the events trie root.
    pub fn events_root(&self) -> Hash {
        self.events_trie.root_hash()
    }

    /// Returns the consensus-state root.
    pub fn consensus_root(&self) -> ConsensusRoot {
        self.consensus_state.root()
    }

    fn current_roots(&mut self) -> Result<BlockRoots, StateError> {
        Ok(BlockRoots {
            accounts: self.accounts_root()?,
            txs: self.txs_root(),
            events: self.events_root(),
            consensus: self.consensus_root(),
        })
    }

    // ── Sub-state loading ─────────────────────────────────────────────────

    /// Replaces the account state with one rooted at `root`.
    pub fn load_accounts_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.acc_state = AccountState::new(Some(root), &self.storage, false)?;
        Ok(())
    }

    /// Replaces the transactions trie with one rooted at `root`.
    pub fn load_txs_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.txs_trie = Trie::with_root(root, self.storage.clone(), false)?;
        Ok(())
    }

    /// Replaces the events trie with one rooted at `root`.
    pub fn load_events_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.events_trie = Trie::with_root(root, self.storage.clone(), false)?;
        Ok(())
    }

    /// Replaces the consensus state with one resumed from `root`.
    pub fn load_consensus_root(&mut self, root: &ConsensusRoot) -> Result<(), StateError> {
        self.consensus_state = self.consensus.new_state(Some(root), &self.storage, false)?;
        Ok(())
    }

    // ── Consensus ─────────────────────────────────────────────────────────

    /// Produces the consensus state `elapsed_secs` later. The caller decides
    /// whether to install it via [`set_consensus_state`](States::set_consensus_state).
    pub fn next_consensus_state(
        &mut self,
        elapsed_secs: i64,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError> {
        self.consensus_state
            .next_state(elapsed_secs, &mut self.acc_state)
    }

    /// Installs a consensus state produced by
    /// [`next_consensus_state`](States::next_consensus_state).
    pub fn set_consensus_state(&mut self, state: Box<dyn ConsensusState<I>>) {
        self.consensus_state = state;
    }

    /// Returns the current validator set.
    pub fn dynasty(&self) -> Result<Vec<Hash>, StateError> {
        self.consensus_state.dynasty()
    }

    /// Returns the dynasty trie root.
    pub fn dynasty_root(&self) -> Hash {
        self.consensus_state.dynasty_root()
    }
}

/// Block-level world state: the parent bundle plus the registry of live
/// per-transaction children.
///
/// The registry is the only concurrent structure in the engine; children are
/// driven by their own threads while the parent thread serializes `prepare`,
/// `check_and_update` and the block boundary.
pub struct WorldState<I: TxId> {
    states: States<I>,
    live_children: DashMap<I, Arc<TxWorldState<I>>>,
}

impl<I: TxId> WorldState<I> {
    /// Creates an empty world state.
    pub fn new(
        consensus: Arc<dyn Consensus<I>>,
        storage: Arc<dyn Storage>,
    ) -> Result<Self, StateError> {
        Ok(Self {
            states: States::new(consensus, storage)?,
            live_children: DashMap::new(),
        })
    }

    /// Deep copy with no live children.
    pub fn try_clone(&self) -> Result<WorldState<I>, StateError> {
        Ok(WorldState {
            states: self.states.try_clone()?,
            live_children: DashMap::new(),
        })
    }

    /// Opens the block boundary.
    pub fn begin(&mut self) -> Result<(), StateError> {
        self.states.begin()
    }

    /// Commits the block and invalidates every live child.
    pub fn commit(&mut self) -> Result<(), StateError> {
        let result = self.states.commit();
        if let Err(e) = &result {
            warn!("block commit failed, disposing world state: {}", e);
        }
        self.dispose();
        result
    }

    /// Discards the block and invalidates every live child.
    pub fn roll_back(&mut self) -> Result<(), StateError> {
        let result = self.states.roll_back();
        if let Err(e) = &result {
            warn!("block rollback failed, disposing world state: {}", e);
        }
        self.dispose();
        result
    }

    /// Derives a transaction world state for `txid`.
    ///
    /// The registry insert is check-and-set: a second `prepare` with a live
    /// id fails with [`StateError::CannotPrepareTxStateTwice`].
    pub fn prepare(&self, txid: I) -> Result<Arc<TxWorldState<I>>, StateError> {
        match self.live_children.entry(txid.clone()) {
            Entry::Occupied(_) => Err(StateError::CannotPrepareTxStateTwice),
            Entry::Vacant(slot) => {
                let child_states = self.states.prepare(txid.clone())?;
                let child = Arc::new(TxWorldState {
                    txid,
                    states: Mutex::new(child_states),
                });
                slot.insert(Arc::clone(&child));
                Ok(child)
            }
        }
    }

    /// Validates the child for `txid` and, when its dependency set is empty,
    /// replays it into the parent. Returns the dependency set either way.
    pub fn check_and_update(&mut self, txid: &I) -> Result<Vec<I>, StateError> {
        let child = self
            .live_children
            .get(txid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StateError::CannotUpdateTxStateBeforePrepare)?;

        let mut child_states = child.states.lock().unwrap();
        let dependencies = child_states.check_and_update()?;
        if dependencies.is_empty() {
            self.states.replay(&mut child_states)?;
        }
        Ok(dependencies)
    }

    /// Returns the child for `txid` to the open state.
    pub fn reset(&self, txid: &I) -> Result<(), StateError> {
        let child = self
            .live_children
            .get(txid)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(StateError::CannotUpdateTxStateBeforePrepare)?;
        child.states.lock().unwrap().reset()
    }

    /// Terminates the child for `txid` and removes it from the registry.
    /// A second close of the same id fails like any other op on an unknown id.
    pub fn close(&self, txid: &I) -> Result<(), StateError> {
        let (_, child) = self
            .live_children
            .remove(txid)
            .ok_or(StateError::CannotUpdateTxStateBeforePrepare)?;
        child.states.lock().unwrap().close()
    }

    /// Closes and forgets every live child.
    fn dispose(&self) {
        for entry in self.live_children.iter() {
            if let Ok(mut states) = entry.value().states.lock() {
                let _ = states.close();
            }
        }
        self.live_children.clear();
    }

    // ── Parent state surface ──────────────────────────────────────────────

    pub fn get_or_create_user_account(
        &mut self,
        addr: Address,
    ) -> Result<&mut Account, StateError> {
        self.states.get_or_create_user_account(addr)
    }

    pub fn get_contract_account(&mut self, addr: Address) -> Result<&Account, StateError> {
        self.states.get_contract_account(addr)
    }

    pub fn create_contract_account(
        &mut self,
        owner: Address,
        birth_place: Hash,
    ) -> Result<Account, StateError> {
        self.states.create_contract_account(owner, birth_place)
    }

    pub fn accounts(&self) -> Result<Vec<Account>, StateError> {
        self.states.accounts()
    }

    pub fn get_tx(&self, tx_hash: &Hash) -> Result<Vec<u8>, StateError> {
        self.states.get_tx(tx_hash)
    }

    pub fn put_tx(&mut self, tx_hash: &Hash, tx_bytes: Vec<u8>) -> Result<(), StateError> {
        self.states.put_tx(tx_hash, tx_bytes)
    }

    pub fn record_event(&mut self, tx_hash: Hash, event: Event) -> Result<(), StateError> {
        self.states.record_event(tx_hash, event)
    }

    pub fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, StateError> {
        self.states.fetch_events(tx_hash)
    }

    pub fn fetch_cache_events(&self, tx_hash: &Hash) -> Vec<Event> {
        self.states.fetch_cache_events(tx_hash)
    }

    pub fn record_gas(&mut self, from: Address, gas: u128) -> Result<(), StateError> {
        self.states.record_gas(from, gas)
    }

    pub fn get_gas(&mut self) -> HashMap<Address, u128> {
        self.states.get_gas()
    }

    pub fn accounts_root(&mut self) -> Result<Hash, StateError> {
        self.states.accounts_root()
    }

    pub fn txs_root(&self) -> Hash {
        self.states.txs_root()
    }

    pub fn events_root(&self) -> Hash {
        self.states.events_root()
    }

    pub fn consensus_root(&self) -> ConsensusRoot {
        self.states.consensus_root()
    }

    pub fn load_accounts_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.states.load_accounts_root(root)
    }

    pub fn load_txs_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.states.load_txs_root(root)
    }

    pub fn load_events_root(&mut self, root: Hash) -> Result<(), StateError> {
        self.states.load_events_root(root)
    }

    pub fn load_consensus_root(&mut self, root: &ConsensusRoot) -> Result<(), StateError> {
        self.states.load_consensus_root(root)
    }

    pub fn next_consensus_state(
        &mut self,
        elapsed_secs: i64,
    ) -> Result<Box<dyn ConsensusState<I>>, StateError> {
        self.states.next_consensus_state(elapsed_secs)
    }

    pub fn set_consensus_state(&mut self, state: Box<dyn ConsensusState<I>>) {
        self.states.set_consensus_state(state)
    }

    pub fn dynasty(&self) -> Result<Vec<Hash>, StateError> {
        self.states.dynasty()
    }

    pub fn dynasty_root(&self) -> Hash {
        self.states.dynasty_root()
    }
}

/// Per-transaction world state handed to the executing thread.
///
/// The bundle sits behind a mutex: exactly one child thread drives the
/// transaction, while the parent touches the same bundle only through the
/// lifecycle operations (`check_and_update`, `reset`, `close`).
pub struct TxWorldState<I: TxId> {
    txid: I,
    states: Mutex<States<I>>,
}

impl<I: TxId> TxWorldState<I> {
    /// Returns the transaction id this state was prepared for.
    pub fn tx_id(&self) -> &I {
        &self.txid
    }

    /// Returns a snapshot of the account under `addr`, creating a fresh user
    /// account if none exists.
    pub fn user_account(&self, addr: Address) -> Result<Account, StateError> {
        let mut states = self.states.lock().unwrap();
        Ok(states.get_or_create_user_account(addr)?.clone())
    }

    /// Runs `f` against the account under `addr`, creating a fresh user
    /// account if none exists.
    pub fn update_user_account<R>(
        &self,
        addr: Address,
        f: impl FnOnce(&mut Account) -> Result<R, StateError>,
    ) -> Result<R, StateError> {
        let mut states = self.states.lock().unwrap();
        f(states.get_or_create_user_account(addr)?)
    }

    /// Returns a snapshot of the contract account under `addr`.
    pub fn contract_account(&self, addr: Address) -> Result<Account, StateError> {
        let mut states = self.states.lock().unwrap();
        Ok(states.get_contract_account(addr)?.clone())
    }

    /// Creates the contract account derived from `(owner, birth_place)`.
    pub fn create_contract_account(
        &self,
        owner: Address,
        birth_place: Hash,
    ) -> Result<Account, StateError> {
        self.states
            .lock()
            .unwrap()
            .create_contract_account(owner, birth_place)
    }

    pub fn get_tx(&self, tx_hash: &Hash) -> Result<Vec<u8>, StateError> {
        self.states.lock().unwrap().get_tx(tx_hash)
    }

    pub fn put_tx(&self, tx_hash: &Hash, tx_bytes: Vec<u8>) -> Result<(), StateError> {
        self.states.lock().unwrap().put_tx(tx_hash, tx_bytes)
    }

    pub fn record_event(&self, tx_hash: Hash, event: Event) -> Result<(), StateError> {
        self.states.lock().unwrap().record_event(tx_hash, event)
    }

    pub fn fetch_events(&self, tx_hash: &Hash) -> Result<Vec<Event>, StateError> {
        self.states.lock().unwrap().fetch_events(tx_hash)
    }

    pub fn fetch_cache_events(&self, tx_hash: &Hash) -> Vec<Event> {
        self.states.lock().unwrap().fetch_cache_events(tx_hash)
    }

    pub fn record_gas(&self, from: Address, gas: u128) -> Result<(), StateError> {
        self.states.lock().unwrap().record_gas(from, gas)
    }

    pub fn get_gas(&self) -> HashMap<Address, u128> {
        self.states.lock().unwrap().get_gas()
    }

    pub fn accounts_root(&self) -> Result<Hash, StateError> {
        self.states.lock().unwrap().accounts_root()
    }

    pub fn txs_root(&self) -> Hash {
        self.states.lock().unwrap().txs_root()
    }

    pub fn events_root(&self) -> Hash {
        self.states.lock().unwrap().events_root()
    }

    pub fn consensus_root(&self) -> ConsensusRoot {
        self.states.lock().unwrap().consensus_root()
    }

    pub fn dynasty(&self) -> Result<Vec<Hash>, StateError> {
        self.states.lock().unwrap().dynasty()
    }

    pub fn dynasty_root(&self) -> Hash {
        self.states.lock().unwrap().dynasty_root()
    }

    /// Advances the consensus state by `elapsed_secs`, installs the result
    /// and returns its root.
    pub fn advance_consensus_state(&self, elapsed_secs: i64) -> Result<ConsensusRoot, StateError> {
        let mut states = self.states.lock().unwrap();
        let next = states.next_consensus_state(elapsed_secs)?;
        let root = next.root();
        states.set_consensus_state(next);
        Ok(root)
    }
}

impl<I: TxId> Drop for TxWorldState<I> {
    fn drop(&mut self) {
        // Overlay views must not outlive the bundle; a child closed through
        // the parent registry just closes again harmlessly.
        if let Ok(mut states) = self.states.lock() {
            let _ = states.close();
        }
    }
}
