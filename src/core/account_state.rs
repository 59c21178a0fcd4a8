//! Dirty-tracking account mapping over the accounts trie.

use crate::core::account::{Account, Address};
use crate::core::errors::StateError;
use crate::storage::mvcc::{MvccDb, TxId};
use crate::storage::trie::{Trie, TrieError};
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use std::collections::BTreeMap;

/// Mapping from address to account, backed by a [`Trie`].
///
/// Every account touched since the last commit/rollback boundary is held in
/// the in-memory dirty set - reads included, because a transaction's account
/// *reads* participate in conflict detection just like its writes. The dirty
/// set is a `BTreeMap` keyed by address, which makes
/// [`dirty_accounts`](AccountState::dirty_accounts) deterministic without a
/// separate sort.
pub struct AccountState<I: TxId> {
    trie: Trie<I>,
    dirty: BTreeMap<Address, Account>,
}

impl<I: TxId> AccountState<I> {
    /// Creates an account state over the given overlay, optionally rooted at
    /// a previously persisted accounts root.
    pub fn new(root: Option<Hash>, db: &MvccDb<I>, track_delta: bool) -> Result<Self, StateError> {
        let trie = match root {
            Some(root) => Trie::with_root(root, db.clone(), track_delta)?,
            None => Trie::new(db.clone(), track_delta),
        };
        Ok(Self {
            trie,
            dirty: BTreeMap::new(),
        })
    }

    /// Returns the account under `addr`, synthesizing a fresh user account
    /// if none exists. The account enters the dirty set either way.
    pub fn get_or_create_user_account(
        &mut self,
        addr: Address,
    ) -> Result<&mut Account, StateError> {
        if !self.dirty.contains_key(&addr) {
            let account = match self.load(addr)? {
                Some(account) => account,
                None => Account::new_user(addr),
            };
            self.dirty.insert(addr, account);
        }
        Ok(self.dirty.get_mut(&addr).unwrap())
    }

    /// Returns the contract account under `addr`.
    ///
    /// Fails with [`StateError::AccountNotFound`] when absent and
    /// [`StateError::NotAContract`] when the account is user-owned.
    pub fn get_contract_account(&mut self, addr: Address) -> Result<&Account, StateError> {
        if !self.dirty.contains_key(&addr) {
            let account = self.load(addr)?.ok_or(StateError::AccountNotFound(addr))?;
            self.dirty.insert(addr, account);
        }
        let account = self.dirty.get(&addr).unwrap();
        if !account.is_contract() {
            return Err(StateError::NotAContract(addr));
        }
        Ok(account)
    }

    /// Creates the contract account derived from `(owner, birth_place)`.
    ///
    /// Fails with [`StateError::ContractAlreadyExists`] if the derived
    /// address is already taken.
    pub fn create_contract_account(
        &mut self,
        owner: Address,
        birth_place: Hash,
    ) -> Result<&Account, StateError> {
        let addr = Account::derive_contract_address(owner, birth_place);
        if self.dirty.contains_key(&addr) || self.load(addr)?.is_some() {
            return Err(StateError::ContractAlreadyExists(addr));
        }
        self.dirty.insert(addr, Account::new_contract(owner, birth_place));
        Ok(self.dirty.get(&addr).unwrap())
    }

    /// Returns every account touched since the last boundary, sorted by
    /// address.
    pub fn dirty_accounts(&self) -> Vec<Account> {
        self.dirty.values().cloned().collect()
    }

    /// Flushes the dirty set into the trie and clears it.
    pub fn commit_accounts(&mut self) -> Result<(), StateError> {
        self.flush()?;
        self.dirty.clear();
        Ok(())
    }

    /// Discards the dirty set without touching the trie.
    pub fn roll_back_accounts(&mut self) {
        self.dirty.clear();
    }

    /// Returns the accounts root, flushing dirty accounts into the trie
    /// first so the root reflects every touched account. The dirty set stays
    /// populated until the next commit or rollback boundary.
    pub fn root_hash(&mut self) -> Result<Hash, StateError> {
        self.flush()?;
        Ok(self.trie.root_hash())
    }

    /// Decodes every account stored in the trie.
    pub fn accounts(&self) -> Result<Vec<Account>, StateError> {
        let iter = match self.trie.iterator(&[]) {
            Ok(iter) => iter,
            Err(TrieError::KeyNotFound) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut accounts = Vec::new();
        for entry in iter {
            let (_, bytes) = entry?;
            accounts.push(Account::from_bytes(&bytes)?);
        }
        Ok(accounts)
    }

    /// Re-roots this account state onto another overlay, carrying the dirty
    /// set along so uncommitted accounts stay visible to the copy.
    pub fn copy_to(&self, db: &MvccDb<I>, track_delta: bool) -> Result<Self, StateError> {
        Ok(Self {
            trie: self.trie.copy_to(db, track_delta)?,
            dirty: self.dirty.clone(),
        })
    }

    /// Merges `other`'s touched accounts into this state's dirty set and
    /// applies its trie delta.
    pub fn replay(&mut self, other: &AccountState<I>) -> Result<(), StateError> {
        for (addr, account) in &other.dirty {
            self.dirty.insert(*addr, account.clone());
        }
        self.trie.replay(&other.trie)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StateError> {
        for (addr, account) in &self.dirty {
            self.trie.put(addr.as_slice(), account.to_bytes())?;
        }
        Ok(())
    }

    fn load(&self, addr: Address) -> Result<Option<Account>, StateError> {
        match self.trie.get(addr.as_slice()) {
            Ok(bytes) => Ok(Some(Account::from_bytes(&bytes)?)),
            Err(TrieError::KeyNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_storage::MemoryStorage;
    use crate::utils::test_utils::utils::random_hash;
    use std::sync::Arc;

    fn new_state() -> AccountState<&'static str> {
        let db = MvccDb::new(Arc::new(MemoryStorage::new()), true);
        AccountState::new(None, &db, false).unwrap()
    }

    #[test]
    fn get_or_create_synthesizes_a_user_account() {
        let mut state = new_state();
        let addr = random_hash();

        let account = state.get_or_create_user_account(addr).unwrap();
        assert_eq!(account.balance(), 0);
        assert_eq!(account.nonce(), 0);
        assert!(!account.is_contract());
    }

    #[test]
    fn mutations_survive_within_the_dirty_set() {
        let mut state = new_state();
        let addr = random_hash();

        state
            .get_or_create_user_account(addr)
            .unwrap()
            .add_balance(100)
            .unwrap();

        let account = state.get_or_create_user_account(addr).unwrap();
        assert_eq!(account.balance(), 100);
    }

    #[test]
    fn reads_enter_the_dirty_set() {
        let mut state = new_state();
        let addr = random_hash();

        state.get_or_create_user_account(addr).unwrap();
        let dirty = state.dirty_accounts();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].address(), addr);
    }

    #[test]
    fn dirty_accounts_sorted_by_address() {
        let mut state = new_state();
        let mut addrs: Vec<Address> = (0..4).map(|_| random_hash()).collect();

        for addr in addrs.iter().rev() {
            state.get_or_create_user_account(*addr).unwrap();
        }

        addrs.sort();
        let dirty: Vec<Address> = state.dirty_accounts().iter().map(|a| a.address()).collect();
        assert_eq!(dirty, addrs);
    }

    #[test]
    fn commit_persists_and_clears_dirty() {
        let mut state = new_state();
        let addr = random_hash();

        state
            .get_or_create_user_account(addr)
            .unwrap()
            .add_balance(42)
            .unwrap();
        state.commit_accounts().unwrap();
        assert!(state.dirty_accounts().is_empty());

        let account = state.get_or_create_user_account(addr).unwrap();
        assert_eq!(account.balance(), 42);
    }

    #[test]
    fn rollback_discards_uncommitted_mutations() {
        let mut state = new_state();
        let addr = random_hash();

        state
            .get_or_create_user_account(addr)
            .unwrap()
            .add_balance(42)
            .unwrap();
        state.roll_back_accounts();

        let account = state.get_or_create_user_account(addr).unwrap();
        assert_eq!(account.balance(), 0);
    }

    #[test]
    fn root_reflects_committed_account_set() {
        let mut a = new_state();
        let mut b = new_state();
        let addr = random_hash();

        a.get_or_create_user_account(addr)
            .unwrap()
            .add_balance(7)
            .unwrap();
        a.commit_accounts().unwrap();

        b.get_or_create_user_account(addr)
            .unwrap()
            .add_balance(7)
            .unwrap();
        b.commit_accounts().unwrap();

        assert_ne!(a.root_hash().unwrap(), Hash::zero());
        assert_eq!(a.root_hash().unwrap(), b.root_hash().unwrap());
    }

    #[test]
    fn contract_lookup_checks_kind() {
        let mut state = new_state();
        let user_addr = random_hash();
        state.get_or_create_user_account(user_addr).unwrap();

        let err = state.get_contract_account(user_addr).unwrap_err();
        assert!(matches!(err, StateError::NotAContract(_)));

        let missing = state.get_contract_account(random_hash()).unwrap_err();
        assert!(matches!(missing, StateError::AccountNotFound(_)));
    }

    #[test]
    fn create_contract_account_rejects_duplicates() {
        let mut state = new_state();
        let owner = random_hash();
        let birth = random_hash();

        let addr = state.create_contract_account(owner, birth).unwrap().address();
        let err = state.create_contract_account(owner, birth).unwrap_err();
        assert_eq!(err, StateError::ContractAlreadyExists(addr));
    }

    #[test]
    fn created_contract_is_retrievable() {
        let mut state = new_state();
        let owner = random_hash();
        let birth = random_hash();

        let addr = state.create_contract_account(owner, birth).unwrap().address();
        let account = state.get_contract_account(addr).unwrap();
        assert!(account.is_contract());
        assert_eq!(account.birth_place(), birth);
    }

    #[test]
    fn accounts_lists_committed_records() {
        let mut state = new_state();
        let a1 = random_hash();
        let a2 = random_hash();

        state.get_or_create_user_account(a1).unwrap();
        state.get_or_create_user_account(a2).unwrap();
        state.commit_accounts().unwrap();

        let all = state.accounts().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn replay_merges_dirty_accounts() {
        let db = MvccDb::new(Arc::new(MemoryStorage::new()), true);
        let mut parent: AccountState<&str> = AccountState::new(None, &db, false).unwrap();
        let mut child = parent.copy_to(&db, true).unwrap();

        let addr = random_hash();
        child
            .get_or_create_user_account(addr)
            .unwrap()
            .add_balance(25)
            .unwrap();

        parent.replay(&child).unwrap();
        let account = parent.get_or_create_user_account(addr).unwrap();
        assert_eq!(account.balance(), 25);
    }
}
