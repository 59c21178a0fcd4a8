use crate::core::errors::StateError;
use crate::types::hash::Hash;
use chainstate_derive::BinaryCodec;

/// Account identity. Addresses share the hash type: user addresses are
/// key-derived hashes, contract addresses are derived from the creating
/// transaction.
pub type Address = Hash;

/// Discriminates externally-owned accounts from contract accounts.
#[derive(BinaryCodec, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccountKind {
    /// Externally-owned account controlled by a key pair.
    User,
    /// Account created by and bound to a deployed contract.
    Contract,
}

/// Canonical representation of account state persisted in the accounts trie.
///
/// All fields are encoded deterministically so the serialized record can be
/// hashed and compared across nodes.
#[derive(BinaryCodec, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    /// Address this account lives under.
    address: Address,
    /// Spendable balance denominated in the native currency.
    balance: u128,
    /// Monotonic counter of successful transactions from this account.
    nonce: u64,
    /// User or contract.
    kind: AccountKind,
    /// Hash of the deployed contract bytecode, or `Hash::zero()` for users.
    code_hash: Hash,
    /// Root hash of the contract storage trie; zero for accounts without storage.
    storage_root: Hash,
    /// Hash of the transaction that created this contract; zero for users.
    birth_place: Hash,
}

impl Account {
    pub const EMPTY_CODE_HASH: Hash = Hash::zero();
    pub const EMPTY_STORAGE_ROOT: Hash = Hash::zero();

    /// Creates a fresh externally-owned account with zero balance and nonce.
    pub fn new_user(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
            kind: AccountKind::User,
            code_hash: Self::EMPTY_CODE_HASH,
            storage_root: Self::EMPTY_STORAGE_ROOT,
            birth_place: Hash::zero(),
        }
    }

    /// Creates a fresh contract account born from the given transaction.
    ///
    /// The address is derived deterministically from `(owner, birth_place)`,
    /// so every node materializes the same contract address.
    pub fn new_contract(owner: Address, birth_place: Hash) -> Self {
        Self {
            address: Self::derive_contract_address(owner, birth_place),
            balance: 0,
            nonce: 0,
            kind: AccountKind::Contract,
            code_hash: Self::EMPTY_CODE_HASH,
            storage_root: Self::EMPTY_STORAGE_ROOT,
            birth_place,
        }
    }

    /// Computes the deterministic address of a contract created by `owner`
    /// in transaction `birth_place`.
    pub fn derive_contract_address(owner: Address, birth_place: Hash) -> Address {
        Hash::sha3()
            .chain(b"CONTRACT")
            .chain(owner.as_slice())
            .chain(birth_place.as_slice())
            .finalize()
    }

    /// Returns the account's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the account's current balance.
    pub fn balance(&self) -> u128 {
        self.balance
    }

    /// Returns the account's current nonce.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// Returns whether this is a user or a contract account.
    pub fn kind(&self) -> AccountKind {
        self.kind
    }

    /// Returns true if this account is a contract account.
    pub fn is_contract(&self) -> bool {
        self.kind == AccountKind::Contract
    }

    /// Returns the hash of the deployed contract bytecode.
    pub fn code_hash(&self) -> Hash {
        self.code_hash
    }

    /// Returns the root of the contract storage trie.
    pub fn storage_root(&self) -> Hash {
        self.storage_root
    }

    /// Returns the hash of the transaction that created this contract.
    pub fn birth_place(&self) -> Hash {
        self.birth_place
    }

    /// Credits the balance, failing on overflow.
    pub fn add_balance(&mut self, amount: u128) -> Result<(), StateError> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or(StateError::BalanceOverflow {
                current: self.balance,
                increment: amount,
            })?;
        Ok(())
    }

    /// Debits the balance, failing when funds are insufficient.
    pub fn sub_balance(&mut self, amount: u128) -> Result<(), StateError> {
        self.balance = self
            .balance
            .checked_sub(amount)
            .ok_or(StateError::InsufficientBalance {
                actual: self.balance,
                expected: amount,
            })?;
        Ok(())
    }

    /// Advances the transaction counter.
    pub fn increment_nonce(&mut self) {
        self.nonce += 1;
    }

    /// Records the hash of the contract's deployed bytecode.
    pub fn set_code_hash(&mut self, code_hash: Hash) {
        self.code_hash = code_hash;
    }

    /// Records the root of the contract's storage trie.
    pub fn set_storage_root(&mut self, storage_root: Hash) {
        self.storage_root = storage_root;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::{Decode, Encode};
    use crate::utils::test_utils::utils::random_hash;

    #[test]
    fn new_user_starts_empty() {
        let addr = random_hash();
        let account = Account::new_user(addr);

        assert_eq!(account.address(), addr);
        assert_eq!(account.balance(), 0);
        assert_eq!(account.nonce(), 0);
        assert!(!account.is_contract());
        assert_eq!(account.code_hash(), Account::EMPTY_CODE_HASH);
    }

    #[test]
    fn contract_address_is_deterministic() {
        let owner = random_hash();
        let birth = random_hash();

        let a = Account::new_contract(owner, birth);
        let b = Account::new_contract(owner, birth);
        assert_eq!(a.address(), b.address());
        assert!(a.is_contract());
        assert_eq!(a.birth_place(), birth);
    }

    #[test]
    fn contract_address_depends_on_both_inputs() {
        let owner = random_hash();
        let birth = random_hash();

        let base = Account::derive_contract_address(owner, birth);
        assert_ne!(base, Account::derive_contract_address(owner, random_hash()));
        assert_ne!(base, Account::derive_contract_address(random_hash(), birth));
    }

    #[test]
    fn add_balance_accumulates() {
        let mut account = Account::new_user(random_hash());
        account.add_balance(100).unwrap();
        account.add_balance(50).unwrap();
        assert_eq!(account.balance(), 150);
    }

    #[test]
    fn add_balance_overflow_fails() {
        let mut account = Account::new_user(random_hash());
        account.add_balance(u128::MAX).unwrap();

        let err = account.add_balance(1).unwrap_err();
        assert!(matches!(err, StateError::BalanceOverflow { .. }));
        assert_eq!(account.balance(), u128::MAX);
    }

    #[test]
    fn sub_balance_checks_funds() {
        let mut account = Account::new_user(random_hash());
        account.add_balance(10).unwrap();

        account.sub_balance(4).unwrap();
        assert_eq!(account.balance(), 6);

        let err = account.sub_balance(7).unwrap_err();
        assert!(matches!(err, StateError::InsufficientBalance { .. }));
        assert_eq!(account.balance(), 6);
    }

    #[test]
    fn increment_nonce_counts_up() {
        let mut account = Account::new_user(random_hash());
        account.increment_nonce();
        account.increment_nonce();
        assert_eq!(account.nonce(), 2);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut account = Account::new_user(random_hash());
        account.add_balance(123_456_789).unwrap();
        account.increment_nonce();

        let encoded = account.to_bytes();
        let decoded = Account::from_bytes(&encoded).expect("decode");
        assert_eq!(decoded, account);
    }
}
