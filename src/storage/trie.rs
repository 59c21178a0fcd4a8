//! Merkle radix trie over an MVCC overlay.
//!
//! Keys are split into 4-bit nibbles; nodes are content-addressed (node key =
//! SHA3-256 of the serialized node) and stored through an
//! [`MvccDb`](crate::storage::mvcc::MvccDb) handle. Content addressing is
//! what makes the root hash a pure function of the trie's key/value content:
//! two nodes inserting the same entries in any order converge on the same
//! root, and identical sub-structures share identical node keys.
//!
//! The trie has no delete operation; state histories only ever grow within a
//! block, and stale roots are simply dropped.

use crate::storage::mvcc::{MvccDb, MvccError, TxId};
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use chainstate_derive::{BinaryCodec, Error};
use std::collections::BTreeMap;

/// Errors raised by trie operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrieError {
    /// No entry exists under the requested key or prefix.
    #[error("key not found")]
    KeyNotFound,
    /// A referenced node is absent from storage.
    #[error("missing trie node {0}")]
    MissingNode(Hash),
    /// A stored node failed to deserialize.
    #[error("corrupt trie node {0}")]
    CorruptNode(Hash),
    /// Overlay failure, surfaced verbatim.
    #[error("{0}")]
    Mvcc(MvccError),
}

impl From<MvccError> for TrieError {
    fn from(value: MvccError) -> Self {
        TrieError::Mvcc(value)
    }
}

/// Serialized trie node.
#[derive(BinaryCodec, Clone, Debug)]
enum Node {
    /// Terminal node carrying the remaining key path.
    Leaf { path: Vec<u8>, value: Vec<u8> },
    /// Shared path segment compressing a single-child chain.
    Extension { path: Vec<u8>, child: Hash },
    /// 16-way fan-out, one slot per nibble, plus the value of the key that
    /// ends exactly here.
    Branch {
        children: [Option<Hash>; 16],
        value: Option<Vec<u8>>,
    },
}

/// Merkle radix trie handle.
///
/// A trie is a root pointer plus an overlay handle; copying a trie onto
/// another overlay ([`copy_to`](Trie::copy_to)) is O(1) because nodes are
/// content-addressed and resolved lazily. A trie created with delta tracking
/// records every `put`, which is what [`replay`](Trie::replay) applies onto
/// another trie.
#[derive(Clone)]
pub struct Trie<I: TxId> {
    root: Option<Hash>,
    db: MvccDb<I>,
    delta: Option<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl<I: TxId> Trie<I> {
    /// Creates an empty trie over the given overlay.
    pub fn new(db: MvccDb<I>, track_delta: bool) -> Self {
        Self {
            root: None,
            db,
            delta: track_delta.then(BTreeMap::new),
        }
    }

    /// Opens an existing trie at `root`, verifying the root node resolves.
    ///
    /// A zero root denotes the empty trie.
    pub fn with_root(root: Hash, db: MvccDb<I>, track_delta: bool) -> Result<Self, TrieError> {
        if root == Hash::zero() {
            return Ok(Self::new(db, track_delta));
        }
        let trie = Self {
            root: Some(root),
            db,
            delta: track_delta.then(BTreeMap::new),
        };
        trie.load_node(root)?;
        Ok(trie)
    }

    /// Re-roots this logical trie onto another overlay.
    pub fn copy_to(&self, db: &MvccDb<I>, track_delta: bool) -> Result<Self, TrieError> {
        match self.root {
            Some(root) => Self::with_root(root, db.clone(), track_delta),
            None => Ok(Self::new(db.clone(), track_delta)),
        }
    }

    /// Returns the root hash; zero for the empty trie.
    pub fn root_hash(&self) -> Hash {
        self.root.unwrap_or_else(Hash::zero)
    }

    /// Retrieves the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, TrieError> {
        let root = self.root.ok_or(TrieError::KeyNotFound)?;
        self.get_at(root, &to_nibbles(key))
    }

    fn get_at(&self, hash: Hash, path: &[u8]) -> Result<Vec<u8>, TrieError> {
        match self.load_node(hash)? {
            Node::Leaf { path: leaf_path, value } => {
                if leaf_path == path {
                    Ok(value)
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Extension { path: ext_path, child } => {
                if path.len() >= ext_path.len() && path[..ext_path.len()] == ext_path[..] {
                    self.get_at(child, &path[ext_path.len()..])
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Branch { children, value } => {
                if path.is_empty() {
                    return value.ok_or(TrieError::KeyNotFound);
                }
                match children[path[0] as usize] {
                    Some(child) => self.get_at(child, &path[1..]),
                    None => Err(TrieError::KeyNotFound),
                }
            }
        }
    }

    /// Stores `value` under `key` and returns the new root hash.
    ///
    /// Writing an identical `(key, value)` pair twice produces identical
    /// nodes, so the operation is idempotent.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>) -> Result<Hash, TrieError> {
        if let Some(delta) = &mut self.delta {
            delta.insert(key.to_vec(), value.clone());
        }
        let path = to_nibbles(key);
        let new_root = self.insert_at(self.root, &path, value)?;
        self.root = Some(new_root);
        Ok(new_root)
    }

    fn insert_at(
        &self,
        node: Option<Hash>,
        path: &[u8],
        value: Vec<u8>,
    ) -> Result<Hash, TrieError> {
        let Some(hash) = node else {
            return self.store_node(&Node::Leaf {
                path: path.to_vec(),
                value,
            });
        };

        match self.load_node(hash)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                if leaf_path == path {
                    return self.store_node(&Node::Leaf {
                        path: leaf_path,
                        value,
                    });
                }

                let split = common_prefix(&leaf_path, path);
                let mut children: [Option<Hash>; 16] = [None; 16];
                let mut branch_value = None;

                let leaf_rest = &leaf_path[split..];
                if leaf_rest.is_empty() {
                    branch_value = Some(leaf_value);
                } else {
                    children[leaf_rest[0] as usize] = Some(self.store_node(&Node::Leaf {
                        path: leaf_rest[1..].to_vec(),
                        value: leaf_value,
                    })?);
                }

                let new_rest = &path[split..];
                if new_rest.is_empty() {
                    branch_value = Some(value);
                } else {
                    children[new_rest[0] as usize] = Some(self.store_node(&Node::Leaf {
                        path: new_rest[1..].to_vec(),
                        value,
                    })?);
                }

                let branch = self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })?;
                self.wrap_extension(&path[..split], branch)
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let split = common_prefix(&ext_path, path);
                if split == ext_path.len() {
                    let new_child = self.insert_at(Some(child), &path[split..], value)?;
                    return self.store_node(&Node::Extension {
                        path: ext_path,
                        child: new_child,
                    });
                }

                let mut children: [Option<Hash>; 16] = [None; 16];
                let mut branch_value = None;

                let ext_rest = &ext_path[split..];
                children[ext_rest[0] as usize] = Some(if ext_rest.len() == 1 {
                    child
                } else {
                    self.store_node(&Node::Extension {
                        path: ext_rest[1..].to_vec(),
                        child,
                    })?
                });

                let new_rest = &path[split..];
                if new_rest.is_empty() {
                    branch_value = Some(value);
                } else {
                    children[new_rest[0] as usize] = Some(self.store_node(&Node::Leaf {
                        path: new_rest[1..].to_vec(),
                        value,
                    })?);
                }

                let branch = self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })?;
                self.wrap_extension(&path[..split], branch)
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return self.store_node(&Node::Branch {
                        children,
                        value: Some(value),
                    });
                }
                let idx = path[0] as usize;
                let new_child = self.insert_at(children[idx], &path[1..], value)?;
                children[idx] = Some(new_child);
                self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        }
    }

    /// Wraps `child` in an extension node when the shared prefix is non-empty.
    fn wrap_extension(&self, prefix: &[u8], child: Hash) -> Result<Hash, TrieError> {
        if prefix.is_empty() {
            return Ok(child);
        }
        self.store_node(&Node::Extension {
            path: prefix.to_vec(),
            child,
        })
    }

    fn store_node(&self, node: &Node) -> Result<Hash, TrieError> {
        let bytes = node.to_bytes();
        let hash = Hash::sha3().chain(&bytes).finalize();
        self.db.put(hash.as_slice(), bytes)?;
        Ok(hash)
    }

    fn load_node(&self, hash: Hash) -> Result<Node, TrieError> {
        let bytes = self.db.get(hash.as_slice()).map_err(|e| {
            if e.is_key_not_found() {
                TrieError::MissingNode(hash)
            } else {
                TrieError::Mvcc(e)
            }
        })?;
        Node::from_bytes(&bytes).map_err(|_| TrieError::CorruptNode(hash))
    }

    /// Iterates all entries whose key starts with `prefix`, in lexicographic
    /// key order. Returns [`TrieError::KeyNotFound`] when nothing matches.
    pub fn iterator(&self, prefix: &[u8]) -> Result<TrieIter<'_, I>, TrieError> {
        let root = self.root.ok_or(TrieError::KeyNotFound)?;
        let stack = self.seek(root, Vec::new(), &to_nibbles(prefix))?;
        Ok(TrieIter { trie: self, stack })
    }

    /// Descends to the subtree covering `prefix` and returns the initial
    /// iterator work stack.
    fn seek(&self, hash: Hash, acc: Vec<u8>, prefix: &[u8]) -> Result<Vec<IterItem>, TrieError> {
        if prefix.is_empty() {
            return Ok(vec![IterItem::Node { hash, path: acc }]);
        }

        match self.load_node(hash)? {
            Node::Leaf { path: leaf_path, value } => {
                if leaf_path.len() >= prefix.len() && leaf_path[..prefix.len()] == *prefix {
                    let mut full = acc;
                    full.extend_from_slice(&leaf_path);
                    Ok(vec![IterItem::Entry { path: full, value }])
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Extension { path: ext_path, child } => {
                if prefix.len() > ext_path.len() {
                    if prefix[..ext_path.len()] == ext_path[..] {
                        let mut next_acc = acc;
                        next_acc.extend_from_slice(&ext_path);
                        self.seek(child, next_acc, &prefix[ext_path.len()..])
                    } else {
                        Err(TrieError::KeyNotFound)
                    }
                } else if ext_path[..prefix.len()] == *prefix {
                    let mut next_acc = acc;
                    next_acc.extend_from_slice(&ext_path);
                    Ok(vec![IterItem::Node {
                        hash: child,
                        path: next_acc,
                    }])
                } else {
                    Err(TrieError::KeyNotFound)
                }
            }
            Node::Branch { children, .. } => match children[prefix[0] as usize] {
                Some(child) => {
                    let mut next_acc = acc;
                    next_acc.push(prefix[0]);
                    self.seek(child, next_acc, &prefix[1..])
                }
                None => Err(TrieError::KeyNotFound),
            },
        }
    }

    /// Applies `other`'s recorded key/value delta onto this trie and returns
    /// the resulting root. A trie without a recorded delta replays nothing.
    pub fn replay(&mut self, other: &Trie<I>) -> Result<Hash, TrieError> {
        if let Some(delta) = &other.delta {
            for (key, value) in delta {
                self.put(key, value.clone())?;
            }
        }
        Ok(self.root_hash())
    }
}

/// Pending work for the depth-first iterator.
enum IterItem {
    Node { hash: Hash, path: Vec<u8> },
    Entry { path: Vec<u8>, value: Vec<u8> },
}

/// Lazy depth-first iterator over a key prefix.
pub struct TrieIter<'a, I: TxId> {
    trie: &'a Trie<I>,
    stack: Vec<IterItem>,
}

impl<I: TxId> Iterator for TrieIter<'_, I> {
    type Item = Result<(Vec<u8>, Vec<u8>), TrieError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(item) = self.stack.pop() {
            let (hash, path) = match item {
                IterItem::Entry { path, value } => {
                    return Some(Ok((from_nibbles(&path), value)));
                }
                IterItem::Node { hash, path } => (hash, path),
            };

            let node = match self.trie.load_node(hash) {
                Ok(node) => node,
                Err(e) => return Some(Err(e)),
            };

            match node {
                Node::Leaf { path: leaf_path, value } => {
                    let mut full = path;
                    full.extend_from_slice(&leaf_path);
                    return Some(Ok((from_nibbles(&full), value)));
                }
                Node::Extension { path: ext_path, child } => {
                    let mut full = path;
                    full.extend_from_slice(&ext_path);
                    self.stack.push(IterItem::Node { hash: child, path: full });
                }
                Node::Branch { children, value } => {
                    // Children pushed in reverse so nibble 0 pops first; the
                    // branch's own (shorter) key sorts before all of them.
                    for idx in (0..children.len()).rev() {
                        if let Some(child) = children[idx] {
                            let mut child_path = path.clone();
                            child_path.push(idx as u8);
                            self.stack.push(IterItem::Node {
                                hash: child,
                                path: child_path,
                            });
                        }
                    }
                    if let Some(value) = value {
                        return Some(Ok((from_nibbles(&path), value)));
                    }
                }
            }
        }
        None
    }
}

/// Splits a key into high/low 4-bit nibbles.
fn to_nibbles(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() * 2);
    for byte in key {
        out.push(byte >> 4);
        out.push(byte & 0x0f);
    }
    out
}

/// Reassembles nibbles into bytes; the inverse of [`to_nibbles`].
fn from_nibbles(nibbles: &[u8]) -> Vec<u8> {
    nibbles
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect()
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_storage::MemoryStorage;
    use std::sync::Arc;

    fn new_trie() -> Trie<&'static str> {
        let db = MvccDb::new(Arc::new(MemoryStorage::new()), true);
        Trie::new(db, false)
    }

    #[test]
    fn empty_trie_has_zero_root() {
        let trie = new_trie();
        assert_eq!(trie.root_hash(), Hash::zero());
        assert_eq!(trie.get(b"anything"), Err(TrieError::KeyNotFound));
    }

    #[test]
    fn put_then_get_roundtrip() {
        let mut trie = new_trie();
        trie.put(b"key", b"value".to_vec()).unwrap();
        assert_eq!(trie.get(b"key").unwrap(), b"value".to_vec());
        assert_eq!(trie.get(b"other"), Err(TrieError::KeyNotFound));
    }

    #[test]
    fn overwrite_replaces_value() {
        let mut trie = new_trie();
        trie.put(b"key", b"v1".to_vec()).unwrap();
        trie.put(b"key", b"v2".to_vec()).unwrap();
        assert_eq!(trie.get(b"key").unwrap(), b"v2".to_vec());
    }

    #[test]
    fn root_is_independent_of_insertion_order() {
        let entries: Vec<(&[u8], &[u8])> = vec![
            (b"abc", b"1"),
            (b"abd", b"2"),
            (b"xyz", b"3"),
            (b"ab", b"4"),
            (b"abcd", b"5"),
        ];

        let mut forward = new_trie();
        for (k, v) in &entries {
            forward.put(k, v.to_vec()).unwrap();
        }

        let mut backward = new_trie();
        for (k, v) in entries.iter().rev() {
            backward.put(k, v.to_vec()).unwrap();
        }

        assert_ne!(forward.root_hash(), Hash::zero());
        assert_eq!(forward.root_hash(), backward.root_hash());
    }

    #[test]
    fn identical_put_is_idempotent() {
        let mut trie = new_trie();
        trie.put(b"key", b"value".to_vec()).unwrap();
        let root = trie.root_hash();
        trie.put(b"key", b"value".to_vec()).unwrap();
        assert_eq!(trie.root_hash(), root);
    }

    #[test]
    fn shared_prefixes_resolve_independently() {
        let mut trie = new_trie();
        trie.put(b"prefix-a", b"1".to_vec()).unwrap();
        trie.put(b"prefix-b", b"2".to_vec()).unwrap();
        trie.put(b"prefix", b"3".to_vec()).unwrap();

        assert_eq!(trie.get(b"prefix-a").unwrap(), b"1".to_vec());
        assert_eq!(trie.get(b"prefix-b").unwrap(), b"2".to_vec());
        assert_eq!(trie.get(b"prefix").unwrap(), b"3".to_vec());
    }

    #[test]
    fn iterator_yields_prefix_matches_in_order() {
        let mut trie = new_trie();
        trie.put(b"tx-03", b"c".to_vec()).unwrap();
        trie.put(b"tx-01", b"a".to_vec()).unwrap();
        trie.put(b"other", b"x".to_vec()).unwrap();
        trie.put(b"tx-02", b"b".to_vec()).unwrap();

        let entries: Vec<_> = trie
            .iterator(b"tx-")
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(
            entries,
            vec![
                (b"tx-01".to_vec(), b"a".to_vec()),
                (b"tx-02".to_vec(), b"b".to_vec()),
                (b"tx-03".to_vec(), b"c".to_vec()),
            ]
        );
    }

    #[test]
    fn iterator_with_empty_prefix_walks_everything() {
        let mut trie = new_trie();
        trie.put(b"b", b"2".to_vec()).unwrap();
        trie.put(b"a", b"1".to_vec()).unwrap();
        trie.put(b"c", b"3".to_vec()).unwrap();

        let keys: Vec<_> = trie
            .iterator(b"")
            .unwrap()
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn iterator_without_matches_is_key_not_found() {
        let mut trie = new_trie();
        trie.put(b"abc", b"1".to_vec()).unwrap();

        assert!(matches!(trie.iterator(b"zzz"), Err(TrieError::KeyNotFound)));
        assert!(matches!(
            new_trie().iterator(b""),
            Err(TrieError::KeyNotFound)
        ));
    }

    #[test]
    fn with_root_verifies_the_root_node() {
        let db: MvccDb<&str> = MvccDb::new(Arc::new(MemoryStorage::new()), true);
        let bogus = Hash::sha3().chain(b"nowhere").finalize();
        assert!(matches!(
            Trie::with_root(bogus, db, false),
            Err(TrieError::MissingNode(_))
        ));
    }

    #[test]
    fn with_zero_root_is_the_empty_trie() {
        let db: MvccDb<&str> = MvccDb::new(Arc::new(MemoryStorage::new()), true);
        let trie = Trie::with_root(Hash::zero(), db, false).unwrap();
        assert_eq!(trie.root_hash(), Hash::zero());
    }

    #[test]
    fn copy_to_preserves_content_over_shared_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage.clone(), true);
        let mut trie = Trie::new(db, false);
        trie.put(b"key", b"value".to_vec()).unwrap();

        let other_db: MvccDb<&str> = MvccDb::new(storage, true);
        let copy = trie.copy_to(&other_db, false).unwrap();
        assert_eq!(copy.root_hash(), trie.root_hash());
        assert_eq!(copy.get(b"key").unwrap(), b"value".to_vec());
    }

    #[test]
    fn replay_applies_the_recorded_delta() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage, true);

        let mut parent = Trie::new(db.clone(), false);
        parent.put(b"existing", b"0".to_vec()).unwrap();

        let mut child = parent.copy_to(&db, true).unwrap();
        child.put(b"from-child", b"1".to_vec()).unwrap();
        child.put(b"existing", b"updated".to_vec()).unwrap();

        parent.replay(&child).unwrap();
        assert_eq!(parent.get(b"from-child").unwrap(), b"1".to_vec());
        assert_eq!(parent.get(b"existing").unwrap(), b"updated".to_vec());
    }

    #[test]
    fn replay_without_delta_is_a_no_op() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage, true);

        let mut parent = Trie::new(db.clone(), false);
        parent.put(b"key", b"value".to_vec()).unwrap();
        let root = parent.root_hash();

        let untracked = parent.copy_to(&db, false).unwrap();
        parent.replay(&untracked).unwrap();
        assert_eq!(parent.root_hash(), root);
    }

    #[test]
    fn nibble_roundtrip() {
        let key = b"\x12\xafzz";
        assert_eq!(from_nibbles(&to_nibbles(key)), key.to_vec());
        assert_eq!(to_nibbles(b"\x12"), vec![0x1, 0x2]);
    }
}
