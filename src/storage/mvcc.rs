//! Versioned overlay with optimistic per-transaction conflict detection.
//!
//! An [`MvccDb`] wraps a [`Storage`] backend with a block-level write batch
//! and any number of per-transaction views derived from it via
//! [`prepare`](MvccDb::prepare). Each view buffers its own writes and records
//! every key it touched; [`check_and_update`](MvccDb::check_and_update)
//! validates the view against the keys published since the view was prepared
//! and either publishes the view's writes into the batch or returns the
//! identities of the transactions it conflicts with.
//!
//! Two overlays with different tunings are used by the state layer:
//!
//! - the *changelog* (fresh in-memory backend, strict global version check):
//!   every key a transaction read or wrote participates in conflict
//!   detection, and overlapping key sets always conflict;
//! - the *storage overlay* (real backend, same-key compatibility): trie
//!   nodes are content-addressed, so two transactions writing identical
//!   bytes under the same key are not in conflict.

use crate::storage::storage_trait::{Storage, StorageError};
use chainstate_derive::Error;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash as StdHash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque per-transaction identity, chosen by the caller (typically the
/// transaction hash). Equality and hashing are the only required
/// operations; the engine never inspects the value.
pub trait TxId: Clone + Eq + StdHash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + StdHash + Debug + Send + Sync + 'static> TxId for T {}

/// Errors raised by the MVCC overlay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MvccError {
    /// `begin` was called while a batch is already open.
    #[error("a write batch is already open")]
    NestedBatch,
    /// A batch-scoped operation was called with no open batch.
    #[error("no write batch is open")]
    NoActiveBatch,
    /// `prepare` was called with a transaction id that already has a view.
    #[error("a view for this transaction id already exists")]
    TxIdExists,
    /// The operation targeted a view that was closed or never prepared.
    #[error("transaction view is closed or was never prepared")]
    ViewClosed,
    /// Backend failure, surfaced verbatim.
    #[error("{0}")]
    Storage(StorageError),
}

impl From<StorageError> for MvccError {
    fn from(value: StorageError) -> Self {
        MvccError::Storage(value)
    }
}

impl MvccError {
    /// True when the error is the backend's missing-key sentinel.
    pub fn is_key_not_found(&self) -> bool {
        matches!(self, MvccError::Storage(StorageError::KeyNotFound))
    }
}

/// Per-transaction working set.
struct TxView {
    /// Global version counter value when this view was prepared (or last
    /// reset). Keys published after this point conflict with the view.
    prepare_version: u64,
    /// Every key this view read, including misses.
    reads: BTreeSet<Vec<u8>>,
    /// Buffered writes; `None` is a tombstone.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl TxView {
    fn new(prepare_version: u64) -> Self {
        Self {
            prepare_version,
            reads: BTreeSet::new(),
            writes: BTreeMap::new(),
        }
    }
}

/// Shared state behind every handle derived from one `MvccDb::new` call.
struct MvccCore<I: TxId> {
    storage: Arc<dyn Storage>,
    in_batch: bool,
    /// Monotonic counter; bumped once per key published into the batch.
    global_version: u64,
    /// Block-level buffered writes; flushed to storage on commit.
    staging: HashMap<Vec<u8>, Option<Vec<u8>>>,
    /// For each staged key: the version at which it was last published and
    /// the transaction that published it (`None` for root-view writes).
    key_versions: HashMap<Vec<u8>, (u64, Option<I>)>,
    views: HashMap<I, TxView>,
}

impl<I: TxId> MvccCore<I> {
    /// Reads through staging to the backend. Tombstones surface as misses.
    fn read_through(&self, key: &[u8]) -> Result<Vec<u8>, MvccError> {
        if self.in_batch {
            if let Some(staged) = self.staging.get(key) {
                return staged.clone().ok_or(StorageError::KeyNotFound.into());
            }
        }
        Ok(self.storage.get(key)?)
    }

    fn clear_batch(&mut self) {
        self.staging.clear();
        self.key_versions.clear();
        self.views.clear();
        self.in_batch = false;
    }
}

/// A handle onto an MVCC overlay.
///
/// Handles are cheap to clone; clones of the same handle address the same
/// view. The handle returned by [`MvccDb::new`] is the *root* view (reads
/// and writes address the block-level batch directly); handles returned by
/// [`prepare`](MvccDb::prepare) are per-transaction views.
pub struct MvccDb<I: TxId> {
    core: Arc<Mutex<MvccCore<I>>>,
    /// `None` for the root view, the owning transaction id otherwise.
    view: Option<I>,
    strict_global_version_check: Arc<AtomicBool>,
    same_key_compat: bool,
}

impl<I: TxId> Clone for MvccDb<I> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            view: self.view.clone(),
            strict_global_version_check: Arc::clone(&self.strict_global_version_check),
            same_key_compat: self.same_key_compat,
        }
    }
}

impl<I: TxId> MvccDb<I> {
    /// Creates a new overlay over the given backend.
    ///
    /// `same_key_compat` relaxes write-write conflicts to byte-identical
    /// writes; enable it for overlays holding content-addressed data.
    pub fn new(storage: Arc<dyn Storage>, same_key_compat: bool) -> Self {
        Self {
            core: Arc::new(Mutex::new(MvccCore {
                storage,
                in_batch: false,
                global_version: 0,
                staging: HashMap::new(),
                key_versions: HashMap::new(),
                views: HashMap::new(),
            })),
            view: None,
            strict_global_version_check: Arc::new(AtomicBool::new(false)),
            same_key_compat,
        }
    }

    /// Switches conflict detection between read-set checking (off) and
    /// full touched-set checking (on).
    pub fn set_strict_global_version_check(&self, strict: bool) {
        self.strict_global_version_check
            .store(strict, Ordering::Relaxed);
    }

    /// Opens the block-level write batch.
    pub fn begin(&self) -> Result<(), MvccError> {
        let mut core = self.core.lock().unwrap();
        if core.in_batch {
            return Err(MvccError::NestedBatch);
        }
        core.in_batch = true;
        Ok(())
    }

    /// Flushes the batch to the backend and discards all views.
    pub fn commit(&self) -> Result<(), MvccError> {
        let mut core = self.core.lock().unwrap();
        if !core.in_batch {
            return Err(MvccError::NoActiveBatch);
        }

        let staged: Vec<(Vec<u8>, Option<Vec<u8>>)> =
            core.staging.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for (key, value) in staged {
            match value {
                Some(value) => core.storage.put(&key, value)?,
                None => core.storage.del(&key)?,
            }
        }

        core.clear_batch();
        Ok(())
    }

    /// Discards the batch and all views without touching the backend.
    pub fn rollback(&self) -> Result<(), MvccError> {
        let mut core = self.core.lock().unwrap();
        if !core.in_batch {
            return Err(MvccError::NoActiveBatch);
        }
        core.clear_batch();
        Ok(())
    }

    /// Derives a per-transaction view.
    ///
    /// Requires an open batch; at most one live view may exist per id.
    pub fn prepare(&self, txid: I) -> Result<MvccDb<I>, MvccError> {
        let mut core = self.core.lock().unwrap();
        if !core.in_batch {
            return Err(MvccError::NoActiveBatch);
        }
        if core.views.contains_key(&txid) {
            return Err(MvccError::TxIdExists);
        }

        let view = TxView::new(core.global_version);
        core.views.insert(txid.clone(), view);

        Ok(MvccDb {
            core: Arc::clone(&self.core),
            view: Some(txid),
            strict_global_version_check: Arc::clone(&self.strict_global_version_check),
            same_key_compat: self.same_key_compat,
        })
    }

    /// Reads a key.
    ///
    /// On a transaction view the access is recorded (misses included) so it
    /// participates in conflict detection; lookups go through the view's own
    /// writes, then the batch, then the backend.
    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>, MvccError> {
        let mut core = self.core.lock().unwrap();
        match &self.view {
            Some(txid) => {
                let view = core.views.get_mut(txid).ok_or(MvccError::ViewClosed)?;
                view.reads.insert(key.to_vec());
                if let Some(buffered) = view.writes.get(key) {
                    return buffered.clone().ok_or(StorageError::KeyNotFound.into());
                }
                core.read_through(key)
            }
            None => core.read_through(key),
        }
    }

    /// Writes a key.
    pub fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), MvccError> {
        self.write(key, Some(value))
    }

    /// Deletes a key.
    pub fn del(&self, key: &[u8]) -> Result<(), MvccError> {
        self.write(key, None)
    }

    fn write(&self, key: &[u8], value: Option<Vec<u8>>) -> Result<(), MvccError> {
        let mut core = self.core.lock().unwrap();
        match &self.view {
            Some(txid) => {
                let view = core.views.get_mut(txid).ok_or(MvccError::ViewClosed)?;
                view.writes.insert(key.to_vec(), value);
                Ok(())
            }
            None => {
                if core.in_batch {
                    core.staging.insert(key.to_vec(), value);
                    core.global_version += 1;
                    let version = core.global_version;
                    core.key_versions.insert(key.to_vec(), (version, None));
                    Ok(())
                } else {
                    match value {
                        Some(value) => Ok(core.storage.put(key, value)?),
                        None => Ok(core.storage.del(key)?),
                    }
                }
            }
        }
    }

    /// Validates this view against everything published since it was
    /// prepared and returns the dependency set.
    ///
    /// An empty set means the view was clean: its writes are now published
    /// into the batch and visible to later-prepared views. A non-empty set
    /// lists the transactions whose published keys intersect this view's
    /// working set; nothing is published in that case. A non-empty set is
    /// the scheduler's signal, not an error.
    pub fn check_and_update(&self) -> Result<Vec<I>, MvccError> {
        let txid = self.view.as_ref().ok_or(MvccError::ViewClosed)?;
        let strict = self.strict_global_version_check.load(Ordering::Relaxed);

        let mut core = self.core.lock().unwrap();
        let view = core.views.get(txid).ok_or(MvccError::ViewClosed)?;

        // Strict mode audits every touched key; otherwise only stale reads
        // count against the view.
        let mut candidates: BTreeSet<&Vec<u8>> = view.reads.iter().collect();
        if strict {
            candidates.extend(view.writes.keys());
        }

        let mut dependencies: Vec<I> = Vec::new();
        for key in candidates {
            let Some((version, writer)) = core.key_versions.get(key) else {
                continue;
            };
            if *version <= view.prepare_version {
                continue;
            }
            if self.same_key_compat {
                let published = core.staging.get(key);
                if view.writes.get(key).is_some_and(|mine| Some(mine) == published) {
                    continue;
                }
            }
            if let Some(writer) = writer {
                if writer != txid && !dependencies.contains(writer) {
                    dependencies.push(writer.clone());
                }
            }
        }

        if dependencies.is_empty() {
            let view = core.views.get_mut(txid).unwrap();
            let writes = std::mem::take(&mut view.writes);
            view.reads.clear();

            for (key, value) in writes {
                core.staging.insert(key.clone(), value);
                core.global_version += 1;
                let version = core.global_version;
                core.key_versions.insert(key, (version, Some(txid.clone())));
            }
            let version = core.global_version;
            let view = core.views.get_mut(txid).unwrap();
            view.prepare_version = version;
        }

        Ok(dependencies)
    }

    /// Discards this view's working set and re-baselines it against the
    /// current batch state, leaving the view alive.
    pub fn reset(&self) -> Result<(), MvccError> {
        let txid = self.view.as_ref().ok_or(MvccError::ViewClosed)?;
        let mut core = self.core.lock().unwrap();
        let version = core.global_version;
        let view = core.views.get_mut(txid).ok_or(MvccError::ViewClosed)?;
        view.reads.clear();
        view.writes.clear();
        view.prepare_version = version;
        Ok(())
    }

    /// Discards this view entirely. Closing the root view is a no-op.
    pub fn close(&self) -> Result<(), MvccError> {
        let Some(txid) = self.view.as_ref() else {
            return Ok(());
        };
        let mut core = self.core.lock().unwrap();
        core.views.remove(txid).ok_or(MvccError::ViewClosed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory_storage::MemoryStorage;

    fn overlay(same_key_compat: bool) -> MvccDb<&'static str> {
        MvccDb::new(Arc::new(MemoryStorage::new()), same_key_compat)
    }

    fn changelog() -> MvccDb<&'static str> {
        let db = overlay(false);
        db.set_strict_global_version_check(true);
        db
    }

    #[test]
    fn root_writes_outside_batch_hit_the_backend() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage.clone(), false);

        db.put(b"k", b"v".to_vec()).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), b"v".to_vec());
        assert_eq!(db.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn nested_begin_is_rejected() {
        let db = overlay(false);
        db.begin().unwrap();
        assert_eq!(db.begin(), Err(MvccError::NestedBatch));
    }

    #[test]
    fn commit_and_rollback_require_a_batch() {
        let db = overlay(false);
        assert_eq!(db.commit(), Err(MvccError::NoActiveBatch));
        assert_eq!(db.rollback(), Err(MvccError::NoActiveBatch));
    }

    #[test]
    fn prepare_requires_a_batch() {
        let db = overlay(false);
        assert_eq!(db.prepare("t1").err(), Some(MvccError::NoActiveBatch));
    }

    #[test]
    fn duplicate_prepare_is_rejected() {
        let db = overlay(false);
        db.begin().unwrap();
        let _t1 = db.prepare("t1").unwrap();
        assert_eq!(db.prepare("t1").err(), Some(MvccError::TxIdExists));
    }

    #[test]
    fn staged_writes_flush_on_commit_only() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage.clone(), false);

        db.begin().unwrap();
        db.put(b"k", b"v".to_vec()).unwrap();
        assert_eq!(storage.get(b"k"), Err(StorageError::KeyNotFound));
        assert_eq!(db.get(b"k").unwrap(), b"v".to_vec());

        db.commit().unwrap();
        assert_eq!(storage.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage.clone(), false);

        db.begin().unwrap();
        db.put(b"k", b"v".to_vec()).unwrap();
        db.rollback().unwrap();

        assert_eq!(storage.get(b"k"), Err(StorageError::KeyNotFound));
        assert!(db.get(b"k").unwrap_err().is_key_not_found());
    }

    #[test]
    fn view_writes_are_invisible_until_published() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        t1.put(b"k", b"v".to_vec()).unwrap();

        assert!(db.get(b"k").unwrap_err().is_key_not_found());
        assert_eq!(t1.get(b"k").unwrap(), b"v".to_vec());

        assert_eq!(t1.check_and_update().unwrap(), Vec::<&str>::new());
        assert_eq!(db.get(b"k").unwrap(), b"v".to_vec());
    }

    #[test]
    fn disjoint_views_do_not_conflict() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"a", b"1".to_vec()).unwrap();
        t2.put(b"b", b"2".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert!(t2.check_and_update().unwrap().is_empty());
    }

    #[test]
    fn write_write_conflict_reports_first_writer() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"k", b"1".to_vec()).unwrap();
        t2.put(b"k", b"2".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert_eq!(t2.check_and_update().unwrap(), vec!["t1"]);

        // The conflicting view's write must not have been published.
        assert_eq!(db.get(b"k").unwrap(), b"1".to_vec());
    }

    #[test]
    fn read_write_conflict_is_detected() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();

        // t2 reads a key t1 later publishes; the miss still registers.
        assert!(t2.get(b"k").unwrap_err().is_key_not_found());
        t1.put(b"k", b"1".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert_eq!(t2.check_and_update().unwrap(), vec!["t1"]);
    }

    #[test]
    fn view_prepared_after_publish_sees_no_conflict() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        t1.put(b"k", b"1".to_vec()).unwrap();
        assert!(t1.check_and_update().unwrap().is_empty());

        let t2 = db.prepare("t2").unwrap();
        assert_eq!(t2.get(b"k").unwrap(), b"1".to_vec());
        t2.put(b"k", b"2".to_vec()).unwrap();
        assert!(t2.check_and_update().unwrap().is_empty());
    }

    #[test]
    fn same_key_compat_accepts_identical_bytes() {
        let db = overlay(true);
        db.set_strict_global_version_check(true);
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"node", b"same".to_vec()).unwrap();
        t2.put(b"node", b"same".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert!(t2.check_and_update().unwrap().is_empty());
    }

    #[test]
    fn same_key_compat_still_rejects_diverging_bytes() {
        let db = overlay(true);
        db.set_strict_global_version_check(true);
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"node", b"one".to_vec()).unwrap();
        t2.put(b"node", b"two".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert_eq!(t2.check_and_update().unwrap(), vec!["t1"]);
    }

    #[test]
    fn non_strict_mode_ignores_blind_writes() {
        let db = overlay(false);
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"k", b"1".to_vec()).unwrap();
        t2.put(b"k", b"2".to_vec()).unwrap();

        // Without strict checking a blind overwrite is last-writer-wins.
        assert!(t1.check_and_update().unwrap().is_empty());
        assert!(t2.check_and_update().unwrap().is_empty());
    }

    #[test]
    fn reset_rebaselines_a_conflicted_view() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        let t2 = db.prepare("t2").unwrap();
        t1.put(b"k", b"1".to_vec()).unwrap();
        t2.put(b"k", b"2".to_vec()).unwrap();

        assert!(t1.check_and_update().unwrap().is_empty());
        assert_eq!(t2.check_and_update().unwrap(), vec!["t1"]);

        t2.reset().unwrap();
        t2.put(b"k", b"2".to_vec()).unwrap();
        assert!(t2.check_and_update().unwrap().is_empty());
        assert_eq!(db.get(b"k").unwrap(), b"2".to_vec());
    }

    #[test]
    fn closed_view_rejects_every_operation() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        t1.close().unwrap();

        assert_eq!(t1.get(b"k"), Err(MvccError::ViewClosed));
        assert_eq!(t1.put(b"k", vec![]), Err(MvccError::ViewClosed));
        assert_eq!(t1.check_and_update(), Err(MvccError::ViewClosed));
        assert_eq!(t1.close(), Err(MvccError::ViewClosed));
    }

    #[test]
    fn close_frees_the_id_for_a_new_prepare() {
        let db = changelog();
        db.begin().unwrap();

        let t1 = db.prepare("t1").unwrap();
        t1.close().unwrap();
        assert!(db.prepare("t1").is_ok());
    }

    #[test]
    fn commit_discards_views() {
        let db = changelog();
        db.begin().unwrap();
        let t1 = db.prepare("t1").unwrap();

        db.commit().unwrap();
        assert_eq!(t1.get(b"k"), Err(MvccError::ViewClosed));
    }

    #[test]
    fn tombstones_shadow_backend_values() {
        let storage = Arc::new(MemoryStorage::new());
        let db: MvccDb<&str> = MvccDb::new(storage.clone(), false);
        storage.put(b"k", b"old".to_vec()).unwrap();

        db.begin().unwrap();
        let t1 = db.prepare("t1").unwrap();
        t1.del(b"k").unwrap();
        assert!(t1.get(b"k").unwrap_err().is_key_not_found());

        assert!(t1.check_and_update().unwrap().is_empty());
        assert!(db.get(b"k").unwrap_err().is_key_not_found());

        db.commit().unwrap();
        assert_eq!(storage.get(b"k"), Err(StorageError::KeyNotFound));
    }
}
