use crate::errors::{Result, StoreError};
use crate::{KeyRange, TxId};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// An ordered, multi-versioned, in-memory key-value store.
///
/// Writes are buffered inside a [`Tx`] and applied atomically at commit under
/// a fresh transaction id. Reads through a [`Snapshot`] observe the state as
/// of the snapshot's transaction id. Commit performs a first-committer-wins
/// check over the transaction's write set.
#[derive(Debug, Clone)]
pub struct MemStore {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    state: RwLock<State>,
    closed: AtomicBool,
}

#[derive(Debug, Default)]
struct State {
    versions: BTreeMap<Vec<u8>, Vec<Version>>,
    last_committed: TxId,
}

#[derive(Debug)]
struct Version {
    txid: TxId,
    value: Option<Vec<u8>>,
}

impl State {
    /// Latest value visible at `view`, tombstones resolved to `None`.
    fn visible(&self, key: &[u8], view: TxId) -> Option<&[u8]> {
        let versions = self.versions.get(key)?;
        versions
            .iter()
            .rev()
            .find(|v| v.txid <= view)
            .and_then(|v| v.value.as_deref())
    }

    fn latest_txid(&self, key: &[u8]) -> Option<TxId> {
        self.versions.get(key).and_then(|vs| vs.last()).map(|v| v.txid)
    }
}

impl MemStore {
    pub fn new() -> MemStore {
        MemStore {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        Ok(())
    }

    /// Begin a read-write transaction over the current committed state.
    pub fn begin(&self) -> Result<Tx> {
        self.check_open()?;
        let view = self.inner.state.read().last_committed;
        Ok(Tx {
            inner: self.inner.clone(),
            view,
            writes: BTreeMap::new(),
        })
    }

    /// Take a read-consistent view of the current committed state.
    pub fn snapshot(&self) -> Result<Snapshot> {
        self.check_open()?;
        let view = self.inner.state.read().last_committed;
        Ok(Snapshot {
            inner: self.inner.clone(),
            view,
        })
    }

    /// Close the store. Outstanding transactions and snapshots fail their
    /// next operation with `AlreadyClosed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl Default for MemStore {
    fn default() -> Self {
        MemStore::new()
    }
}

/// A read-consistent view of the store as of a committed transaction id.
#[derive(Debug, Clone)]
pub struct Snapshot {
    inner: Arc<Inner>,
    view: TxId,
}

impl Snapshot {
    pub fn txid(&self) -> TxId {
        self.view
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        let state = self.inner.state.read();
        Ok(state.visible(key, self.view).map(|v| v.to_vec()))
    }

    /// Ordered scan over `range`, descending when `desc` is set.
    pub fn range(&self, range: KeyRange, desc: bool) -> ScanIter {
        ScanIter {
            inner: self.inner.clone(),
            view: self.view,
            range,
            desc,
            cursor: None,
        }
    }
}

/// Pull-based scan over a snapshot view.
///
/// Each step takes the state lock briefly and resumes after the last key
/// yielded, so the iterator never holds a lock across calls.
#[derive(Debug)]
pub struct ScanIter {
    inner: Arc<Inner>,
    view: TxId,
    range: KeyRange,
    desc: bool,
    cursor: Option<Vec<u8>>,
}

impl ScanIter {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        let state = self.inner.state.read();

        let (start, end): (Bound<&[u8]>, Bound<&[u8]>) = if self.desc {
            let end = match &self.cursor {
                Some(c) => Bound::Excluded(c.as_slice()),
                None => as_ref_bound(&self.range.end),
            };
            (as_ref_bound(&self.range.start), end)
        } else {
            let start = match &self.cursor {
                Some(c) => Bound::Excluded(c.as_slice()),
                None => as_ref_bound(&self.range.start),
            };
            (start, as_ref_bound(&self.range.end))
        };

        if bounds_empty(&start, &end) {
            return Ok(None);
        }

        let iter = state.versions.range::<[u8], _>((start, end));
        let found = if self.desc {
            iter.rev()
                .find_map(|(k, _)| state.visible(k, self.view).map(|v| (k.clone(), v.to_vec())))
        } else {
            iter.filter_map(|(k, _)| state.visible(k, self.view).map(|v| (k.clone(), v.to_vec())))
                .next()
        };

        match found {
            Some((key, value)) => {
                self.cursor = Some(key.clone());
                Ok(Some((key, value)))
            }
            None => Ok(None),
        }
    }
}

fn as_ref_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

/// BTreeMap::range panics on inverted bounds; detect them up front so
/// contradictory scan ranges read as empty instead.
fn bounds_empty(start: &Bound<&[u8]>, end: &Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}

/// A read-write transaction with buffered writes.
#[derive(Debug)]
pub struct Tx {
    inner: Arc<Inner>,
    view: TxId,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Tx {
    /// The committed view this transaction reads from.
    pub fn view(&self) -> TxId {
        self.view
    }

    /// Point read merging the transaction's own writes over its view.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        let state = self.inner.state.read();
        Ok(state.visible(key, self.view).map(|v| v.to_vec()))
    }

    /// Insert-only put: fails with `KeyAlreadyExists` when a live value for
    /// `key` is visible to this transaction.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        if self.get(&key)?.is_some() {
            return Err(StoreError::KeyAlreadyExists);
        }
        self.writes.insert(key, Some(value));
        Ok(())
    }

    /// Unconditional put.
    pub fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    /// Buffer a tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Atomically apply the write set under a fresh transaction id.
    ///
    /// Fails with `Conflict` when any written key was committed to after
    /// this transaction's view was taken.
    pub fn commit(mut self) -> Result<TxId> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StoreError::AlreadyClosed);
        }
        let mut state = self.inner.state.write();

        for key in self.writes.keys() {
            if let Some(latest) = state.latest_txid(key) {
                if latest > self.view {
                    return Err(StoreError::Conflict);
                }
            }
        }

        let txid = state.last_committed + 1;
        for (key, value) in std::mem::take(&mut self.writes) {
            state.versions.entry(key).or_default().push(Version { txid, value });
        }
        state.last_committed = txid;
        Ok(txid)
    }

    /// Discard the write set.
    pub fn abort(mut self) {
        self.writes.clear();
    }
}
