//! The durable log and state storage seam.

use std::sync::Arc;
use std::sync::Mutex;

use crate::entry::limit_size;
use crate::entry::Entry;
use crate::error::StorageError;
use crate::state::ConfState;
use crate::state::HardState;
use crate::state::Snapshot;
use crate::state::SnapshotMeta;

/// Read access to the stable portion of the log.
///
/// The core only reads through this trait; the host performs the writes
/// (driven by [`Ready`] or storage messages) out of band. An
/// implementation therefore typically wraps shared, internally
/// synchronized state.
///
/// [`Ready`]: crate::node::Ready
pub trait Storage {
    /// The persisted hard state and membership, read once at startup.
    fn initial_state(&self) -> Result<(HardState, ConfState), StorageError>;

    /// Entries in `[lo, hi)`, limited to `max_size` encoded bytes but
    /// always at least one entry if the range is non-empty.
    ///
    /// Returns [`StorageError::Compacted`] if `lo` predates the
    /// snapshot, [`StorageError::Unavailable`] if `hi` is past the last
    /// persisted entry.
    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, StorageError>;

    /// The term of the entry at `index`, which must be in
    /// `[first_index - 1, last_index]`. The `first_index - 1` slot is
    /// the snapshot boundary whose term is retained after compaction.
    fn term(&self, index: u64) -> Result<u64, StorageError>;

    /// The index of the first persisted entry; older entries are only
    /// available through the snapshot.
    fn first_index(&self) -> Result<u64, StorageError>;

    /// The index of the last persisted entry.
    fn last_index(&self) -> Result<u64, StorageError>;

    /// The most recent snapshot. May return
    /// [`StorageError::SnapshotTemporarilyUnavailable`] if one is being
    /// prepared; the caller retries later without any state change.
    fn snapshot(&self) -> Result<Snapshot, StorageError>;
}

#[derive(Debug)]
struct MemStorageCore {
    hard_state: HardState,
    snapshot: Snapshot,
    /// `entries[0]` is a dummy holding the id of the snapshot boundary;
    /// real entries follow it.
    entries: Vec<Entry>,
}

impl MemStorageCore {
    fn first_index(&self) -> u64 {
        self.entries[0].index + 1
    }

    fn last_index(&self) -> u64 {
        self.entries[self.entries.len() - 1].index
    }
}

/// An in-memory [`Storage`], synchronized internally so the host and the
/// replica can share it. Clones share the same underlying state.
#[derive(Clone, Debug)]
pub struct MemStorage {
    core: Arc<Mutex<MemStorageCore>>,
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStorage {
    pub fn new() -> Self {
        let core = MemStorageCore {
            hard_state: HardState::default(),
            snapshot: Snapshot::default(),
            entries: vec![Entry::default()],
        };
        Self {
            core: Arc::new(Mutex::new(core)),
        }
    }

    /// A storage whose snapshot declares the given membership, for
    /// bootstrapping a group in tests and examples.
    pub fn new_with_conf_state(conf_state: ConfState) -> Self {
        let s = Self::new();
        s.core.lock().unwrap().snapshot.meta.conf_state = conf_state;
        s
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.core.lock().unwrap().hard_state = hs;
    }

    pub fn hard_state(&self) -> HardState {
        self.core.lock().unwrap().hard_state
    }

    /// Appends new entries, overwriting any conflicting suffix.
    ///
    /// Panics if the entries do not connect to the existing log or reach
    /// below the compacted prefix — the host must never hand out such a
    /// write.
    pub fn append(&self, entries: &[Entry]) -> Result<(), StorageError> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let mut core = self.core.lock().unwrap();
        assert!(
            first.index >= core.first_index(),
            "appending at {} below compacted index {}",
            first.index,
            core.first_index()
        );
        assert!(
            first.index <= core.last_index() + 1,
            "appending at {} leaves a gap after {}",
            first.index,
            core.last_index()
        );
        let keep = (first.index - core.entries[0].index) as usize;
        core.entries.truncate(keep);
        core.entries.extend_from_slice(entries);
        Ok(())
    }

    /// Installs a snapshot, resetting the log to start after it.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let mut core = self.core.lock().unwrap();
        if snapshot.meta.index < core.snapshot.meta.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        core.entries = vec![Entry {
            term: snapshot.meta.term,
            index: snapshot.meta.index,
            ..Default::default()
        }];
        core.snapshot = snapshot;
        Ok(())
    }

    /// Makes a snapshot at `index` covering the applied prefix and
    /// discards nothing; pair with [`compact`](Self::compact).
    pub fn create_snapshot(
        &self,
        index: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> Result<Snapshot, StorageError> {
        let mut core = self.core.lock().unwrap();
        if index <= core.snapshot.meta.index {
            return Err(StorageError::SnapshotOutOfDate);
        }
        if index > core.last_index() {
            return Err(StorageError::Unavailable);
        }
        let offset = core.entries[0].index;
        let term = core.entries[(index - offset) as usize].term;
        core.snapshot = Snapshot {
            meta: SnapshotMeta {
                index,
                term,
                conf_state,
            },
            data,
        };
        Ok(core.snapshot.clone())
    }

    /// Discards entries up to and including `compact_index`.
    pub fn compact(&self, compact_index: u64) -> Result<(), StorageError> {
        let mut core = self.core.lock().unwrap();
        if compact_index <= core.entries[0].index {
            return Err(StorageError::Compacted);
        }
        assert!(
            compact_index <= core.last_index(),
            "compacting at {} past last index {}",
            compact_index,
            core.last_index()
        );
        let offset = core.entries[0].index;
        core.entries.drain(..(compact_index - offset) as usize);
        Ok(())
    }
}

impl Storage for MemStorage {
    fn initial_state(&self) -> Result<(HardState, ConfState), StorageError> {
        let core = self.core.lock().unwrap();
        Ok((core.hard_state, core.snapshot.meta.conf_state.clone()))
    }

    fn entries(&self, lo: u64, hi: u64, max_size: u64) -> Result<Vec<Entry>, StorageError> {
        let core = self.core.lock().unwrap();
        if lo < core.first_index() {
            return Err(StorageError::Compacted);
        }
        if hi > core.last_index() + 1 {
            return Err(StorageError::Unavailable);
        }
        let offset = core.entries[0].index;
        let mut ents =
            core.entries[(lo - offset) as usize..(hi - offset) as usize].to_vec();
        limit_size(&mut ents, max_size);
        Ok(ents)
    }

    fn term(&self, index: u64) -> Result<u64, StorageError> {
        let core = self.core.lock().unwrap();
        let offset = core.entries[0].index;
        if index < offset {
            return Err(StorageError::Compacted);
        }
        if index > core.last_index() {
            return Err(StorageError::Unavailable);
        }
        Ok(core.entries[(index - offset) as usize].term)
    }

    fn first_index(&self) -> Result<u64, StorageError> {
        Ok(self.core.lock().unwrap().first_index())
    }

    fn last_index(&self) -> Result<u64, StorageError> {
        Ok(self.core.lock().unwrap().last_index())
    }

    fn snapshot(&self) -> Result<Snapshot, StorageError> {
        Ok(self.core.lock().unwrap().snapshot.clone())
    }
}
