//! [`StateStore`] implementation over any [`Changelog`].

use super::{
    AggregateState, Changelog, ChangelogEntry, CompactionStats, FileChangelog, MemoryChangelog,
    RecoveryStats, SequenceNumber, StateError, StateStore, VersionedState,
};
use crate::row::Key;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, instrument};

/// Store backed entirely by memory.
pub type InMemoryStateStore = ChangelogStateStore<MemoryChangelog>;

/// Store whose changelog lives in a file.
pub type FileStateStore = ChangelogStateStore<FileChangelog>;

/// Key → aggregate map that records every accepted update in a changelog.
///
/// The changelog append is the commit point: the map is only updated after the
/// append succeeded. Every changelog write (put, confirmation, compaction,
/// clear, recovery) runs under one writer mutex, so compaction never observes a
/// key mid-update. The map lock is only taken around in-memory reads and
/// inserts, never across I/O, so `get` is not held up by a slow append.
#[derive(Debug)]
pub struct ChangelogStateStore<L: Changelog> {
    changelog: L,
    /// Entries currently in the changelog, including superseded ones.
    writer: Mutex<usize>,
    map: RwLock<HashMap<Key, VersionedState>>,
}

impl<L: Changelog> ChangelogStateStore<L> {
    /// Wraps a changelog. Call [`StateStore::recover`] to load existing entries.
    pub fn new(changelog: L) -> Self {
        Self {
            changelog,
            writer: Mutex::new(0),
            map: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the underlying changelog.
    pub fn changelog(&self) -> &L {
        &self.changelog
    }

    fn writer(&self) -> MutexGuard<'_, usize> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Key, VersionedState>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Key, VersionedState>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl InMemoryStateStore {
    /// Creates an empty in-memory store.
    pub fn in_memory() -> Self {
        Self::new(MemoryChangelog::new())
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl FileStateStore {
    /// Opens the changelog at `path` and replays it.
    pub fn open<P: AsRef<Path>>(path: P, sync_on_write: bool) -> Result<Self, StateError> {
        let store = Self::new(FileChangelog::open(path, sync_on_write)?);
        store.recover()?;
        Ok(store)
    }
}

impl<L: Changelog> StateStore for ChangelogStateStore<L> {
    fn get(&self, key: &Key) -> Option<VersionedState> {
        self.read().get(key).cloned()
    }

    fn put(&self, key: Key, state: AggregateState, sequence: SequenceNumber) -> Result<(), StateError> {
        let mut log_entries = self.writer();
        if let Some(current) = self.read().get(&key) {
            if current.sequence >= sequence {
                debug!(%key, sequence = sequence.as_u64(), "ignoring stale put");
                return Ok(());
            }
        }
        let entry = ChangelogEntry::new(key, state, sequence);
        self.changelog.append(&entry)?;
        *log_entries += 1;
        self.write().insert(
            entry.key,
            VersionedState {
                state: entry.state,
                sequence: entry.sequence,
                emitted: false,
                updated_at: entry.written_at,
            },
        );
        Ok(())
    }

    fn confirm_emitted(&self, key: &Key, sequence: SequenceNumber) -> Result<(), StateError> {
        let mut log_entries = self.writer();
        let state = match self.read().get(key) {
            Some(current) if current.sequence == sequence && !current.emitted => current.state.clone(),
            _ => return Ok(()),
        };
        let mut entry = ChangelogEntry::new(key.clone(), state, sequence);
        entry.emitted = true;
        self.changelog.append(&entry)?;
        *log_entries += 1;
        if let Some(current) = self.write().get_mut(key) {
            current.emitted = true;
        }
        Ok(())
    }

    #[instrument(level = "info", skip(self))]
    fn recover(&self) -> Result<RecoveryStats, StateError> {
        let mut log_entries = self.writer();
        let entries = self.changelog.read_all()?;
        let mut map = self.write();
        let mut applied = 0;
        for entry in &entries {
            let newer = map.get(&entry.key).is_none_or(|current| {
                entry.sequence > current.sequence
                    || (entry.sequence == current.sequence && entry.emitted && !current.emitted)
            });
            if newer {
                map.insert(
                    entry.key.clone(),
                    VersionedState {
                        state: entry.state.clone(),
                        sequence: entry.sequence,
                        emitted: entry.emitted,
                        updated_at: entry.written_at,
                    },
                );
                applied += 1;
            }
        }
        *log_entries = entries.len();
        let stats = RecoveryStats {
            entries_read: entries.len(),
            entries_applied: applied,
            keys: map.len(),
        };
        info!(
            entries_read = stats.entries_read,
            entries_applied = stats.entries_applied,
            keys = stats.keys,
            "state store recovered"
        );
        Ok(stats)
    }

    fn snapshot(&self) -> Vec<ChangelogEntry> {
        snapshot_of(&self.read())
    }

    fn compact(&self) -> Result<CompactionStats, StateError> {
        let mut log_entries = self.writer();
        let entries_before = *log_entries;
        let entries = snapshot_of(&self.read());
        if entries_before <= entries.len() {
            return Ok(CompactionStats {
                entries_before,
                entries_after: entries_before,
            });
        }
        self.changelog.rewrite(&entries)?;
        *log_entries = entries.len();
        info!(entries_before, entries_after = entries.len(), "changelog compacted");
        Ok(CompactionStats {
            entries_before,
            entries_after: entries.len(),
        })
    }

    fn clear(&self) -> Result<(), StateError> {
        let mut log_entries = self.writer();
        self.changelog.rewrite(&[])?;
        self.write().clear();
        *log_entries = 0;
        info!("state store cleared");
        Ok(())
    }

    fn len(&self) -> usize {
        self.read().len()
    }
}

fn snapshot_of(map: &HashMap<Key, VersionedState>) -> Vec<ChangelogEntry> {
    let mut entries: Vec<ChangelogEntry> = map
        .iter()
        .map(|(key, v)| ChangelogEntry {
            key: key.clone(),
            state: v.state.clone(),
            sequence: v.sequence,
            emitted: v.emitted,
            written_at: v.updated_at,
        })
        .collect();
    entries.sort_by_key(|e| e.sequence);
    entries
}
