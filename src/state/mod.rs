//! Durable per-key aggregate state.
//!
//! This module defines the contract for the store that owns every key's
//! [`AggregateState`]: key/sequence semantics, idempotent put, and recovery by
//! changelog replay.
//!
//! **Key/sequence semantics:**
//! - **Key:** the grouping [`Key`]. Updates are key-scoped and the store never
//!   holds two states for one key.
//! - **Sequence:** a monotonic [`SequenceNumber`] attached to every update. A put
//!   whose sequence is not newer than the key's current one is ignored, so
//!   applying the same `(key, state, sequence)` twice never changes the result.
//!
//! **Durability:** every accepted put appends one [`ChangelogEntry`] before the
//! in-memory map changes. The appended entry is the durability unit: after a
//! crash, either the entry is in the changelog and [`StateStore::recover`]
//! rebuilds the state from it, or it is absent and so is the state.
//!
//! **Emission:** once the output of an update has been published, a second
//! entry with `emitted: true` and the same sequence confirms it. An update
//! whose confirmation is missing is re-emitted on redelivery.

mod changelog;
mod compaction;
mod store;


pub use changelog::{Changelog, FileChangelog, MemoryChangelog};
pub use compaction::spawn_compaction;
pub use store::{ChangelogStateStore, FileStateStore, InMemoryStateStore};

use crate::row::{Key, Row};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for state store operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// I/O or filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A changelog line could not be decoded.
    #[error("corrupt changelog at line {line}: {reason}")]
    Corrupt {
        /// One-based line number in the changelog.
        line: usize,
        /// Decoder error.
        reason: String,
    },
}

/// Monotonic sequence number of an update; doubles as the idempotency token of
/// the inbound record that produced it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// Creates a sequence number from a raw value.
    #[inline]
    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Returns the raw u64 value.
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SequenceNumber {
    fn from(n: u64) -> Self {
        Self(n)
    }
}

/// The running aggregate of one key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateState {
    /// Number of rows folded so far.
    Count(i64),
    /// Result of reducing every row seen so far.
    Row(Row),
}

impl AggregateState {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            AggregateState::Count(_) => "count",
            AggregateState::Row(_) => "row",
        }
    }
}

/// A stored aggregate together with the sequence that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedState {
    /// Current aggregate.
    pub state: AggregateState,
    /// Sequence of the last applied update.
    pub sequence: SequenceNumber,
    /// Whether the output of the update at `sequence` was published.
    pub emitted: bool,
    /// Wall-clock time the update was written.
    pub updated_at: DateTime<Utc>,
}

/// One append-only changelog record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    /// Key the update belongs to.
    pub key: Key,
    /// New aggregate for the key.
    pub state: AggregateState,
    /// Sequence of the update; strictly increasing per key.
    pub sequence: SequenceNumber,
    /// Set on the entry confirming that the update at `sequence` was published.
    #[serde(default)]
    pub emitted: bool,
    /// Wall-clock time the entry was written.
    pub written_at: DateTime<Utc>,
}

impl ChangelogEntry {
    /// Creates an entry stamped with the current time.
    pub fn new(key: Key, state: AggregateState, sequence: SequenceNumber) -> Self {
        Self {
            key,
            state,
            sequence,
            emitted: false,
            written_at: Utc::now(),
        }
    }
}

/// Outcome of [`StateStore::recover`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Entries read from the changelog.
    pub entries_read: usize,
    /// Entries that advanced a key's state.
    pub entries_applied: usize,
    /// Keys held by the store after recovery.
    pub keys: usize,
}

/// Outcome of [`StateStore::compact`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Changelog entries before compaction.
    pub entries_before: usize,
    /// Changelog entries after compaction (one per key).
    pub entries_after: usize,
}

/// Contract for the store that owns per-key aggregate state.
///
/// Implementations are shared across workers as `Arc<dyn StateStore>`; the
/// single-writer-per-key discipline is enforced by the operator, the store only
/// has to keep each call internally consistent.
pub trait StateStore: Send + Sync {
    /// Current state and sequence for `key`, or `None` if the key was never seen.
    fn get(&self, key: &Key) -> Option<VersionedState>;

    /// Stores `state` for `key` at `sequence` and appends the changelog entry.
    ///
    /// Both happen or neither does. A sequence that is not newer than the key's
    /// current one is ignored.
    fn put(&self, key: Key, state: AggregateState, sequence: SequenceNumber) -> Result<(), StateError>;

    /// Records that the output of the update at `sequence` was published.
    ///
    /// A no-op unless `sequence` is the key's current sequence and its output
    /// is not confirmed yet. Until it is confirmed, a redelivery of `sequence`
    /// re-emits the stored aggregate instead of being treated as a duplicate.
    fn confirm_emitted(&self, key: &Key, sequence: SequenceNumber) -> Result<(), StateError>;

    /// Replays the changelog, applying only entries newer than each key's
    /// current sequence. Safe to call repeatedly.
    fn recover(&self) -> Result<RecoveryStats, StateError>;

    /// Latest entry for every key, taken under a consistent view of the store.
    fn snapshot(&self) -> Vec<ChangelogEntry>;

    /// Rewrites the changelog to hold only the latest entry per key.
    fn compact(&self) -> Result<CompactionStats, StateError>;

    /// Drops all state and truncates the changelog.
    fn clear(&self) -> Result<(), StateError>;

    /// Number of keys held.
    fn len(&self) -> usize;

    /// Returns `true` if no key is held.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
