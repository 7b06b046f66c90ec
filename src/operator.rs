//! # Grouped-Aggregation Operator
//!
//! Runs the per-record protocol that keeps every key's aggregate up to date:
//!
//! 1. Validate the row and strip the key's own cells from it.
//! 2. Take the key's lock; no two records of one key are ever in flight together.
//! 3. Read the current state. A record whose sequence is older than the stored
//!    one, or equal to it with its output already confirmed, is a redelivery and
//!    is acknowledged as [`Processed::Duplicate`] without touching state or
//!    output. A record equal to the stored sequence whose output was never
//!    confirmed re-emits the stored aggregate.
//! 4. Fold the row into the aggregate and build the output record. A cell-name
//!    collision fails here, before anything is committed.
//! 5. Persist the new aggregate on the blocking pool. This is the only commit
//!    point; a failed write surfaces as [`AggregateError::StoreWrite`] and
//!    nothing is emitted.
//! 6. Publish the output record and confirm the emission in the store. A failed
//!    publish surfaces as [`AggregateError::Publish`]; the record is retried or
//!    redelivered and step 3 emits the committed aggregate.
//!
//! A key is `UNSEEN` until its first record commits and `ACTIVE` afterwards for
//! as long as the store holds it.

use crate::aggregator::Aggregator;
use crate::emitter::{OutputEmitter, OutputRecord};
use crate::error::AggregateError;
use crate::row::{Key, Row};
use crate::state::{AggregateState, SequenceNumber, StateError, StateStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// A row tagged with its grouping key and the idempotency token of its
/// delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyedRecord {
  /// Grouping key, attached upstream.
  pub key: Key,
  /// The record itself.
  pub row: Row,
  /// Per-partition offset of the record; strictly increasing per key.
  pub sequence: SequenceNumber,
}

impl KeyedRecord {
  /// Creates a keyed record.
  pub fn new(key: Key, row: Row, sequence: impl Into<SequenceNumber>) -> Self {
    Self {
      key,
      row,
      sequence: sequence.into(),
    }
  }

  /// Keys `row` by the named cells, the way an upstream group-by would.
  pub fn group_by<S: AsRef<str>>(
    row: Row,
    key_names: &[S],
    sequence: impl Into<SequenceNumber>,
  ) -> Result<Self, AggregateError> {
    let key = row.project(key_names)?;
    Ok(Self::new(key, row, sequence))
  }
}

/// Result of processing one record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Processed {
  /// The aggregate advanced and this record was published.
  Emitted(OutputRecord),
  /// The record was already applied; nothing changed.
  Duplicate {
    /// Sequence of the redelivered record.
    sequence: SequenceNumber,
    /// Sequence currently stored for the key.
    applied: SequenceNumber,
  },
}

/// Arena of per-key async mutexes.
///
/// An entry lives as long as its key has state. Entries of keys whose first
/// record failed are dropped again once nobody waits on them.
#[derive(Default)]
struct KeyLocks {
  locks: Mutex<HashMap<Key, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
  fn locks(&self) -> MutexGuard<'_, HashMap<Key, Arc<tokio::sync::Mutex<()>>>> {
    self.locks.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn lock_for(&self, key: &Key) -> Arc<tokio::sync::Mutex<()>> {
    Arc::clone(self.locks().entry(key.clone()).or_default())
  }

  /// Drops the entry for `key` if `lock` is it and only the arena and the
  /// caller still hold it. Clones are only taken under the arena mutex.
  fn release(&self, key: &Key, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = self.locks();
    let unused = locks
      .get(key)
      .is_some_and(|held| Arc::ptr_eq(held, &lock) && Arc::strong_count(&lock) == 2);
    if unused {
      locks.remove(key);
    }
  }

  #[cfg(test)]
  fn len(&self) -> usize {
    self.locks().len()
  }
}

/// Keyed count/reduce operator over a shared [`StateStore`].
pub struct GroupedAggregation {
  name: String,
  store: Arc<dyn StateStore>,
  aggregator: Aggregator,
  emitter: OutputEmitter,
  locks: KeyLocks,
}

impl GroupedAggregation {
  /// Creates an operator. The store must already be recovered.
  pub fn new(
    name: impl Into<String>,
    store: Arc<dyn StateStore>,
    aggregator: Aggregator,
    emitter: OutputEmitter,
  ) -> Self {
    Self {
      name: name.into(),
      store,
      aggregator,
      emitter,
      locks: KeyLocks::default(),
    }
  }

  /// Returns the operator name used in logs.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns the aggregator this operator applies.
  pub fn aggregator(&self) -> &Aggregator {
    &self.aggregator
  }

  /// Returns the backing state store.
  pub fn store(&self) -> &Arc<dyn StateStore> {
    &self.store
  }

  /// Current aggregate for `key`, if any.
  pub fn current(&self, key: &Key) -> Option<AggregateState> {
    self.store.get(key).map(|v| v.state)
  }

  /// Number of keys with a lock entry.
  #[cfg(test)]
  pub(crate) fn locked_keys(&self) -> usize {
    self.locks.len()
  }

  /// Processes one record. See the module docs for the protocol.
  pub async fn process(&self, record: KeyedRecord) -> Result<Processed, AggregateError> {
    let KeyedRecord { key, row, sequence } = record;
    let value = value_row(&key, &row)?;

    let lock = self.locks.lock_for(&key);
    let result = {
      let _guard = lock.lock().await;
      self.process_locked(&key, &value, sequence).await
    };
    if result.is_err() && self.store.get(&key).is_none() {
      self.locks.release(&key, lock);
    }
    result
  }

  async fn process_locked(
    &self,
    key: &Key,
    value: &Row,
    sequence: SequenceNumber,
  ) -> Result<Processed, AggregateError> {
    let current = self.store.get(key);
    if let Some(current) = &current {
      if current.sequence > sequence || (current.sequence == sequence && current.emitted) {
        debug!(
          operator = %self.name,
          %key,
          sequence = sequence.as_u64(),
          applied = current.sequence.as_u64(),
          "skipping redelivered record"
        );
        return Ok(Processed::Duplicate {
          sequence,
          applied: current.sequence,
        });
      }
      if current.sequence == sequence {
        debug!(
          operator = %self.name,
          %key,
          sequence = sequence.as_u64(),
          "re-emitting committed but unpublished aggregate"
        );
        let output = self.emitter.emit(key, &current.state)?;
        return self.publish(key, sequence, output).await;
      }
    }

    let updated = self
      .aggregator
      .apply(current.as_ref().map(|c| &c.state), value)?;
    let output = self.emitter.emit(key, &updated)?;

    let store = Arc::clone(&self.store);
    let owned_key = key.clone();
    if let Err(e) = run_blocking(move || store.put(owned_key, updated, sequence)).await {
      warn!(
        operator = %self.name,
        sequence = sequence.as_u64(),
        error = %e,
        "state write failed, record not emitted"
      );
      return Err(AggregateError::StoreWrite(e));
    }

    self.publish(key, sequence, output).await
  }

  /// Publishes `output`, then records that the update at `sequence` was
  /// emitted. A failed publish leaves the update unconfirmed so a redelivery
  /// emits it again.
  async fn publish(
    &self,
    key: &Key,
    sequence: SequenceNumber,
    output: OutputRecord,
  ) -> Result<Processed, AggregateError> {
    self.emitter.publish(output.clone()).await?;

    let store = Arc::clone(&self.store);
    let owned_key = key.clone();
    if let Err(e) = run_blocking(move || store.confirm_emitted(&owned_key, sequence)).await {
      // The output is out; at worst a redelivery publishes it again.
      warn!(
        operator = %self.name,
        sequence = sequence.as_u64(),
        error = %e,
        "emission confirmation failed"
      );
    }
    Ok(Processed::Emitted(output))
  }
}

/// Runs a store call on the blocking pool; changelog appends may fsync.
async fn run_blocking<T, F>(f: F) -> Result<T, StateError>
where
  F: FnOnce() -> Result<T, StateError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| StateError::Io(std::io::Error::other(e)))?
}

/// Returns `row` without the key's cells, rejecting rows that are empty or
/// disagree with their key.
fn value_row(key: &Key, row: &Row) -> Result<Row, AggregateError> {
  if row.is_empty() {
    return Err(AggregateError::malformed("row has no cells"));
  }
  for cell in key.cells() {
    if let Some(value) = row.get(cell.name()) {
      if value != cell.value() {
        return Err(AggregateError::malformed(format!(
          "cell '{}' is {} in the row but {} in its key",
          cell.name(),
          value,
          cell.value()
        )));
      }
    }
  }
  Ok(row.without(key))
}
