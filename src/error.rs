//! # Error Handling
//!
//! Every failure of the per-record aggregation protocol surfaces as an
//! [`AggregateError`] to the immediate caller; nothing is swallowed inside the
//! operator. Each error kind maps to an [`ErrorAction`] that tells the caller
//! what to do with the inbound record:
//!
//! | Error                | Action  | State committed | Acknowledge record |
//! |----------------------|---------|-----------------|--------------------|
//! | `MalformedRow`       | `Skip`  | no              | yes, dropped       |
//! | `StoreWrite`         | `Retry` | no              | no                 |
//! | `Aggregation`        | `Stop`  | no              | no                 |
//! | `CellNameCollision`  | `Skip`  | no              | yes, dropped       |
//! | `StateMismatch`      | `Stop`  | no              | no                 |
//! | `Publish`            | `Retry` | yes             | no                 |
//! | `PartitionHalted`    | `Stop`  | no              | no                 |
//! | `Shutdown`           | `Retry` | no              | no                 |
//!
//! A failed publish leaves the committed update unconfirmed, so retrying or
//! redelivering the record emits it instead of reporting a duplicate.
//!
//! Crash recovery goes through [`StateStore::recover`](crate::state::StateStore::recover);
//! record-level errors never trigger local recovery.

use crate::aggregator::ReducerError;
use crate::emitter::SinkError;
use crate::row::RowError;
use crate::state::StateError;
use thiserror::Error;

/// Action to take when an error occurs while processing a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
  /// Stop processing; the failure needs operator attention.
  Stop,
  /// Drop the record and continue with the next one.
  Skip,
  /// Retry the same record, typically after a backoff.
  Retry,
}

/// Error returned by the grouped-aggregation protocol.
#[derive(Error, Debug)]
pub enum AggregateError {
  /// The inbound row is empty or inconsistent with its key.
  #[error("malformed row: {reason}")]
  MalformedRow {
    /// Why the row was rejected.
    reason: String,
  },
  /// Persisting the new aggregate failed.
  #[error("store write failed: {0}")]
  StoreWrite(#[source] StateError),
  /// The user reducer failed.
  #[error("aggregation failed: {0}")]
  Aggregation(#[source] ReducerError),
  /// Key and aggregate share a cell name.
  #[error("cell name collision on '{name}'")]
  CellNameCollision {
    /// The conflicting cell name.
    name: String,
  },
  /// The stored aggregate does not match the aggregator kind.
  #[error("stored aggregate is a {found}, aggregator expects a {expected}")]
  StateMismatch {
    /// Variant the aggregator expects.
    expected: &'static str,
    /// Variant found in the store.
    found: &'static str,
  },
  /// The committed output could not be handed to the sink.
  #[error("publish failed: {0}")]
  Publish(#[source] SinkError),
  /// An earlier record of the partition failed for good; later records are
  /// not processed until the runtime is restarted.
  #[error("partition {partition} halted after an unrecoverable failure")]
  PartitionHalted {
    /// The halted partition.
    partition: u32,
  },
  /// The runtime is shutting down and no longer accepts records.
  #[error("aggregation runtime is shutting down")]
  Shutdown,
}

impl AggregateError {
  /// Creates a [`AggregateError::MalformedRow`].
  pub fn malformed(reason: impl Into<String>) -> Self {
    AggregateError::MalformedRow {
      reason: reason.into(),
    }
  }

  /// Returns the action the caller should take for this error.
  pub fn action(&self) -> ErrorAction {
    match self {
      AggregateError::StoreWrite(_) | AggregateError::Publish(_) | AggregateError::Shutdown => {
        ErrorAction::Retry
      }
      AggregateError::MalformedRow { .. } | AggregateError::CellNameCollision { .. } => {
        ErrorAction::Skip
      }
      AggregateError::Aggregation(_)
      | AggregateError::StateMismatch { .. }
      | AggregateError::PartitionHalted { .. } => ErrorAction::Stop,
    }
  }

  /// Returns `true` if retrying the same record may succeed.
  pub fn is_retryable(&self) -> bool {
    self.action() == ErrorAction::Retry
  }
}

impl From<RowError> for AggregateError {
  fn from(err: RowError) -> Self {
    match err {
      RowError::DuplicateCell(name) => AggregateError::CellNameCollision { name },
      RowError::MissingCell(name) => {
        AggregateError::malformed(format!("missing cell '{}'", name))
      }
    }
  }
}

impl From<ReducerError> for AggregateError {
  fn from(err: ReducerError) -> Self {
    AggregateError::Aggregation(err)
  }
}

impl From<SinkError> for AggregateError {
  fn from(err: SinkError) -> Self {
    AggregateError::Publish(err)
  }
}
