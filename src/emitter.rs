//! # Output Emitter
//!
//! Builds the combined output row of an aggregation and publishes it to an
//! [`OutputSink`].
//!
//! ## Output layout
//!
//! - **Reduce**: the key's cells followed by every cell of the reduced row.
//! - **Count**: the key's cells followed by a single `count` cell holding the
//!   running total as a `Long`.
//!
//! A cell name present in both halves fails with
//! [`AggregateError::CellNameCollision`]; cells are never silently overwritten.

use crate::error::AggregateError;
use crate::row::{Cell, Key, Row};
use crate::state::AggregateState;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;

/// Name of the cell carrying the running total of a count aggregation.
pub const COUNT_CELL: &str = "count";

/// Error returned by an [`OutputSink`].
#[derive(Error, Debug)]
pub enum SinkError {
  /// The downstream side is gone.
  #[error("output sink closed")]
  Closed,
  /// Sink-specific failure.
  #[error("output sink error: {0}")]
  Other(String),
}

/// One aggregation result: the key and the combined output row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputRecord {
  /// Key the aggregate belongs to.
  pub key: Key,
  /// Key cells followed by aggregate cells.
  pub row: Row,
}

/// Downstream destination for output records.
#[async_trait]
pub trait OutputSink: Send + Sync {
  /// Publishes one record.
  async fn publish(&self, record: OutputRecord) -> Result<(), SinkError>;
}

/// Sink that forwards records into a tokio mpsc channel.
#[derive(Clone, Debug)]
pub struct ChannelSink {
  tx: mpsc::Sender<OutputRecord>,
}

impl ChannelSink {
  /// Creates a sink over an existing sender.
  pub fn new(tx: mpsc::Sender<OutputRecord>) -> Self {
    Self { tx }
  }

  /// Creates a sink and the receiver for its records.
  pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutputRecord>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Self { tx }, rx)
  }
}

#[async_trait]
impl OutputSink for ChannelSink {
  async fn publish(&self, record: OutputRecord) -> Result<(), SinkError> {
    self.tx.send(record).await.map_err(|_| SinkError::Closed)
  }
}

/// Sink that collects records in memory.
#[derive(Clone, Debug, Default)]
pub struct VecSink {
  records: Arc<Mutex<Vec<OutputRecord>>>,
}

impl VecSink {
  /// Creates an empty collecting sink.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns a copy of every record published so far.
  pub fn records(&self) -> Vec<OutputRecord> {
    self
      .records
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  /// Returns the output rows published so far.
  pub fn rows(&self) -> Vec<Row> {
    self.records().into_iter().map(|r| r.row).collect()
  }
}

#[async_trait]
impl OutputSink for VecSink {
  async fn publish(&self, record: OutputRecord) -> Result<(), SinkError> {
    self
      .records
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(record);
    Ok(())
  }
}

/// Assembles output rows and hands them to a sink.
#[derive(Clone)]
pub struct OutputEmitter {
  sink: Arc<dyn OutputSink>,
}

impl OutputEmitter {
  /// Creates an emitter publishing to `sink`.
  pub fn new(sink: Arc<dyn OutputSink>) -> Self {
    Self { sink }
  }

  /// Builds the output record for `key` and its aggregate.
  pub fn emit(&self, key: &Key, state: &AggregateState) -> Result<OutputRecord, AggregateError> {
    let row = match state {
      AggregateState::Row(aggregate) => key.concat(aggregate)?,
      AggregateState::Count(total) => key.with_cell(Cell::new(COUNT_CELL, *total))?,
    };
    Ok(OutputRecord {
      key: key.clone(),
      row,
    })
  }

  /// Publishes a record built by [`emit`](Self::emit).
  pub async fn publish(&self, record: OutputRecord) -> Result<(), AggregateError> {
    self.sink.publish(record).await.map_err(AggregateError::Publish)
  }
}
