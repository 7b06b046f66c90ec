//! # GroupWeave
//!
//! Keyed streaming aggregation in pure Rust.
//!
//! GroupWeave consumes records that were already partitioned by a grouping key,
//! folds each key's records into a running aggregate held in a recoverable state
//! store, and emits the updated aggregate after every input record.
//!
//! ## Key Features
//!
//! - **Count and Reduce**: built-in counting or any user [`Reducer`](aggregator::Reducer)
//! - **Recoverable State**: every update is appended to a changelog and replayed at startup
//! - **Idempotent Updates**: redelivered records are detected by sequence and not re-applied
//! - **Partitioned Runtime**: one worker per partition, keys never shared between workers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use groupweave::aggregator::Aggregator;
//! use groupweave::emitter::{OutputEmitter, VecSink};
//! use groupweave::operator::{GroupedAggregation, KeyedRecord};
//! use groupweave::row;
//! use groupweave::state::InMemoryStateStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), groupweave::error::AggregateError> {
//! let sink = VecSink::new();
//! let op = GroupedAggregation::new(
//!   "clicks",
//!   Arc::new(InMemoryStateStore::in_memory()),
//!   Aggregator::Count,
//!   OutputEmitter::new(Arc::new(sink.clone())),
//! );
//! op.process(KeyedRecord::new(row! { "user" => "a" }, row! { "user" => "a" }, 1u64)).await?;
//! assert_eq!(sink.rows(), vec![row! { "user" => "a", "count" => 1i64 }]);
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Rows, cells and cell values.
pub mod row;
/// Error types and error-handling actions.
pub mod error;
/// Recoverable keyed state store with changelog.
pub mod state;
/// Count and reduce aggregation over rows.
pub mod aggregator;
/// Building and publishing combined output rows.
pub mod emitter;
/// The grouped-aggregation operator.
pub mod operator;
/// Key to partition assignment.
pub mod partitioning;
/// Retry policy for retryable failures.
pub mod retry;
/// Runtime configuration.
pub mod config;
/// Partitioned runtime: one worker per partition over a shared store.
pub mod distribution;
