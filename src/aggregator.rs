//! # Aggregator
//!
//! Computes the next [`AggregateState`] of a key from its previous state and an
//! incoming row.
//!
//! - [`Aggregator::Count`] adds one to the previous count (zero when absent).
//! - [`Aggregator::Reduce`] passes the first row of a key through unchanged and
//!   afterwards calls the user [`Reducer`] with `(previous, row)`. The reducer is
//!   not assumed commutative or associative, so results depend on arrival order.
//!
//! ```rust
//! use groupweave::aggregator::{Aggregator, ReducerError};
//! use groupweave::row;
//! use groupweave::row::Row;
//!
//! let keep_latest = Aggregator::reduce(|_prev: &Row, row: &Row| -> Result<Row, ReducerError> {
//!   Ok(row.clone())
//! });
//! let next = keep_latest.apply(None, &row! { "value" => 1i64 }).unwrap();
//! ```

use crate::error::AggregateError;
use crate::row::{Cell, CellValue, Row};
use crate::state::AggregateState;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Error raised by a user [`Reducer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ReducerError {
  message: String,
}

impl ReducerError {
  /// Creates a reducer error with the given message.
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }

  /// Returns the error message.
  pub fn message(&self) -> &str {
    &self.message
  }
}

/// A user-supplied binary reduction over rows.
pub trait Reducer: Send + Sync {
  /// Combines the current aggregate with a new row.
  fn reduce(&self, aggregate: &Row, row: &Row) -> Result<Row, ReducerError>;
}

impl<F> Reducer for F
where
  F: Fn(&Row, &Row) -> Result<Row, ReducerError> + Send + Sync,
{
  fn reduce(&self, aggregate: &Row, row: &Row) -> Result<Row, ReducerError> {
    (self)(aggregate, row)
  }
}

/// Aggregation applied per key.
#[derive(Clone)]
pub enum Aggregator {
  /// Running count of rows.
  Count,
  /// Left fold of rows with a user reducer; the first row is the initial value.
  Reduce(Arc<dyn Reducer>),
}

impl fmt::Debug for Aggregator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Aggregator::Count => write!(f, "Count"),
      Aggregator::Reduce(_) => write!(f, "Reduce(<reducer>)"),
    }
  }
}

impl Aggregator {
  /// Creates a reduce aggregator from any [`Reducer`].
  pub fn reduce<R: Reducer + 'static>(reducer: R) -> Self {
    Aggregator::Reduce(Arc::new(reducer))
  }

  /// Computes the next state from `previous` and `row`.
  pub fn apply(
    &self,
    previous: Option<&AggregateState>,
    row: &Row,
  ) -> Result<AggregateState, AggregateError> {
    match (self, previous) {
      (Aggregator::Count, None) => Ok(AggregateState::Count(1)),
      (Aggregator::Count, Some(AggregateState::Count(n))) => n
        .checked_add(1)
        .map(AggregateState::Count)
        .ok_or_else(|| ReducerError::new("count overflowed i64").into()),
      (Aggregator::Reduce(_), None) => Ok(AggregateState::Row(row.clone())),
      (Aggregator::Reduce(reducer), Some(AggregateState::Row(acc))) => {
        Ok(AggregateState::Row(reducer.reduce(acc, row)?))
      }
      (_, Some(other)) => Err(AggregateError::StateMismatch {
        expected: self.state_kind(),
        found: other.kind(),
      }),
    }
  }

  fn state_kind(&self) -> &'static str {
    match self {
      Aggregator::Count => "count",
      Aggregator::Reduce(_) => "row",
    }
  }
}

/// Reducer that adds numeric cells of the same name.
///
/// Integers of equal width keep their width, mixed widths add as `Long`, and a
/// float operand makes the result a `Double`. Cells present in only one row are
/// carried over; a non-numeric cell present in both rows is an error.
#[derive(Clone, Copy, Debug, Default)]
pub struct SumReducer;

impl Reducer for SumReducer {
  fn reduce(&self, aggregate: &Row, row: &Row) -> Result<Row, ReducerError> {
    let mut cells = Vec::with_capacity(aggregate.len().max(row.len()));
    for cell in aggregate.cells() {
      let value = match row.get(cell.name()) {
        Some(next) => add(cell.name(), cell.value(), next)?,
        None => cell.value().clone(),
      };
      cells.push(Cell::new(cell.name(), value));
    }
    for cell in row.cells() {
      if !aggregate.contains(cell.name()) {
        cells.push(cell.clone());
      }
    }
    Row::new(cells).map_err(|e| ReducerError::new(e.to_string()))
  }
}

fn add(name: &str, a: &CellValue, b: &CellValue) -> Result<CellValue, ReducerError> {
  let overflow = || ReducerError::new(format!("sum of cell '{}' overflows", name));
  match (a, b) {
    (CellValue::Short(x), CellValue::Short(y)) => x.checked_add(*y).map(CellValue::Short).ok_or_else(overflow),
    (CellValue::Int(x), CellValue::Int(y)) => x.checked_add(*y).map(CellValue::Int).ok_or_else(overflow),
    (CellValue::Float(_) | CellValue::Double(_), _) | (_, CellValue::Float(_) | CellValue::Double(_)) => {
      match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => Ok(CellValue::Double(x + y)),
        _ => Err(not_numeric(name)),
      }
    }
    _ => match (a.as_i64(), b.as_i64()) {
      (Some(x), Some(y)) => x.checked_add(y).map(CellValue::Long).ok_or_else(overflow),
      _ => Err(not_numeric(name)),
    },
  }
}

fn not_numeric(name: &str) -> ReducerError {
  ReducerError::new(format!("cell '{}' is not numeric", name))
}
