//! # Row model
//!
//! A [`Row`] is an immutable, ordered sequence of named [`Cell`]s and the unit of
//! data flowing through an aggregation. Cell names are unique within a row.
//!
//! Equality and hashing are defined over the **cell set**: two rows carrying the
//! same cells in a different order are equal and hash identically, which is what
//! lets a row act as a grouping [`Key`].
//!
//! ## Example
//!
//! ```rust
//! use groupweave::row;
//! use groupweave::row::{CellValue, Row};
//!
//! let a = row! { "user" => "a", "value" => 2i64 };
//! let b = row! { "value" => 2i64, "user" => "a" };
//! assert_eq!(a, b);
//! assert_eq!(a.get("value"), Some(&CellValue::Long(2)));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// A row used as a grouping key.
pub type Key = Row;

/// Errors raised while building or combining rows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RowError {
  /// Two cells share the same name.
  #[error("duplicate cell name: {0}")]
  DuplicateCell(String),
  /// A projection asked for a cell the row does not have.
  #[error("missing cell: {0}")]
  MissingCell(String),
}

/// The value held by a [`Cell`].
///
/// Floating-point values compare and hash by bit pattern so that rows stay
/// usable as hash keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CellValue {
  /// Boolean value.
  Boolean(bool),
  /// 16-bit integer.
  Short(i16),
  /// 32-bit integer.
  Int(i32),
  /// 64-bit integer.
  Long(i64),
  /// 32-bit float.
  Float(f32),
  /// 64-bit float.
  Double(f64),
  /// UTF-8 string.
  String(String),
  /// Raw bytes.
  Bytes(Vec<u8>),
  /// Nested row.
  Row(Row),
}

impl CellValue {
  /// Returns the value as an `i64` if it is an integer of any width.
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      CellValue::Short(v) => Some(i64::from(*v)),
      CellValue::Int(v) => Some(i64::from(*v)),
      CellValue::Long(v) => Some(*v),
      _ => None,
    }
  }

  /// Returns the value as an `f64` if it is numeric.
  pub fn as_f64(&self) -> Option<f64> {
    match self {
      CellValue::Float(v) => Some(f64::from(*v)),
      CellValue::Double(v) => Some(*v),
      other => other.as_i64().map(|v| v as f64),
    }
  }

  /// Returns the value as a string slice if it is a string.
  pub fn as_str(&self) -> Option<&str> {
    match self {
      CellValue::String(s) => Some(s),
      _ => None,
    }
  }

  fn discriminant(&self) -> u8 {
    match self {
      CellValue::Boolean(_) => 0,
      CellValue::Short(_) => 1,
      CellValue::Int(_) => 2,
      CellValue::Long(_) => 3,
      CellValue::Float(_) => 4,
      CellValue::Double(_) => 5,
      CellValue::String(_) => 6,
      CellValue::Bytes(_) => 7,
      CellValue::Row(_) => 8,
    }
  }
}

impl PartialEq for CellValue {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (CellValue::Boolean(a), CellValue::Boolean(b)) => a == b,
      (CellValue::Short(a), CellValue::Short(b)) => a == b,
      (CellValue::Int(a), CellValue::Int(b)) => a == b,
      (CellValue::Long(a), CellValue::Long(b)) => a == b,
      (CellValue::Float(a), CellValue::Float(b)) => a.to_bits() == b.to_bits(),
      (CellValue::Double(a), CellValue::Double(b)) => a.to_bits() == b.to_bits(),
      (CellValue::String(a), CellValue::String(b)) => a == b,
      (CellValue::Bytes(a), CellValue::Bytes(b)) => a == b,
      (CellValue::Row(a), CellValue::Row(b)) => a == b,
      _ => false,
    }
  }
}

impl Eq for CellValue {}

impl Hash for CellValue {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.discriminant().hash(state);
    match self {
      CellValue::Boolean(v) => v.hash(state),
      CellValue::Short(v) => v.hash(state),
      CellValue::Int(v) => v.hash(state),
      CellValue::Long(v) => v.hash(state),
      CellValue::Float(v) => v.to_bits().hash(state),
      CellValue::Double(v) => v.to_bits().hash(state),
      CellValue::String(v) => v.hash(state),
      CellValue::Bytes(v) => v.hash(state),
      CellValue::Row(v) => v.hash(state),
    }
  }
}

impl fmt::Display for CellValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CellValue::Boolean(v) => write!(f, "{}", v),
      CellValue::Short(v) => write!(f, "{}", v),
      CellValue::Int(v) => write!(f, "{}", v),
      CellValue::Long(v) => write!(f, "{}", v),
      CellValue::Float(v) => write!(f, "{}", v),
      CellValue::Double(v) => write!(f, "{}", v),
      CellValue::String(v) => write!(f, "{:?}", v),
      CellValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
      CellValue::Row(v) => write!(f, "{}", v),
    }
  }
}

impl From<bool> for CellValue {
  fn from(v: bool) -> Self {
    CellValue::Boolean(v)
  }
}

impl From<i16> for CellValue {
  fn from(v: i16) -> Self {
    CellValue::Short(v)
  }
}

impl From<i32> for CellValue {
  fn from(v: i32) -> Self {
    CellValue::Int(v)
  }
}

impl From<i64> for CellValue {
  fn from(v: i64) -> Self {
    CellValue::Long(v)
  }
}

impl From<f32> for CellValue {
  fn from(v: f32) -> Self {
    CellValue::Float(v)
  }
}

impl From<f64> for CellValue {
  fn from(v: f64) -> Self {
    CellValue::Double(v)
  }
}

impl From<&str> for CellValue {
  fn from(v: &str) -> Self {
    CellValue::String(v.to_string())
  }
}

impl From<String> for CellValue {
  fn from(v: String) -> Self {
    CellValue::String(v)
  }
}

impl From<Vec<u8>> for CellValue {
  fn from(v: Vec<u8>) -> Self {
    CellValue::Bytes(v)
  }
}

impl From<Row> for CellValue {
  fn from(v: Row) -> Self {
    CellValue::Row(v)
  }
}

/// A named value inside a [`Row`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
  name: String,
  value: CellValue,
}

impl Cell {
  /// Creates a new cell.
  pub fn new(name: impl Into<String>, value: impl Into<CellValue>) -> Self {
    Self {
      name: name.into(),
      value: value.into(),
    }
  }

  /// Returns the cell name.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Returns the cell value.
  pub fn value(&self) -> &CellValue {
    &self.value
  }
}

/// An immutable, ordered sequence of uniquely named cells.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Cell>", into = "Vec<Cell>")]
pub struct Row {
  cells: Vec<Cell>,
}

impl Row {
  /// Creates a row from cells, rejecting duplicate names.
  pub fn new(cells: Vec<Cell>) -> Result<Self, RowError> {
    for (i, cell) in cells.iter().enumerate() {
      if cells[..i].iter().any(|c| c.name == cell.name) {
        return Err(RowError::DuplicateCell(cell.name.clone()));
      }
    }
    Ok(Self { cells })
  }

  /// Creates a row with no cells.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Returns the cells in order.
  pub fn cells(&self) -> &[Cell] {
    &self.cells
  }

  /// Returns the number of cells.
  pub fn len(&self) -> usize {
    self.cells.len()
  }

  /// Returns `true` if the row has no cells.
  pub fn is_empty(&self) -> bool {
    self.cells.is_empty()
  }

  /// Returns the cell with the given name.
  pub fn cell(&self, name: &str) -> Option<&Cell> {
    self.cells.iter().find(|c| c.name == name)
  }

  /// Returns the value of the cell with the given name.
  pub fn get(&self, name: &str) -> Option<&CellValue> {
    self.cell(name).map(Cell::value)
  }

  /// Returns `true` if the row has a cell with the given name.
  pub fn contains(&self, name: &str) -> bool {
    self.cell(name).is_some()
  }

  /// Iterates over cell names in order.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.cells.iter().map(|c| c.name.as_str())
  }

  /// Returns a row holding only the named cells, in the order given.
  pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Result<Row, RowError> {
    let cells = names
      .iter()
      .map(|name| {
        self
          .cell(name.as_ref())
          .cloned()
          .ok_or_else(|| RowError::MissingCell(name.as_ref().to_string()))
      })
      .collect::<Result<Vec<_>, _>>()?;
    Row::new(cells)
  }

  /// Returns a row without any cell whose name appears in `other`.
  pub fn without(&self, other: &Row) -> Row {
    Row {
      cells: self
        .cells
        .iter()
        .filter(|c| !other.contains(&c.name))
        .cloned()
        .collect(),
    }
  }

  /// Appends the cells of `other` after the cells of this row.
  ///
  /// Fails with [`RowError::DuplicateCell`] on the first name present in both.
  pub fn concat(&self, other: &Row) -> Result<Row, RowError> {
    if let Some(clash) = other.names().find(|name| self.contains(name)) {
      return Err(RowError::DuplicateCell(clash.to_string()));
    }
    let mut cells = Vec::with_capacity(self.len() + other.len());
    cells.extend_from_slice(&self.cells);
    cells.extend_from_slice(&other.cells);
    Ok(Row { cells })
  }

  /// Appends a single cell.
  pub fn with_cell(&self, cell: Cell) -> Result<Row, RowError> {
    if self.contains(&cell.name) {
      return Err(RowError::DuplicateCell(cell.name));
    }
    let mut cells = self.cells.clone();
    cells.push(cell);
    Ok(Row { cells })
  }

  fn sorted(&self) -> Vec<&Cell> {
    let mut cells: Vec<&Cell> = self.cells.iter().collect();
    cells.sort_by(|a, b| a.name.cmp(&b.name));
    cells
  }
}

impl PartialEq for Row {
  fn eq(&self, other: &Self) -> bool {
    self.len() == other.len()
      && self
        .cells
        .iter()
        .all(|c| other.get(&c.name) == Some(&c.value))
  }
}

impl Eq for Row {}

impl Hash for Row {
  fn hash<H: Hasher>(&self, state: &mut H) {
    let sorted = self.sorted();
    sorted.len().hash(state);
    for cell in sorted {
      cell.hash(state);
    }
  }
}

impl TryFrom<Vec<Cell>> for Row {
  type Error = RowError;

  fn try_from(cells: Vec<Cell>) -> Result<Self, Self::Error> {
    Row::new(cells)
  }
}

impl From<Row> for Vec<Cell> {
  fn from(row: Row) -> Self {
    row.cells
  }
}

impl fmt::Display for Row {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{{")?;
    for (i, cell) in self.cells.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}: {}", cell.name, cell.value)?;
    }
    write!(f, "}}")
  }
}

/// Builds a [`Row`] from `name => value` pairs.
///
/// # Panics
///
/// Panics if two pairs share a name. Use [`Row::new`] for fallible construction.
#[macro_export]
macro_rules! row {
  () => {
    $crate::row::Row::empty()
  };
  ($($name:expr => $value:expr),+ $(,)?) => {
    match $crate::row::Row::new(vec![$($crate::row::Cell::new($name, $value)),+]) {
      Ok(row) => row,
      Err(e) => panic!("invalid row literal: {}", e),
    }
  };
}
