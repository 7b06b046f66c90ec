//! # Partitioning
//!
//! Assigns every grouping key to exactly one partition. A partition is the unit
//! of exclusive ownership: one worker processes all records of its partition
//! sequentially, so a key's aggregate is only ever updated by that worker.
//!
//! ## Usage
//!
//! ```rust
//! use groupweave::partitioning::Partitioner;
//! use groupweave::row;
//!
//! let partitioner = Partitioner::new(4).unwrap();
//! let key = row! { "user" => "a" };
//! let p = partitioner.partition_for(&key);
//! assert!(p < 4);
//! // The same key always lands on the same partition.
//! assert_eq!(p, partitioner.partition_for(&row! { "user" => "a" }));
//! ```

use crate::row::Key;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Index of a partition, `0..partitions`.
pub type PartitionId = u32;

/// Maps keys to partitions by hashing their cell set.
///
/// Because [`Row`](crate::row::Row) hashes order-independently, two keys with
/// the same cells in a different order share a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Partitioner {
  partitions: u32,
}

impl Partitioner {
  /// Creates a partitioner over `partitions` partitions.
  ///
  /// Returns `None` if `partitions` is zero.
  pub fn new(partitions: u32) -> Option<Self> {
    (partitions > 0).then_some(Self { partitions })
  }

  /// Returns the number of partitions.
  pub fn partitions(&self) -> u32 {
    self.partitions
  }

  /// Returns the partition owning `key`.
  pub fn partition_for(&self, key: &Key) -> PartitionId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % u64::from(self.partitions)) as PartitionId
  }
}
