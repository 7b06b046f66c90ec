//! Runtime configuration.
//!
//! [`AggregationConfig`] selects the state-store backend, the number of
//! partitions, channel sizes, compaction cadence and the retry policy. It can be
//! built in code with the `with_*` setters or loaded from JSON:
//!
//! ```json
//! {
//!   "partitions": 8,
//!   "store": { "type": "changelog", "path": "/var/lib/agg/changelog.jsonl" },
//!   "compaction_interval_ms": 60000,
//!   "retry": { "max_attempts": 5, "backoff_ms": 50 }
//! }
//! ```
//!
//! The aggregator kind is not part of this file: a reducer is code and is passed
//! to [`ShardedAggregation::start`](crate::distribution::ShardedAggregation::start)
//! directly.

use crate::retry::RetryPolicy;
use crate::state::{
  ChangelogStateStore, FileChangelog, InMemoryStateStore, StateError, StateStore,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// Reading the config file failed.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// The config file is not valid JSON for this schema.
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
  /// A value is out of range.
  #[error("invalid config: {0}")]
  Invalid(String),
  /// The configured store could not be opened.
  #[error("store error: {0}")]
  Store(#[from] StateError),
}

/// State-store backend selection.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
  /// Memory only; state is lost when the process exits.
  #[default]
  InMemory,
  /// Changelog file replayed at startup.
  Changelog {
    /// Path of the changelog file.
    path: PathBuf,
    /// Flush every append to stable storage.
    #[serde(default = "default_sync_on_write")]
    sync_on_write: bool,
  },
}

fn default_sync_on_write() -> bool {
  true
}

impl StoreBackend {
  /// Opens the backend. The store is not recovered yet; call
  /// [`StateStore::recover`] before the first update.
  pub fn open(&self) -> Result<Arc<dyn StateStore>, StateError> {
    Ok(match self {
      StoreBackend::InMemory => Arc::new(InMemoryStateStore::in_memory()),
      StoreBackend::Changelog {
        path,
        sync_on_write,
      } => Arc::new(ChangelogStateStore::new(FileChangelog::open(
        path,
        *sync_on_write,
      )?)),
    })
  }
}

/// Configuration of a [`ShardedAggregation`](crate::distribution::ShardedAggregation).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
  /// Name used in logs.
  pub name: String,
  /// Number of partition workers.
  pub partitions: u32,
  /// Capacity of each worker's inbound channel and of the outcome channel.
  pub channel_capacity: usize,
  /// State-store backend.
  pub store: StoreBackend,
  /// Interval between background compactions; `None` disables them.
  pub compaction_interval_ms: Option<u64>,
  /// Retry policy for retryable failures.
  pub retry: RetryPolicy,
}

impl Default for AggregationConfig {
  fn default() -> Self {
    Self {
      name: "grouped-aggregation".to_string(),
      partitions: 4,
      channel_capacity: 64,
      store: StoreBackend::default(),
      compaction_interval_ms: None,
      retry: RetryPolicy::default(),
    }
  }
}

impl AggregationConfig {
  /// Loads and validates a JSON config file.
  pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
    let data = std::fs::read_to_string(path)?;
    Self::from_json_str(&data)
  }

  /// Parses and validates a JSON config document.
  pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(data)?;
    config.validate()?;
    Ok(config)
  }

  /// Checks value ranges.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.partitions == 0 {
      return Err(ConfigError::Invalid("partitions must be >= 1".to_string()));
    }
    if self.channel_capacity == 0 {
      return Err(ConfigError::Invalid(
        "channel_capacity must be >= 1".to_string(),
      ));
    }
    if self.retry.max_attempts == 0 {
      return Err(ConfigError::Invalid(
        "retry.max_attempts must be >= 1".to_string(),
      ));
    }
    if self.compaction_interval_ms == Some(0) {
      return Err(ConfigError::Invalid(
        "compaction_interval_ms must be > 0".to_string(),
      ));
    }
    Ok(())
  }

  /// Sets the name used in logs.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  /// Sets the number of partitions.
  pub fn with_partitions(mut self, n: u32) -> Self {
    self.partitions = n;
    self
  }

  /// Sets the channel capacity.
  pub fn with_channel_capacity(mut self, n: usize) -> Self {
    self.channel_capacity = n;
    self
  }

  /// Sets the store backend.
  pub fn with_store(mut self, store: StoreBackend) -> Self {
    self.store = store;
    self
  }

  /// Enables background compaction at the given interval.
  pub fn with_compaction_interval(mut self, d: Duration) -> Self {
    self.compaction_interval_ms = Some(d.as_millis() as u64);
    self
  }

  /// Sets the retry policy.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Compaction interval as a [`Duration`].
  pub fn compaction_interval(&self) -> Option<Duration> {
    self.compaction_interval_ms.map(Duration::from_millis)
  }
}
