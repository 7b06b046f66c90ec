//! Partitioned aggregation runtime.
//!
//! Runs one worker task per partition, routes each record to the worker that
//! owns its key, and reports the outcome of every record so the caller can
//! advance its acknowledgment only for records that were durably applied.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use groupweave::aggregator::Aggregator;
//! use groupweave::config::AggregationConfig;
//! use groupweave::distribution::ShardedAggregation;
//! use groupweave::emitter::ChannelSink;
//! use groupweave::operator::KeyedRecord;
//! use groupweave::row;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let (sink, mut output) = ChannelSink::channel(64);
//! let mut runtime =
//!     ShardedAggregation::start(AggregationConfig::default(), Aggregator::Count, Arc::new(sink))?;
//! let mut outcomes = runtime.take_outcomes().expect("outcomes not taken yet");
//!
//! runtime
//!     .submit(KeyedRecord::new(row! { "user" => "a" }, row! { "user" => "a" }, 1u64))
//!     .await?;
//! let outcome = outcomes.recv().await.expect("worker reported");
//! if outcome.is_acknowledgeable() {
//!     // commit the inbound offset for outcome.sequence
//! }
//! let _combined = output.recv().await;
//! runtime.finish().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Ordering and ownership
//!
//! A key always maps to the same partition and each partition is served by a
//! single task reading a FIFO channel, so records of one key are processed one
//! at a time in submission order. Retryable failures are retried in place.
//!
//! A record that fails with a `Skip`-class error (malformed row, cell-name
//! collision) is dropped and the partition moves on. Any other failure that
//! survives the retries halts the partition: the worker processes nothing
//! further, every record still queued or submitted later is reported as
//! [`AggregateError::PartitionHalted`], and none of them is acknowledgeable. An
//! offset-style caller therefore never advances past the failed record, which
//! is redelivered after a restart.
//!
//! ## Shutdown
//!
//! [`shutdown`](ShardedAggregation::shutdown) cancels the workers between
//! records: the record being processed completes or aborts before its commit
//! point, queued records are left unprocessed (and unacknowledged).
//! [`finish`](ShardedAggregation::finish) instead closes the inbound channels
//! and lets every queued record drain first.

use crate::aggregator::Aggregator;
use crate::config::{AggregationConfig, ConfigError};
use crate::emitter::{OutputEmitter, OutputSink};
use crate::error::{AggregateError, ErrorAction};
use crate::operator::{GroupedAggregation, KeyedRecord, Processed};
use crate::partitioning::{PartitionId, Partitioner};
use crate::retry::RetryPolicy;
use crate::row::Key;
use crate::state::{RecoveryStats, SequenceNumber, StateStore, spawn_compaction};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of processing one submitted record.
#[derive(Debug)]
pub struct RecordOutcome {
  /// Partition that processed the record.
  pub partition: PartitionId,
  /// Key of the record.
  pub key: Key,
  /// Sequence (acknowledgment token) of the record.
  pub sequence: SequenceNumber,
  /// Number of attempts made.
  pub attempts: u32,
  /// What happened.
  pub result: Result<Processed, AggregateError>,
}

impl RecordOutcome {
  /// Returns `true` if the record is resolved and its inbound offset may be
  /// acknowledged: it was applied, had already been applied, or was dropped
  /// with a `Skip`-class error.
  pub fn is_acknowledgeable(&self) -> bool {
    match &self.result {
      Ok(_) => true,
      Err(e) => e.action() == ErrorAction::Skip,
    }
  }
}

/// Runs N partition workers over one shared operator and state store.
pub struct ShardedAggregation {
  name: String,
  partitioner: Partitioner,
  operator: Arc<GroupedAggregation>,
  /// One inbound sender per partition; dropped by `finish`.
  worker_txs: Vec<mpsc::Sender<KeyedRecord>>,
  outcomes: Option<mpsc::Receiver<RecordOutcome>>,
  /// Per-partition halt flags, set by the workers.
  halted: Arc<[AtomicBool]>,
  shutdown: CancellationToken,
  workers: Vec<JoinHandle<()>>,
  compaction: Option<JoinHandle<()>>,
  recovery: RecoveryStats,
}

impl ShardedAggregation {
  /// Opens the configured store, recovers it, and starts the workers.
  ///
  /// Must be called from within a tokio runtime.
  ///
  /// # Errors
  ///
  /// Returns an error if the config is invalid or the store cannot be opened
  /// or recovered.
  pub fn start(
    config: AggregationConfig,
    aggregator: Aggregator,
    sink: Arc<dyn OutputSink>,
  ) -> Result<Self, ConfigError> {
    config.validate()?;
    let store = config.store.open()?;
    Self::start_with_store(config, store, aggregator, sink)
  }

  /// Like [`start`](Self::start) but over an already opened store.
  pub fn start_with_store(
    config: AggregationConfig,
    store: Arc<dyn StateStore>,
    aggregator: Aggregator,
    sink: Arc<dyn OutputSink>,
  ) -> Result<Self, ConfigError> {
    config.validate()?;
    let partitioner = Partitioner::new(config.partitions)
      .ok_or_else(|| ConfigError::Invalid("partitions must be >= 1".to_string()))?;

    // Recovery runs before any record is accepted.
    let recovery = store.recover()?;

    let operator = Arc::new(GroupedAggregation::new(
      config.name.clone(),
      Arc::clone(&store),
      aggregator,
      OutputEmitter::new(sink),
    ));
    let shutdown = CancellationToken::new();
    let (outcome_tx, outcome_rx) = mpsc::channel(config.channel_capacity);
    let halted: Arc<[AtomicBool]> = (0..config.partitions).map(|_| AtomicBool::new(false)).collect();

    let mut worker_txs = Vec::with_capacity(config.partitions as usize);
    let mut workers = Vec::with_capacity(config.partitions as usize);
    for partition in 0..config.partitions {
      let (tx, rx) = mpsc::channel(config.channel_capacity);
      worker_txs.push(tx);
      workers.push(tokio::spawn(partition_worker(
        partition,
        rx,
        Arc::clone(&operator),
        config.retry.clone(),
        outcome_tx.clone(),
        Arc::clone(&halted),
        shutdown.clone(),
      )));
    }

    let compaction = config
      .compaction_interval()
      .map(|interval| spawn_compaction(Arc::clone(&store), interval, shutdown.child_token()));

    info!(
      name = %config.name,
      partitions = config.partitions,
      recovered_keys = recovery.keys,
      "grouped aggregation started"
    );

    Ok(Self {
      name: config.name,
      partitioner,
      operator,
      worker_txs,
      outcomes: Some(outcome_rx),
      halted,
      shutdown,
      workers,
      compaction,
      recovery,
    })
  }

  /// Routes `record` to the worker owning its key.
  ///
  /// Waits when that worker's channel is full. Fails with
  /// [`AggregateError::PartitionHalted`] if that partition is halted.
  pub async fn submit(&self, record: KeyedRecord) -> Result<PartitionId, AggregateError> {
    if self.shutdown.is_cancelled() {
      return Err(AggregateError::Shutdown);
    }
    let partition = self.partitioner.partition_for(&record.key);
    if self.is_halted(partition) {
      return Err(AggregateError::PartitionHalted { partition });
    }
    self.worker_txs[partition as usize]
      .send(record)
      .await
      .map_err(|_| AggregateError::Shutdown)?;
    Ok(partition)
  }

  /// Submits every record of `records` in order, waiting on backpressure.
  ///
  /// Returns the number of records submitted.
  pub async fn submit_all<S>(&self, records: S) -> Result<usize, AggregateError>
  where
    S: Stream<Item = KeyedRecord> + Send,
  {
    let mut records = Box::pin(records);
    let mut submitted = 0;
    while let Some(record) = records.next().await {
      self.submit(record).await?;
      submitted += 1;
    }
    Ok(submitted)
  }

  /// Takes the per-record outcomes as a stream.
  pub fn take_outcome_stream(&mut self) -> Option<ReceiverStream<RecordOutcome>> {
    self.take_outcomes().map(ReceiverStream::new)
  }

  /// Takes the receiver of per-record outcomes.
  ///
  /// The caller must keep draining it; workers wait when it is full.
  pub fn take_outcomes(&mut self) -> Option<mpsc::Receiver<RecordOutcome>> {
    self.outcomes.take()
  }

  /// Returns the shared operator, e.g. to query current aggregates.
  pub fn operator(&self) -> &Arc<GroupedAggregation> {
    &self.operator
  }

  /// Returns what startup recovery replayed.
  pub fn recovery_stats(&self) -> RecoveryStats {
    self.recovery
  }

  /// Returns `true` if `partition` stopped after an unrecoverable failure.
  pub fn is_halted(&self, partition: PartitionId) -> bool {
    self
      .halted
      .get(partition as usize)
      .is_some_and(|h| h.load(Ordering::SeqCst))
  }

  /// Returns the number of partitions.
  pub fn partition_count(&self) -> u32 {
    self.partitioner.partitions()
  }

  /// Stops accepting records, processes everything already queued, then stops.
  pub async fn finish(mut self) {
    self.outcomes = None;
    self.worker_txs.clear();
    for worker in self.workers.drain(..) {
      if let Err(e) = worker.await {
        error!(name = %self.name, error = %e, "partition worker failed");
      }
    }
    self.stop_background().await;
  }

  /// Stops the workers between records; queued records are not processed.
  pub async fn shutdown(mut self) {
    self.outcomes = None;
    self.shutdown.cancel();
    for worker in self.workers.drain(..) {
      if let Err(e) = worker.await {
        error!(name = %self.name, error = %e, "partition worker failed");
      }
    }
    self.stop_background().await;
  }

  async fn stop_background(&mut self) {
    self.shutdown.cancel();
    if let Some(compaction) = self.compaction.take() {
      if let Err(e) = compaction.await {
        error!(name = %self.name, error = %e, "compaction task failed");
      }
    }
    info!(name = %self.name, "grouped aggregation stopped");
  }
}

async fn partition_worker(
  partition: PartitionId,
  mut rx: mpsc::Receiver<KeyedRecord>,
  operator: Arc<GroupedAggregation>,
  retry: RetryPolicy,
  outcomes: mpsc::Sender<RecordOutcome>,
  halted: Arc<[AtomicBool]>,
  shutdown: CancellationToken,
) {
  debug!(operator = %operator.name(), partition, "partition worker started");
  let mut halt = false;
  loop {
    let record = tokio::select! {
      biased;
      _ = shutdown.cancelled() => break,
      next = rx.recv() => match next {
        Some(record) => record,
        None => break,
      },
    };
    let outcome = if halt {
      RecordOutcome {
        partition,
        key: record.key,
        sequence: record.sequence,
        attempts: 0,
        result: Err(AggregateError::PartitionHalted { partition }),
      }
    } else {
      let outcome = process_with_retry(partition, record, &operator, &retry, &shutdown).await;
      if let Err(e) = &outcome.result {
        if e.action() == ErrorAction::Skip {
          warn!(
            operator = %operator.name(),
            partition,
            sequence = outcome.sequence.as_u64(),
            error = %e,
            "record dropped"
          );
        } else if !shutdown.is_cancelled() {
          error!(
            operator = %operator.name(),
            partition,
            sequence = outcome.sequence.as_u64(),
            attempts = outcome.attempts,
            error = %e,
            "record failed, halting partition"
          );
          halt = true;
          halted[partition as usize].store(true, Ordering::SeqCst);
        }
      }
      outcome
    };
    if outcomes.send(outcome).await.is_err() {
      debug!(partition, "outcome receiver dropped");
    }
  }
  debug!(operator = %operator.name(), partition, "partition worker stopped");
}

async fn process_with_retry(
  partition: PartitionId,
  record: KeyedRecord,
  operator: &GroupedAggregation,
  retry: &RetryPolicy,
  shutdown: &CancellationToken,
) -> RecordOutcome {
  let key = record.key.clone();
  let sequence = record.sequence;
  let mut attempt = 1;
  loop {
    let result = operator.process(record.clone()).await;
    match result {
      Err(e) if e.is_retryable() && attempt < retry.max_attempts => {
        let delay = retry.delay_after(attempt);
        debug!(partition, sequence = sequence.as_u64(), attempt, ?delay, error = %e, "retrying record");
        tokio::select! {
          _ = shutdown.cancelled() => {
            return RecordOutcome { partition, key, sequence, attempts: attempt, result: Err(e) };
          }
          _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
      }
      result => {
        return RecordOutcome {
          partition,
          key,
          sequence,
          attempts: attempt,
          result,
        };
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::emitter::{OutputRecord, SinkError, VecSink};
  use crate::row;
  use crate::row::CellValue;
  use crate::state::{
    AggregateState, Changelog, ChangelogEntry, ChangelogStateStore, MemoryChangelog, StateError,
  };
  use async_trait::async_trait;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn user(name: &str) -> Key {
    row! { "user" => name }
  }

  #[tokio::test]
  async fn routes_every_key_to_a_single_partition_and_counts() {
    let sink = VecSink::new();
    let mut runtime = ShardedAggregation::start(
      AggregationConfig::default().with_partitions(3),
      Aggregator::Count,
      Arc::new(sink.clone()),
    )
    .unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();

    let users = ["a", "b", "c", "d"];
    let mut seq = 0u64;
    for _ in 0..5 {
      for u in users {
        seq += 1;
        runtime
          .submit(KeyedRecord::new(user(u), user(u), seq))
          .await
          .unwrap();
      }
    }

    let mut partitions = std::collections::HashMap::new();
    for _ in 0..seq {
      let outcome = outcomes.recv().await.unwrap();
      assert!(outcome.is_acknowledgeable());
      let p = partitions.entry(outcome.key.clone()).or_insert(outcome.partition);
      assert_eq!(*p, outcome.partition);
    }

    for u in users {
      assert_eq!(
        runtime.operator().current(&user(u)),
        Some(AggregateState::Count(5))
      );
      let counts: Vec<i64> = sink
        .rows()
        .iter()
        .filter(|r| r.get("user") == Some(&CellValue::from(u)))
        .filter_map(|r| r.get("count").and_then(CellValue::as_i64))
        .collect();
      assert_eq!(counts, vec![1, 2, 3, 4, 5]);
    }
    runtime.finish().await;
  }

  #[tokio::test]
  async fn submit_after_shutdown_is_rejected() {
    let runtime = ShardedAggregation::start(
      AggregationConfig::default(),
      Aggregator::Count,
      Arc::new(VecSink::new()),
    )
    .unwrap();
    runtime.shutdown.cancel();
    let err = runtime
      .submit(KeyedRecord::new(user("a"), user("a"), 1u64))
      .await
      .unwrap_err();
    assert!(matches!(err, AggregateError::Shutdown));
    runtime.shutdown().await;
  }

  #[tokio::test]
  async fn submits_a_stream_and_reports_outcomes_as_a_stream() {
    let sink = VecSink::new();
    let mut runtime = ShardedAggregation::start(
      AggregationConfig::default().with_partitions(2),
      Aggregator::Count,
      Arc::new(sink.clone()),
    )
    .unwrap();
    let outcomes = runtime.take_outcome_stream().unwrap();

    let records = futures::stream::iter(1..=6u64).map(|seq| {
      let who = if seq % 2 == 0 { "a" } else { "b" };
      KeyedRecord::new(user(who), user(who), seq)
    });
    assert_eq!(runtime.submit_all(records).await.unwrap(), 6);

    let outcomes: Vec<RecordOutcome> = outcomes.take(6).collect().await;
    assert!(outcomes.iter().all(RecordOutcome::is_acknowledgeable));
    assert_eq!(runtime.operator().current(&user("a")), Some(AggregateState::Count(3)));
    assert_eq!(runtime.operator().current(&user("b")), Some(AggregateState::Count(3)));
    runtime.finish().await;
  }

  #[test]
  fn invalid_config_is_rejected() {
    let result = ShardedAggregation::start(
      AggregationConfig::default().with_partitions(0),
      Aggregator::Count,
      Arc::new(VecSink::new()),
    );
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
  }

  /// Changelog failing the first `failures` appends.
  struct FailingFirst {
    inner: MemoryChangelog,
    failures: AtomicUsize,
  }

  impl Changelog for FailingFirst {
    fn append(&self, entry: &ChangelogEntry) -> Result<(), StateError> {
      let left = self.failures.load(Ordering::SeqCst);
      if left > 0 {
        self.failures.store(left - 1, Ordering::SeqCst);
        return Err(StateError::Io(std::io::Error::other("transient")));
      }
      self.inner.append(entry)
    }

    fn read_all(&self) -> Result<Vec<ChangelogEntry>, StateError> {
      self.inner.read_all()
    }

    fn rewrite(&self, entries: &[ChangelogEntry]) -> Result<(), StateError> {
      self.inner.rewrite(entries)
    }
  }

  fn failing_store(failures: usize) -> Arc<dyn StateStore> {
    Arc::new(ChangelogStateStore::new(FailingFirst {
      inner: MemoryChangelog::new(),
      failures: AtomicUsize::new(failures),
    }))
  }

  #[tokio::test]
  async fn transient_store_failures_are_retried_in_place() {
    let sink = VecSink::new();
    let config = AggregationConfig::default()
      .with_partitions(1)
      .with_retry(RetryPolicy::default().with_max_attempts(3).with_backoff(Duration::from_millis(1)));
    let mut runtime =
      ShardedAggregation::start_with_store(config, failing_store(2), Aggregator::Count, Arc::new(sink.clone()))
        .unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();

    runtime.submit(KeyedRecord::new(user("a"), user("a"), 1u64)).await.unwrap();
    let outcome = outcomes.recv().await.unwrap();
    assert!(outcome.is_acknowledgeable());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(sink.rows(), vec![row! { "user" => "a", "count" => 1i64 }]);
    runtime.finish().await;
  }

  #[tokio::test]
  async fn exhausted_retries_halt_the_partition() {
    let store = failing_store(2);
    let config = AggregationConfig::default()
      .with_partitions(1)
      .with_retry(RetryPolicy::default().with_max_attempts(2).with_backoff(Duration::from_millis(1)));
    let sink = VecSink::new();
    let mut runtime = ShardedAggregation::start_with_store(
      config.clone(),
      Arc::clone(&store),
      Aggregator::Count,
      Arc::new(sink.clone()),
    )
    .unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();

    runtime.submit(KeyedRecord::new(user("a"), user("a"), 1u64)).await.unwrap();
    runtime.submit(KeyedRecord::new(user("a"), user("a"), 2u64)).await.unwrap();

    let first = outcomes.recv().await.unwrap();
    assert!(!first.is_acknowledgeable());
    assert_eq!(first.attempts, 2);
    assert!(matches!(first.result, Err(AggregateError::StoreWrite(_))));

    // The later record of the same key must not overtake the failed one.
    let second = outcomes.recv().await.unwrap();
    assert!(!second.is_acknowledgeable());
    assert!(matches!(second.result, Err(AggregateError::PartitionHalted { partition: 0 })));
    assert!(runtime.is_halted(0));
    assert!(store.get(&user("a")).is_none());
    assert!(sink.rows().is_empty());

    let rejected = runtime
      .submit(KeyedRecord::new(user("a"), user("a"), 3u64))
      .await
      .unwrap_err();
    assert!(matches!(rejected, AggregateError::PartitionHalted { partition: 0 }));
    runtime.shutdown().await;

    // After a restart both unacknowledged records are redelivered and folded.
    let mut runtime =
      ShardedAggregation::start_with_store(config, store, Aggregator::Count, Arc::new(sink.clone()))
        .unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();
    runtime.submit(KeyedRecord::new(user("a"), user("a"), 1u64)).await.unwrap();
    runtime.submit(KeyedRecord::new(user("a"), user("a"), 2u64)).await.unwrap();
    assert!(outcomes.recv().await.unwrap().is_acknowledgeable());
    assert!(outcomes.recv().await.unwrap().is_acknowledgeable());
    assert_eq!(runtime.operator().current(&user("a")), Some(AggregateState::Count(2)));
    runtime.finish().await;
  }

  #[tokio::test]
  async fn skipped_records_do_not_halt_the_partition() {
    let sink = VecSink::new();
    let mut runtime = ShardedAggregation::start(
      AggregationConfig::default().with_partitions(1),
      Aggregator::Count,
      Arc::new(sink.clone()),
    )
    .unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();

    runtime.submit(KeyedRecord::new(user("a"), user("b"), 1u64)).await.unwrap();
    runtime.submit(KeyedRecord::new(user("a"), user("a"), 2u64)).await.unwrap();
    let dropped = outcomes.recv().await.unwrap();
    assert!(matches!(dropped.result, Err(AggregateError::MalformedRow { .. })));
    assert!(dropped.is_acknowledgeable());
    assert!(matches!(outcomes.recv().await.unwrap().result, Ok(Processed::Emitted(_))));
    assert!(!runtime.is_halted(0));
    runtime.finish().await;
  }

  /// Sink failing its first `failures` publishes.
  struct FlakySink {
    inner: VecSink,
    failures: AtomicUsize,
  }

  #[async_trait]
  impl OutputSink for FlakySink {
    async fn publish(&self, record: OutputRecord) -> Result<(), SinkError> {
      if self.failures.load(Ordering::SeqCst) > 0 {
        self.failures.fetch_sub(1, Ordering::SeqCst);
        return Err(SinkError::Other("down".to_string()));
      }
      self.inner.publish(record).await
    }
  }

  #[tokio::test]
  async fn failed_publish_is_retried_and_emitted_once() {
    let rows = VecSink::new();
    let sink = FlakySink {
      inner: rows.clone(),
      failures: AtomicUsize::new(1),
    };
    let config = AggregationConfig::default()
      .with_partitions(1)
      .with_retry(RetryPolicy::default().with_backoff(Duration::from_millis(1)));
    let mut runtime = ShardedAggregation::start(config, Aggregator::Count, Arc::new(sink)).unwrap();
    let mut outcomes = runtime.take_outcomes().unwrap();

    runtime.submit(KeyedRecord::new(user("a"), user("a"), 1u64)).await.unwrap();
    runtime.submit(KeyedRecord::new(user("a"), user("a"), 2u64)).await.unwrap();
    let first = outcomes.recv().await.unwrap();
    assert!(matches!(first.result, Ok(Processed::Emitted(_))));
    assert_eq!(first.attempts, 2);
    assert!(outcomes.recv().await.unwrap().is_acknowledgeable());
    runtime.finish().await;

    assert_eq!(
      rows.rows(),
      vec![
        row! { "user" => "a", "count" => 1i64 },
        row! { "user" => "a", "count" => 2i64 },
      ]
    );
  }

  /// Sink that takes `delay` per publish.
  struct SlowSink {
    inner: VecSink,
    delay: Duration,
  }

  #[async_trait]
  impl OutputSink for SlowSink {
    async fn publish(&self, record: OutputRecord) -> Result<(), SinkError> {
      tokio::time::sleep(self.delay).await;
      self.inner.publish(record).await
    }
  }

  fn slow_runtime(rows: &VecSink, delay: Duration) -> ShardedAggregation {
    let sink = SlowSink {
      inner: rows.clone(),
      delay,
    };
    ShardedAggregation::start(
      AggregationConfig::default().with_partitions(1),
      Aggregator::Count,
      Arc::new(sink),
    )
    .unwrap()
  }

  #[tokio::test]
  async fn shutdown_leaves_queued_records_unprocessed() {
    let rows = VecSink::new();
    let mut runtime = slow_runtime(&rows, Duration::from_millis(50));
    let mut outcomes = runtime.take_outcomes().unwrap();
    let store = Arc::clone(runtime.operator().store());

    for seq in 1..=5u64 {
      runtime.submit(KeyedRecord::new(user("a"), user("a"), seq)).await.unwrap();
    }
    assert!(outcomes.recv().await.unwrap().is_acknowledgeable());
    runtime.shutdown().await;

    let mut reported = 1;
    while let Some(outcome) = outcomes.recv().await {
      assert!(outcome.is_acknowledgeable());
      reported += 1;
    }
    assert!(reported < 5, "{} of 5 records processed", reported);

    // Everything emitted was committed and confirmed; nothing beyond.
    let emitted = rows.rows().len() as i64;
    assert_eq!(emitted, reported);
    let stored = store.get(&user("a")).unwrap();
    assert_eq!(stored.state, AggregateState::Count(emitted));
    assert!(stored.emitted);
  }

  #[tokio::test]
  async fn finish_drains_queued_records() {
    let rows = VecSink::new();
    let mut runtime = slow_runtime(&rows, Duration::from_millis(5));
    let mut outcomes = runtime.take_outcomes().unwrap();

    for seq in 1..=5u64 {
      runtime.submit(KeyedRecord::new(user("a"), user("a"), seq)).await.unwrap();
    }
    runtime.finish().await;

    let mut reported = 0;
    while let Some(outcome) = outcomes.recv().await {
      assert!(outcome.is_acknowledgeable());
      reported += 1;
    }
    assert_eq!(reported, 5);
    assert_eq!(rows.rows().last(), Some(&row! { "user" => "a", "count" => 5i64 }));
  }
}
