use groupweave::aggregator::{Aggregator, SumReducer};
use groupweave::config::{AggregationConfig, StoreBackend};
use groupweave::distribution::{RecordOutcome, ShardedAggregation};
use groupweave::emitter::VecSink;
use groupweave::error::AggregateError;
use groupweave::operator::{KeyedRecord, Processed};
use groupweave::row;
use groupweave::row::{Key, Row};
use groupweave::state::{AggregateState, SequenceNumber};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn user(name: &str) -> Key {
  row! { "user" => name }
}

fn click(name: &str, value: i64, seq: u64) -> KeyedRecord {
  KeyedRecord::group_by(row! { "user" => name, "value" => value }, &["user"], seq).unwrap()
}

fn file_config(path: &Path) -> AggregationConfig {
  AggregationConfig::default()
    .with_name("clicks")
    .with_partitions(2)
    .with_store(StoreBackend::Changelog {
      path: path.to_path_buf(),
      sync_on_write: false,
    })
}

async fn drain(outcomes: &mut mpsc::Receiver<RecordOutcome>, n: usize) -> Vec<RecordOutcome> {
  let mut out = Vec::with_capacity(n);
  for _ in 0..n {
    out.push(outcomes.recv().await.unwrap());
  }
  out
}

#[tokio::test]
async fn count_emits_running_totals_per_user() {
  let sink = VecSink::new();
  let mut runtime = ShardedAggregation::start(
    AggregationConfig::default(),
    Aggregator::Count,
    Arc::new(sink.clone()),
  )
  .unwrap();
  let mut outcomes = runtime.take_outcomes().unwrap();

  for (seq, who) in ["a", "a", "b", "a"].into_iter().enumerate() {
    runtime.submit(click(who, 1, seq as u64 + 1)).await.unwrap();
  }
  drain(&mut outcomes, 4).await;
  runtime.finish().await;

  let rows_for = |who: &str| -> Vec<Row> {
    sink
      .records()
      .into_iter()
      .filter(|r| r.key == user(who))
      .map(|r| r.row)
      .collect()
  };
  assert_eq!(
    rows_for("a"),
    vec![
      row! { "user" => "a", "count" => 1i64 },
      row! { "user" => "a", "count" => 2i64 },
      row! { "user" => "a", "count" => 3i64 },
    ]
  );
  assert_eq!(rows_for("b"), vec![row! { "user" => "b", "count" => 1i64 }]);
}

#[tokio::test]
async fn reduce_sums_values_and_survives_restart() {
  let tmp = TempDir::new().unwrap();
  let log = tmp.path().join("clicks.jsonl");

  let sink = VecSink::new();
  let mut runtime = ShardedAggregation::start(
    file_config(&log),
    Aggregator::reduce(SumReducer),
    Arc::new(sink.clone()),
  )
  .unwrap();
  let mut outcomes = runtime.take_outcomes().unwrap();
  runtime.submit(click("a", 2, 1)).await.unwrap();
  runtime.submit(click("a", 5, 2)).await.unwrap();
  drain(&mut outcomes, 2).await;
  runtime.finish().await;
  assert_eq!(
    sink.rows(),
    vec![
      row! { "user" => "a", "value" => 2i64 },
      row! { "user" => "a", "value" => 7i64 },
    ]
  );

  // Restart: offset 2 was never acknowledged upstream, so it is redelivered.
  let sink = VecSink::new();
  let mut runtime = ShardedAggregation::start(
    file_config(&log),
    Aggregator::reduce(SumReducer),
    Arc::new(sink.clone()),
  )
  .unwrap();
  assert_eq!(runtime.recovery_stats().keys, 1);
  assert_eq!(
    runtime.operator().current(&user("a")),
    Some(AggregateState::Row(row! { "value" => 7i64 }))
  );
  let mut outcomes = runtime.take_outcomes().unwrap();
  runtime.submit(click("a", 5, 2)).await.unwrap();
  runtime.submit(click("a", 11, 3)).await.unwrap();
  let results = drain(&mut outcomes, 2).await;
  runtime.finish().await;

  assert!(matches!(
    results[0].result,
    Ok(Processed::Duplicate { sequence, applied })
      if sequence == SequenceNumber::new(2) && applied == SequenceNumber::new(2)
  ));
  assert!(matches!(results[1].result, Ok(Processed::Emitted(_))));
  assert_eq!(sink.rows(), vec![row! { "user" => "a", "value" => 18i64 }]);
}

#[tokio::test]
async fn malformed_records_are_dropped_without_blocking_the_key() {
  let sink = VecSink::new();
  let mut runtime = ShardedAggregation::start(
    AggregationConfig::default().with_partitions(1),
    Aggregator::Count,
    Arc::new(sink.clone()),
  )
  .unwrap();
  let mut outcomes = runtime.take_outcomes().unwrap();

  runtime.submit(click("a", 1, 1)).await.unwrap();
  // Empty row: malformed, skipped.
  runtime
    .submit(KeyedRecord::new(user("a"), Row::empty(), 2u64))
    .await
    .unwrap();
  runtime.submit(click("a", 1, 3)).await.unwrap();
  let results = drain(&mut outcomes, 3).await;
  runtime.finish().await;

  assert!(results.iter().all(RecordOutcome::is_acknowledgeable));
  assert!(matches!(results[1].result, Err(AggregateError::MalformedRow { .. })));
  assert_eq!(
    sink.rows(),
    vec![
      row! { "user" => "a", "count" => 1i64 },
      row! { "user" => "a", "count" => 2i64 },
    ]
  );
}

#[tokio::test]
async fn background_compaction_keeps_one_entry_per_key() {
  let tmp = TempDir::new().unwrap();
  let log = tmp.path().join("clicks.jsonl");
  let config = file_config(&log).with_compaction_interval(Duration::from_millis(10));

  let mut runtime =
    ShardedAggregation::start(config, Aggregator::Count, Arc::new(VecSink::new())).unwrap();
  let mut outcomes = runtime.take_outcomes().unwrap();
  for seq in 1..=20u64 {
    let who = if seq % 2 == 0 { "a" } else { "b" };
    runtime.submit(click(who, 1, seq)).await.unwrap();
  }
  drain(&mut outcomes, 20).await;
  tokio::time::sleep(Duration::from_millis(200)).await;
  runtime.finish().await;

  let lines = std::fs::read_to_string(&log).unwrap().lines().count();
  assert_eq!(lines, 2);

  let runtime =
    ShardedAggregation::start(file_config(&log), Aggregator::Count, Arc::new(VecSink::new()))
      .unwrap();
  assert_eq!(runtime.operator().current(&user("a")), Some(AggregateState::Count(10)));
  assert_eq!(runtime.operator().current(&user("b")), Some(AggregateState::Count(10)));
  runtime.shutdown().await;
}
