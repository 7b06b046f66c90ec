//! # Grouped Count Example
//!
//! Counts page views per user with a file-backed state store, then restarts the
//! runtime over the same changelog to show that counts continue where they left
//! off and that a redelivered record is not counted twice.
//!
//! Run with `RUST_LOG=debug cargo run --example grouped_count` to see the
//! store and worker logs. An optional argument names a JSON config file.

use groupweave::aggregator::Aggregator;
use groupweave::config::{AggregationConfig, StoreBackend};
use groupweave::distribution::ShardedAggregation;
use groupweave::emitter::ChannelSink;
use groupweave::operator::{KeyedRecord, Processed};
use groupweave::row;
use groupweave::row::Row;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn page_views() -> Vec<Row> {
  vec![
    row! { "user" => "alice", "page" => "/home" },
    row! { "user" => "bob", "page" => "/home" },
    row! { "user" => "alice", "page" => "/docs" },
    row! { "user" => "carol", "page" => "/pricing" },
    row! { "user" => "alice", "page" => "/pricing" },
    row! { "user" => "bob", "page" => "/docs" },
  ]
}

async fn run(config: AggregationConfig, records: Vec<KeyedRecord>) -> Result<(), BoxError> {
  let (sink, mut output) = ChannelSink::channel(64);
  let mut runtime = ShardedAggregation::start(config, Aggregator::Count, Arc::new(sink))?;
  println!("recovered: {:?}", runtime.recovery_stats());

  let printer = tokio::spawn(async move {
    while let Some(record) = output.recv().await {
      println!("  emitted {}", record.row);
    }
  });

  let expected = records.len();
  let mut outcomes = runtime
    .take_outcome_stream()
    .ok_or("outcomes already taken")?;
  runtime.submit_all(tokio_stream::iter(records)).await?;

  for _ in 0..expected {
    let Some(outcome) = outcomes.next().await else {
      break;
    };
    match outcome.result {
      Ok(Processed::Emitted(_)) => {}
      Ok(Processed::Duplicate { sequence, .. }) => {
        println!("  offset {} already applied, acknowledging", sequence.as_u64());
      }
      Err(e) => println!("  offset {} failed: {}", outcome.sequence.as_u64(), e),
    }
  }

  runtime.finish().await;
  printer.await?;
  Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .init();

  let dir = tempfile::tempdir()?;
  let config = match std::env::args().nth(1) {
    Some(path) => AggregationConfig::from_json_file(path)?,
    None => AggregationConfig::default()
      .with_name("page-views")
      .with_store(StoreBackend::Changelog {
        path: dir.path().join("page_views.jsonl"),
        sync_on_write: true,
      }),
  };

  let mut records = Vec::new();
  for (offset, view) in page_views().into_iter().enumerate() {
    records.push(KeyedRecord::group_by(view, &["user"], offset as u64 + 1)?);
  }

  println!("first run");
  run(config.clone(), records[..4].to_vec()).await?;

  // Offset 4 is redelivered after the restart.
  println!("second run");
  run(config, records[3..].to_vec()).await?;
  Ok(())
}
