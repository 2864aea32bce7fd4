//! tests/basic.rs
//! Basic scheduling tests (one-time, recurring, capped, destroy)

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{build_node, counting_job, in_secs, setup_tracing};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;

use clusterkeeper::{DefinitionInput, JobOutcome, MemoryStore, OccurrenceRule, ScheduleError};

#[tokio::test]
async fn test_one_time_job_runs_once() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");
  let counter = Arc::new(AtomicUsize::new(0));
  node.register_job("jobs.once", counting_job(counter.clone()));
  node.start().await;

  let created = node
    .create_or_update(DefinitionInput::new("once", "jobs.once", in_secs(2)), false)
    .await
    .expect("Failed to create schedule");
  assert!(matches!(created.occurrence, OccurrenceRule::Once(_)));
  assert!(created.next().is_some());

  tokio::time::sleep(StdDuration::from_millis(4_500)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 1, "One-shot should run exactly once");
  let stored = node.find_one("once").await.unwrap().expect("definition should remain");
  assert!(stored.occurrence.is_completed_once());
  assert_eq!(stored.times_ran, 1);
  assert!(stored.last_ran.is_some());
  assert_eq!(stored.next(), None);

  let metrics = node.get_metrics_snapshot();
  assert_eq!(metrics.jobs_succeeded, 1);
  assert_eq!(metrics.occurrences_claimed, 1);

  node.stop().await.unwrap();
}

#[tokio::test]
async fn test_past_timestamp_is_rejected() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");

  let result = node
    .create_or_update(DefinitionInput::new("late", "jobs.late", in_secs(-5)), false)
    .await;
  assert!(matches!(result, Err(ScheduleError::PastTimestamp(_))));
  assert!(node.find_all().await.unwrap().is_empty(), "Rejected definitions are never stored");
}

#[tokio::test]
async fn test_validation_errors_are_synchronous() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");

  let missing_runs = node
    .create_or_update(DefinitionInput::new("nameless-job", "", "every 1 seconds"), false)
    .await;
  assert!(matches!(missing_runs, Err(ScheduleError::MissingRuns)));

  let garbage = node
    .create_or_update(DefinitionInput::new("garbage", "jobs.x", "whenever you feel like it"), false)
    .await;
  assert!(matches!(garbage, Err(ScheduleError::InvalidSchedule(_))));

  let bad_end = node
    .create_or_update(
      DefinitionInput::new("bad-end", "jobs.x", "every 1 minutes").ends("sometime soonish"),
      false,
    )
    .await;
  assert!(matches!(bad_end, Err(ScheduleError::InvalidEndDate(_))));
  assert!(node.find_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_every_second_runs_repeatedly_with_data() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");
  let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
  let seen_clone = seen.clone();
  node.register_job("jobs.echo", move |schedule| {
    seen_clone.lock().push(schedule.data.clone());
    JobOutcome::ok(schedule.data)
  });
  node.start().await;

  node
    .create_or_update(
      DefinitionInput::new("ticker", "jobs.echo", "every 1 seconds").data(json!({ "region": "eu" })),
      false,
    )
    .await
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(3_600)).await;
  node.stop().await.unwrap();
  // Let any occurrence claimed just before the stop settle.
  tokio::time::sleep(StdDuration::from_millis(200)).await;

  let runs = seen.lock().clone();
  assert!(runs.len() >= 2, "Expected at least two runs, got {}", runs.len());
  assert!(runs.iter().all(|data| *data == json!({ "region": "eu" })));

  let stored = node.find_one("ticker").await.unwrap().unwrap();
  assert_eq!(stored.times_ran as usize, runs.len());
  let next = stored.next().expect("recurring schedule keeps a next occurrence");
  assert!(next > stored.last_due.unwrap());
}

#[tokio::test]
async fn test_times_caps_executions() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");
  let counter = Arc::new(AtomicUsize::new(0));
  node.register_job("jobs.capped", counting_job(counter.clone()));
  node.start().await;

  node
    .create_or_update(DefinitionInput::new("capped", "jobs.capped", "every 1 seconds").times(2), false)
    .await
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(5_000)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 2, "times = 2 must run exactly twice");
  let stored = node.find_one("capped").await.unwrap().unwrap();
  assert_eq!(stored.times_ran, 2);
  assert_eq!(stored.next(), None);

  node.stop().await.unwrap();
}

#[tokio::test]
async fn test_future_start_delays_first_run() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");

  let starts = Utc::now() + ChronoDuration::hours(3);
  let created = node
    .create_or_update(
      DefinitionInput::new("later", "jobs.later", "every 1 minutes").starts(starts),
      false,
    )
    .await
    .unwrap();
  let next = created.next().unwrap();
  assert!(next >= starts);
  assert!(next - starts <= ChronoDuration::minutes(1));
}

#[tokio::test]
async fn test_destroy_removes_definition_and_waiting_entry() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");
  let keys = clusterkeeper::KeySpace::new("schedule", false);

  node
    .create_or_update(DefinitionInput::new("doomed", "jobs.doomed", "every 1 hours"), false)
    .await
    .unwrap();
  assert_eq!(store.waiting_len(&keys), 1);

  assert!(node.destroy("doomed").await.unwrap());
  assert!(node.find_one("doomed").await.unwrap().is_none());
  assert_eq!(store.waiting_len(&keys), 0);
  assert!(!node.destroy("doomed").await.unwrap(), "Second destroy finds nothing");
}
