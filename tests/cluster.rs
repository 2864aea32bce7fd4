//! tests/cluster.rs
//! Multi-node behaviour over one shared store.

mod common;

use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};
use std::time::Duration as StdDuration;

use crate::common::{build_node, build_node_with, counting_job, in_secs, setup_tracing, test_config, RecordingEvents};
use chrono::{Duration as ChronoDuration, Utc};

use clusterkeeper::{
  DefinitionInput, KeySpace, MemoryStore, OccurrenceKey, ScheduleStore, SchedulerConfig, SweepOutcome,
};

#[tokio::test]
async fn test_racing_sweepers_move_each_entry_once() {
  setup_tracing();
  let store = MemoryStore::new();
  let keys = KeySpace::new("race", false);
  let due = Utc::now() - ChronoDuration::seconds(1);
  store
    .schedule_occurrence(&keys, &OccurrenceKey::new("report", "v1", due))
    .await
    .unwrap();

  let mut handles = Vec::new();
  for i in 0..8 {
    let store = store.clone();
    let keys = keys.clone();
    handles.push(tokio::spawn(async move {
      store
        .sweep(&keys, Utc::now(), &format!("node-{i}"), StdDuration::from_secs(5))
        .await
        .unwrap()
    }));
  }

  let mut movers = 0;
  let mut locked = 0;
  for handle in handles {
    match handle.await.unwrap() {
      SweepOutcome::Swept { moved, .. } if moved > 0 => movers += 1,
      SweepOutcome::Swept { .. } => {}
      SweepOutcome::Locked { .. } => locked += 1,
    }
  }
  assert_eq!(movers, 1, "Exactly one sweeper may move the due entry");
  assert_eq!(locked, 7);
  assert_eq!(store.queued_len(&keys), 1);
}

#[tokio::test]
async fn test_occurrence_runs_on_one_node_only() {
  setup_tracing();
  let store = MemoryStore::new();
  let counters: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
  let mut nodes = Vec::new();
  for (i, counter) in counters.iter().enumerate() {
    let node = build_node(&store, &format!("node-{i}"));
    node.register_job("jobs.single", counting_job(counter.clone()));
    node.start().await;
    nodes.push(node);
  }

  nodes[0]
    .create_or_update(DefinitionInput::new("single", "jobs.single", in_secs(2)), false)
    .await
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(4_000)).await;

  let total: usize = counters.iter().map(|c| c.load(Ordering::SeqCst)).sum();
  assert_eq!(total, 1, "A plain occurrence executes once cluster-wide");

  for node in &nodes {
    node.stop().await.unwrap();
  }
}

#[tokio::test]
async fn test_multi_schedule_runs_on_every_node() {
  setup_tracing();
  let store = MemoryStore::new();
  let counter_a = Arc::new(AtomicUsize::new(0));
  let counter_b = Arc::new(AtomicUsize::new(0));

  let node_a = build_node(&store, "node-a");
  node_a.register_job("jobs.multi", counting_job(counter_a.clone()));
  let node_b = build_node(&store, "node-b");
  node_b.register_job("jobs.multi", counting_job(counter_b.clone()));
  node_a.start().await;
  node_b.start().await;

  node_a
    .create_or_update(DefinitionInput::new("fanout", "jobs.multi", in_secs(2)).multi(true), false)
    .await
    .unwrap();

  tokio::time::sleep(StdDuration::from_millis(4_000)).await;

  assert_eq!(counter_a.load(Ordering::SeqCst), 1);
  assert_eq!(counter_b.load(Ordering::SeqCst), 1);

  let a = node_a.get_metrics_snapshot();
  let b = node_b.get_metrics_snapshot();
  assert_eq!(a.multi_sent + b.multi_sent, 1);
  assert_eq!(a.multi_received + b.multi_received, 1);
  assert_eq!(a.occurrences_claimed + b.occurrences_claimed, 1, "Echoes never claim occurrences");

  node_a.stop().await.unwrap();
  node_b.stop().await.unwrap();
}

#[tokio::test]
async fn test_defaults_re_registered_after_flush() {
  setup_tracing();
  let store = MemoryStore::new();
  let config = SchedulerConfig {
    schedules: vec![
      DefinitionInput::new("nightly", "jobs.nightly", "every day at 3am"),
      DefinitionInput::new("hourly", "jobs.hourly", "@hourly"),
    ],
    ..test_config()
  };
  let node = build_node_with(&store, "node-a", config, RecordingEvents::default());
  node.start().await;

  let names = |defs: Vec<clusterkeeper::Definition>| defs.into_iter().map(|d| d.name).collect::<Vec<_>>();
  assert_eq!(names(node.find_all().await.unwrap()), vec!["hourly", "nightly"]);

  for _ in 0..2 {
    store.flush_all();
    tokio::time::sleep(StdDuration::from_millis(300)).await;
    assert_eq!(
      names(node.find_all().await.unwrap()),
      vec!["hourly", "nightly"],
      "Defaults are restored once per name"
    );
  }
  assert_eq!(
    node.get_metrics_snapshot().flushes_detected,
    2,
    "Startup on a fresh store is not counted as a flush"
  );

  node.stop().await.unwrap();
}

#[tokio::test]
async fn test_defaults_never_overwrite_dynamic_updates() {
  setup_tracing();
  let store = MemoryStore::new();
  let config = SchedulerConfig {
    schedules: vec![DefinitionInput::new("report", "jobs.report", "every day at 3am")],
    ..test_config()
  };

  let first = build_node_with(&store, "node-a", config.clone(), RecordingEvents::default());
  first.start().await;
  first
    .create_or_update(
      DefinitionInput::new("report", "jobs.report", "every day at 5am").data(serde_json::json!({ "v": 2 })),
      false,
    )
    .await
    .unwrap();

  // A second node starting with the same defaults must not clobber the update.
  let second = build_node_with(&store, "node-b", config, RecordingEvents::default());
  second.start().await;
  let stored = second.find_one("report").await.unwrap().unwrap();
  assert_eq!(stored.data, serde_json::json!({ "v": 2 }));

  first.stop().await.unwrap();
  second.stop().await.unwrap();
}

#[tokio::test]
async fn test_resumes_after_disconnect() {
  setup_tracing();
  let store = MemoryStore::new();
  let node = build_node(&store, "node-a");
  let counter = Arc::new(AtomicUsize::new(0));
  node.register_job("jobs.resume", counting_job(counter.clone()));
  node.start().await;

  tokio::time::sleep(StdDuration::from_millis(100)).await;
  store.set_connected(false);
  tokio::time::sleep(StdDuration::from_millis(300)).await;
  assert!(node.get_metrics_snapshot().store_errors > 0, "Sweeps fail while disconnected");
  store.set_connected(true);

  node
    .create_or_update(DefinitionInput::new("after-outage", "jobs.resume", in_secs(2)), false)
    .await
    .unwrap();
  tokio::time::sleep(StdDuration::from_millis(4_000)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 1);
  node.stop().await.unwrap();
}

#[tokio::test]
async fn test_stale_occurrences_are_discarded() {
  setup_tracing();
  let store = MemoryStore::new();
  let keys = KeySpace::new("schedule", false);
  let node = build_node(&store, "node-a");
  let counter = Arc::new(AtomicUsize::new(0));
  node.register_job("jobs.stale", counting_job(counter.clone()));

  node
    .create_or_update(DefinitionInput::new("stale", "jobs.stale", "every day at 3am"), false)
    .await
    .unwrap();
  node.start().await;

  let now = Utc::now();
  store.enqueue_raw(&keys, OccurrenceKey::new("stale", "outdated-hash", now).id());
  store.enqueue_raw(&keys, OccurrenceKey::new("vanished", "any-hash", now).id());
  tokio::time::sleep(StdDuration::from_millis(300)).await;

  assert_eq!(counter.load(Ordering::SeqCst), 0);
  let metrics = node.get_metrics_snapshot();
  assert_eq!(metrics.occurrences_discarded_stale, 2);
  assert_eq!(metrics.jobs_succeeded + metrics.jobs_failed, 0);

  node.stop().await.unwrap();
}
