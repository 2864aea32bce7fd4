//! tests/common.rs
//! Shared helper functions for integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::BoxStream;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing_subscriber::fmt::TestWriter;
use tracing_subscriber::EnvFilter;

use clusterkeeper::{
  job_fn, BackoffPolicy, Claim, ClusterKeeper, Definition, JobError, JobOutcome, KeySpace, MemoryStore,
  OccurrenceKey, ScheduleEvents, ScheduleStore, SchedulerConfig, StoreError, SweepOutcome,
};

// Initializes tracing subscriber for test output.
pub fn setup_tracing() {
  // Use try_init to avoid panic if called multiple times
  let _ = tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("clusterkeeper=debug")))
    .with_writer(TestWriter::new())
    .try_init();
}

// Fast sweep cadence and short error backoff so tests settle within seconds.
pub fn test_config() -> SchedulerConfig {
  SchedulerConfig {
    process_interval_ms: 50,
    error_backoff: BackoffPolicy {
      base_ms: 100,
      max_steps: 3,
      jitter: None,
    },
    ..SchedulerConfig::default()
  }
}

// Builds a node over the shared `store`.
pub fn build_node(store: &MemoryStore, node_id: &str) -> ClusterKeeper {
  build_node_with(store, node_id, test_config(), RecordingEvents::default())
}

pub fn build_node_with(
  store: &MemoryStore,
  node_id: &str,
  config: SchedulerConfig,
  events: RecordingEvents,
) -> ClusterKeeper {
  ClusterKeeper::builder()
    .store(store.clone())
    .config(config)
    .events(events)
    .node_id(node_id)
    .build()
    .expect("Failed to build node")
}

// Unix timestamp `secs` seconds from now.
pub fn in_secs(secs: i64) -> i64 {
  (Utc::now() + ChronoDuration::seconds(secs)).timestamp()
}

// A job that increments `counter` and reports the new count.
pub fn counting_job(counter: Arc<AtomicUsize>) -> impl Fn(Definition) -> JobOutcome + Send + Sync + 'static {
  job_fn!(|schedule| {
    let counter = counter.clone();
  } {
    let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!(schedule = %schedule.name, count, "Counter job executing");
    Ok(json!({ "count": count }))
  })
}

// A job that panics after yielding once.
pub fn panicking_job() -> impl Fn(Definition) -> JobOutcome + Send + Sync + 'static {
  job_fn!(|_schedule| {
    tokio::task::yield_now().await;
    let forced = true;
    if forced {
      panic!("Job forced panic!");
    }
    Ok(Value::Null)
  })
}

/// Records every outcome reported to the events handler.
#[derive(Clone, Default)]
pub struct RecordingEvents {
  pub successes: Arc<Mutex<Vec<(String, Value)>>>,
  pub failures: Arc<Mutex<Vec<(String, JobError)>>>,
}

impl ScheduleEvents for RecordingEvents {
  fn on_schedule_success(&self, schedule: &Definition, result: &Value) {
    self.successes.lock().push((schedule.name.clone(), result.clone()));
  }

  fn on_schedule_failure(&self, schedule: &Definition, error: &JobError) {
    self.failures.lock().push((schedule.name.clone(), error.clone()));
  }
}

/// A [`MemoryStore`] whose next definition loads or progress saves can be
/// made to fail.
#[derive(Clone, Default)]
pub struct FlakyStore {
  pub inner: MemoryStore,
  failing_loads: Arc<AtomicUsize>,
  failing_saves: Arc<AtomicUsize>,
}

impl FlakyStore {
  pub fn fail_next_loads(&self, count: usize) {
    self.failing_loads.store(count, Ordering::SeqCst);
  }

  pub fn fail_next_saves(&self, count: usize) {
    self.failing_saves.store(count, Ordering::SeqCst);
  }

  fn take_failure(counter: &AtomicUsize) -> Result<(), StoreError> {
    match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)) {
      Ok(_) => Err(StoreError::Backend("injected failure".to_string())),
      Err(_) => Ok(()),
    }
  }
}

#[async_trait]
impl ScheduleStore for FlakyStore {
  async fn get_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError> {
    Self::take_failure(&self.failing_loads)?;
    self.inner.get_definition(keys, name).await
  }

  async fn all_definitions(&self, keys: &KeySpace) -> Result<Vec<Definition>, StoreError> {
    self.inner.all_definitions(keys).await
  }

  async fn create_definition(&self, keys: &KeySpace, definition: &Definition) -> Result<bool, StoreError> {
    self.inner.create_definition(keys, definition).await
  }

  async fn replace_definition(
    &self,
    keys: &KeySpace,
    definition: &Definition,
  ) -> Result<Option<Definition>, StoreError> {
    self.inner.replace_definition(keys, definition).await
  }

  async fn save_progress(&self, keys: &KeySpace, definition: &Definition) -> Result<Option<Definition>, StoreError> {
    Self::take_failure(&self.failing_saves)?;
    self.inner.save_progress(keys, definition).await
  }

  async fn delete_definition(&self, keys: &KeySpace, name: &str) -> Result<Option<Definition>, StoreError> {
    self.inner.delete_definition(keys, name).await
  }

  async fn schedule_occurrence(&self, keys: &KeySpace, occurrence: &OccurrenceKey) -> Result<bool, StoreError> {
    self.inner.schedule_occurrence(keys, occurrence).await
  }

  async fn remove_waiting(&self, keys: &KeySpace, member: &str) -> Result<bool, StoreError> {
    self.inner.remove_waiting(keys, member).await
  }

  async fn sweep(
    &self,
    keys: &KeySpace,
    now: DateTime<Utc>,
    node_id: &str,
    lock_ttl: StdDuration,
  ) -> Result<SweepOutcome, StoreError> {
    self.inner.sweep(keys, now, node_id, lock_ttl).await
  }

  async fn touch_sentinel(&self, keys: &KeySpace, node_id: &str) -> Result<bool, StoreError> {
    self.inner.touch_sentinel(keys, node_id).await
  }

  async fn claim(&self, keys: &KeySpace, lock_time: StdDuration) -> Result<Claim, StoreError> {
    self.inner.claim(keys, lock_time).await
  }

  async fn complete(
    &self,
    keys: &KeySpace,
    occurrence: &OccurrenceKey,
    lock_time: StdDuration,
  ) -> Result<(), StoreError> {
    self.inner.complete(keys, occurrence, lock_time).await
  }

  async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
    self.inner.publish(channel, payload).await
  }

  async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, StoreError> {
    self.inner.subscribe(channel).await
  }

  async fn wait_ready(&self) {
    self.inner.wait_ready().await
  }
}
