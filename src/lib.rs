//! ClusterKeeper: A Cluster-Safe Distributed Job Scheduler
//!
//! Runs named, recurring or one-shot jobs across a cluster of nodes that share
//! one key-value store. Each due occurrence executes on exactly one node, or on
//! every node for `multi` definitions, without any coordinator process.
//!
//! # Features
//!
//! - Schedule jobs using:
//!   - Human recurrence text (`every 5 minutes`, `every weekday at 9:30am`).
//!   - Cron expressions with 5, 6 or 7 fields, plus `@daily`-style names.
//!   - A unix timestamp for one-time execution.
//! - Optional `starts` / `ends` windows given as timestamps, RFC 3339 dates or
//!   phrases such as `in 2 hours` or `next monday at 9am`, and a `times` cap.
//! - Cluster coordination entirely through the shared store ([`ScheduleStore`]):
//!   a short-lived sweep lock, a time-ordered waiting set and a claim queue.
//! - Version hashes invalidate occurrences queued before a definition changed.
//! - Flush detection re-registers statically configured defaults.
//! - Exponential backoff (with optional jitter) for lock contention and store
//!   errors.
//! - An always-present event handler ([`ScheduleEvents`]) defaulting to logs.
//! - Built-in metrics collection (queryable snapshot using `MetricsSnapshot`).
//! - Optional task-local job context (`JobContext`) for job functions
//!   (requires the `job_context` feature).
//! - An in-process [`MemoryStore`] for tests and single-process clusters.
//!
//! # Usage
//!
//! ```no_run
//! use clusterkeeper::{job_fn, ClusterKeeper, DefinitionInput, JobOutcome, MemoryStore};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!   // Basic tracing setup (optional)
//!   // tracing_subscriber::fmt().with_env_filter("warn,clusterkeeper=info").init();
//!
//!   // Nodes sharing a store form a cluster.
//!   let store = MemoryStore::new();
//!   let counter = Arc::new(AtomicUsize::new(0));
//!
//!   let node = ClusterKeeper::builder()
//!     .store(store.clone())
//!     .process_interval(Duration::from_millis(250))
//!     .job("jobs.ping", |schedule| JobOutcome::ok(schedule.data))
//!     .build()?;
//!
//!   node.register_job(
//!     "jobs.count",
//!     job_fn!(|schedule| {
//!       let counter = counter.clone();
//!     } {
//!       let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
//!       Ok(serde_json::json!({ "schedule": schedule.name, "count": count }))
//!     }),
//!   );
//!
//!   node.start().await;
//!
//!   node
//!     .create_or_update(DefinitionInput::new("heartbeat", "jobs.count", "every 1 seconds"), false)
//!     .await?;
//!   node
//!     .create_or_update(
//!       DefinitionInput::new("report", "jobs.ping", "every weekday at 9am")
//!         .ends("in 30 days")
//!         .data(serde_json::json!({ "channel": "ops" })),
//!       false,
//!     )
//!     .await?;
//!
//!   tokio::time::sleep(Duration::from_secs(5)).await;
//!   println!("Metrics: {:#?}", node.get_metrics_snapshot());
//!
//!   node.destroy("heartbeat").await?;
//!   node.stop().await?;
//!   Ok(())
//! }
//! ```

pub mod backoff;
pub mod broadcast;
pub mod clock;
pub mod error;
pub mod events;
pub mod job;
mod macros;
pub mod metrics;
pub mod occurrence;
pub mod recurrence;
pub mod scheduler;
pub mod store;
pub mod version;

mod manager;
mod sweeper;
mod worker;

// --- Re-exports for convenience ---
pub use backoff::{BackoffPolicy, ExponentialRetries};
pub use broadcast::MultiEnvelope;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{BuildError, JobError, ScheduleError, ShutdownError, StoreError};
pub use events::{LoggingEvents, ScheduleEvents};
pub use job::{
  BoxedRunFn, DateInput, Definition, DefinitionInput, IntervalInput, JobOutcome, JobRegistry, JobResult,
};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use occurrence::OccurrenceRule;
pub use recurrence::Recurrence;
pub use scheduler::{ClusterKeeper, NodeState, SchedulerBuilder, SchedulerConfig};
pub use store::{Claim, KeySpace, MemoryStore, OccurrenceKey, ScheduleStore, SweepOutcome};

// Re-export context items if feature is enabled
#[cfg(feature = "job_context")]
pub use job::context::{try_get_current_job_context, JobContext};
