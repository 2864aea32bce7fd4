use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors raised while validating or parsing a schedule definition.
///
/// These are returned synchronously from `ClusterKeeper::create_or_update` and
/// from [`crate::occurrence::parse`]; a definition failing validation never
/// reaches the shared store.
#[derive(Error, Debug)]
pub enum ScheduleError {
  #[error("Missing schedule name.")]
  MissingName,
  #[error("Missing schedule 'runs' property.")]
  MissingRuns,
  #[error("Missing schedule 'interval' property.")]
  MissingInterval,
  #[error("Invalid schedule provided: {0}")]
  InvalidSchedule(String),
  #[error("Error parsing 'starting from' value of '{0}'. Did you forget to use a keyword such as 'in'?")]
  InvalidStartDate(String),
  #[error("Error parsing 'until' value of '{0}'. Did you forget to use a keyword such as 'in'?")]
  InvalidEndDate(String),
  #[error("Timestamp interval provided must not be in the past - you provided an interval of '{0}'")]
  PastTimestamp(DateTime<Utc>),
  #[error("No more occurrences possible, are the start and end values correct?")]
  ExhaustedWindow,
  #[error("The schedule ends in the past ({0}) and cannot be processed with 'forward_dates_only' enabled.")]
  PastWindow(DateTime<Utc>),
  #[error("Failed to persist schedule: {0}")]
  Store(#[from] StoreError),
}

/// Errors reported by a [`crate::store::ScheduleStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
  #[error("Shared store connection is not ready.")]
  Disconnected,
  #[error("Failed to (de)serialize stored value: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("Shared store error: {0}")]
  Backend(String),
}

/// Failure of a single job execution, routed to `on_schedule_failure`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
  #[error("No job registered under '{0}', expected a registered job identifier.")]
  NotRegistered(String),
  #[error("Job failed: {0}")]
  Failed(String),
  #[error("Job panicked during execution.")]
  Panicked,
}

impl JobError {
  /// Convenience constructor for job implementations.
  pub fn failed(reason: impl Into<String>) -> Self {
    JobError::Failed(reason.into())
  }
}

/// Errors that can occur while building a scheduler node with `SchedulerBuilder`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
  #[error("A shared store must be provided via `SchedulerBuilder::store`")]
  MissingStore,
  #[error("`process_interval` must be greater than zero")]
  ZeroProcessInterval,
}

/// Errors related to stopping a scheduler node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShutdownError {
  #[error("Scheduler node is already stopped.")]
  AlreadyStopped,
  #[error("A sweep, consumer or broadcast task panicked during shutdown.")]
  TaskPanic,
}
