#[cfg(feature = "job_context")]
pub mod context;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JobError, ScheduleError};
use crate::occurrence::{self, OccurrenceRule};
use crate::version;

// --- Public Type Aliases ---

/// Result a job settles with. The value is handed to `on_schedule_success`.
pub type JobResult = Result<Value, JobError>;

/// The callable registered under a job identifier (`runs`).
///
/// Receives a snapshot of the definition being executed (including its `data`
/// payload) and returns a [`JobOutcome`]. Panics inside deferred futures are
/// caught by the worker and reported as [`JobError::Panicked`].
pub type BoxedRunFn = Arc<dyn Fn(Definition) -> JobOutcome + Send + Sync + 'static>;

// --- Inputs ---

/// The `interval` of a definition.
///
/// A number is a one-shot unix timestamp (seconds); text is either human
/// recurrence text or a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntervalInput {
  Timestamp(i64),
  Text(String),
}

impl From<&str> for IntervalInput {
  fn from(text: &str) -> Self {
    IntervalInput::Text(text.to_string())
  }
}

impl From<String> for IntervalInput {
  fn from(text: String) -> Self {
    IntervalInput::Text(text)
  }
}

impl From<i64> for IntervalInput {
  fn from(secs: i64) -> Self {
    IntervalInput::Timestamp(secs)
  }
}

impl From<DateTime<Utc>> for IntervalInput {
  fn from(at: DateTime<Utc>) -> Self {
    IntervalInput::Timestamp(at.timestamp())
  }
}

impl fmt::Display for IntervalInput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      IntervalInput::Timestamp(secs) => write!(f, "{secs}"),
      IntervalInput::Text(text) => f.write_str(text),
    }
  }
}

/// A `starts` or `ends` bound as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateInput {
  /// Unix timestamp in seconds, used as-is.
  Timestamp(i64),
  Date(DateTime<Utc>),
  /// Human date phrase such as `in 5 minutes` or `next monday at 9am`.
  Phrase(String),
}

impl From<&str> for DateInput {
  fn from(phrase: &str) -> Self {
    DateInput::Phrase(phrase.to_string())
  }
}

impl From<String> for DateInput {
  fn from(phrase: String) -> Self {
    DateInput::Phrase(phrase)
  }
}

impl From<i64> for DateInput {
  fn from(secs: i64) -> Self {
    DateInput::Timestamp(secs)
  }
}

impl From<DateTime<Utc>> for DateInput {
  fn from(at: DateTime<Utc>) -> Self {
    DateInput::Date(at)
  }
}

impl fmt::Display for DateInput {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      DateInput::Timestamp(secs) => write!(f, "{secs}"),
      DateInput::Date(at) => f.write_str(&at.to_rfc3339()),
      DateInput::Phrase(phrase) => f.write_str(phrase),
    }
  }
}

fn default_enabled() -> bool {
  true
}

/// A definition as submitted through `create_or_update` or listed in
/// `SchedulerConfig::schedules`.
///
/// Use [`DefinitionInput::new`] and the chained setters to build one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefinitionInput {
  /// Unique name of the definition.
  #[serde(default)]
  pub name: String,
  /// Identifier of the registered job to run.
  #[serde(default)]
  pub runs: String,
  #[serde(default)]
  pub interval: Option<IntervalInput>,
  #[serde(default)]
  pub starts: Option<DateInput>,
  #[serde(default)]
  pub ends: Option<DateInput>,
  /// Caps the number of executions when no `ends` is given.
  #[serde(default)]
  pub times: Option<u32>,
  /// Opaque payload handed to the job on every run.
  #[serde(default)]
  pub data: Value,
  /// Run on every node instead of once per cluster.
  #[serde(default)]
  pub multi: bool,
  #[serde(default = "default_enabled")]
  pub enabled: bool,
  /// Clamp `starts` to now and reject windows that already ended.
  #[serde(default)]
  pub forward_dates_only: bool,
}

impl DefinitionInput {
  pub fn new(name: impl Into<String>, runs: impl Into<String>, interval: impl Into<IntervalInput>) -> Self {
    Self {
      name: name.into(),
      runs: runs.into(),
      interval: Some(interval.into()),
      starts: None,
      ends: None,
      times: None,
      data: Value::Null,
      multi: false,
      enabled: true,
      forward_dates_only: false,
    }
  }

  pub fn starts(mut self, starts: impl Into<DateInput>) -> Self {
    self.starts = Some(starts.into());
    self
  }

  pub fn ends(mut self, ends: impl Into<DateInput>) -> Self {
    self.ends = Some(ends.into());
    self
  }

  pub fn times(mut self, times: u32) -> Self {
    self.times = Some(times);
    self
  }

  pub fn data(mut self, data: Value) -> Self {
    self.data = data;
    self
  }

  pub fn multi(mut self, multi: bool) -> Self {
    self.multi = multi;
    self
  }

  pub fn enabled(mut self, enabled: bool) -> Self {
    self.enabled = enabled;
    self
  }

  pub fn forward_dates_only(mut self, forward_dates_only: bool) -> Self {
    self.forward_dates_only = forward_dates_only;
    self
  }

  /// Checks the required fields, in the order they are reported.
  pub fn validate(&self) -> Result<(), ScheduleError> {
    if self.name.trim().is_empty() {
      return Err(ScheduleError::MissingName);
    }
    if self.runs.trim().is_empty() {
      return Err(ScheduleError::MissingRuns);
    }
    match &self.interval {
      None => Err(ScheduleError::MissingInterval),
      Some(IntervalInput::Text(text)) if text.trim().is_empty() => Err(ScheduleError::MissingInterval),
      Some(_) => Ok(()),
    }
  }
}

// --- Stored definition ---

/// A validated definition as persisted in the shared store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
  pub name: String,
  pub runs: String,
  pub interval: IntervalInput,
  pub starts: Option<DateInput>,
  pub ends: Option<DateInput>,
  pub times: Option<u32>,
  pub data: Value,
  pub multi: bool,
  pub enabled: bool,
  pub forward_dates_only: bool,
  /// Fingerprint of the timing fields; see [`crate::version::version_hash`].
  pub version_hash: String,
  pub occurrence: OccurrenceRule,
  pub times_ran: u64,
  /// `None` until the first execution.
  pub last_ran: Option<DateTime<Utc>>,
  /// Due time of the most recently claimed occurrence.
  #[serde(default)]
  pub last_due: Option<DateTime<Utc>>,
}

impl Definition {
  /// Validates and parses `input` into a fresh definition with zeroed counters.
  pub fn from_input(input: DefinitionInput, now: DateTime<Utc>) -> Result<Self, ScheduleError> {
    input.validate()?;
    let occurrence = occurrence::parse(&input, now)?;
    let interval = input.interval.ok_or(ScheduleError::MissingInterval)?;
    let version_hash =
      version::version_hash(&input.name, &interval, input.starts.as_ref(), input.ends.as_ref());
    Ok(Self {
      name: input.name,
      runs: input.runs,
      interval,
      starts: input.starts,
      ends: input.ends,
      times: input.times,
      data: input.data,
      multi: input.multi,
      enabled: input.enabled,
      forward_dates_only: input.forward_dates_only,
      version_hash,
      occurrence,
      times_ran: 0,
      last_ran: None,
      last_due: None,
    })
  }

  /// The next due time currently recorded on the occurrence rule.
  pub fn next(&self) -> Option<DateTime<Utc>> {
    self.occurrence.next()
  }
}

// --- Job outcomes ---

/// What a job callable hands back to the worker.
pub enum JobOutcome {
  /// Settled synchronously, successfully or with an error.
  Ready(JobResult),
  /// Settles later.
  Deferred(BoxFuture<'static, JobResult>),
}

impl JobOutcome {
  pub fn ok(value: impl Into<Value>) -> Self {
    JobOutcome::Ready(Ok(value.into()))
  }

  pub fn err(error: JobError) -> Self {
    JobOutcome::Ready(Err(error))
  }

  pub fn deferred<F>(future: F) -> Self
  where
    F: Future<Output = JobResult> + Send + 'static,
  {
    JobOutcome::Deferred(Box::pin(future))
  }
}

impl From<JobResult> for JobOutcome {
  fn from(result: JobResult) -> Self {
    JobOutcome::Ready(result)
  }
}

impl fmt::Debug for JobOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      JobOutcome::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
      JobOutcome::Deferred(_) => f.write_str("Deferred(..)"),
    }
  }
}

// --- Registry ---

/// Explicit mapping from job identifier to callable, resolved at invocation time.
#[derive(Default)]
pub struct JobRegistry {
  jobs: RwLock<HashMap<String, BoxedRunFn>>,
}

impl JobRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registers (or replaces) the callable for `runs`.
  pub fn register<F>(&self, runs: impl Into<String>, job: F)
  where
    F: Fn(Definition) -> JobOutcome + Send + Sync + 'static,
  {
    self.jobs.write().insert(runs.into(), Arc::new(job));
  }

  pub fn unregister(&self, runs: &str) -> bool {
    self.jobs.write().remove(runs).is_some()
  }

  pub fn resolve(&self, runs: &str) -> Option<BoxedRunFn> {
    self.jobs.read().get(runs).cloned()
  }

  pub fn contains(&self, runs: &str) -> bool {
    self.jobs.read().contains_key(runs)
  }
}

impl fmt::Debug for JobRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let jobs = self.jobs.read();
    let mut names: Vec<&String> = jobs.keys().collect();
    names.sort();
    f.debug_struct("JobRegistry").field("jobs", &names).finish()
  }
}
