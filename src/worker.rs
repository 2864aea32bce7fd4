use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::backoff::{BackoffPolicy, ExponentialRetries};
use crate::broadcast::MultiBroadcaster;
use crate::error::{JobError, StoreError};
use crate::events::ScheduleEvents;
use crate::job::{Definition, JobOutcome, JobRegistry, JobResult};
use crate::manager::DefinitionManager;
use crate::metrics::SchedulerMetrics;
use crate::store::{Claim, OccurrenceKey};

#[cfg(feature = "job_context")]
use crate::job::context::{JobContext, CURRENT_JOB_CONTEXT};

/// Returns true when the shutdown flag was raised or its sender is gone.
pub(crate) fn shutdown_requested(changed: Result<(), watch::error::RecvError>, rx: &watch::Receiver<bool>) -> bool {
  changed.is_err() || *rx.borrow()
}

/// Runs registered jobs and reports their outcome.
///
/// Shared by claimed executions and multi broadcast echoes.
#[derive(Clone)]
pub(crate) struct Executor {
  registry: Arc<JobRegistry>,
  events: Arc<dyn ScheduleEvents>,
  metrics: SchedulerMetrics,
  node_id: String,
}

impl Executor {
  pub fn new(
    registry: Arc<JobRegistry>,
    events: Arc<dyn ScheduleEvents>,
    metrics: SchedulerMetrics,
    node_id: String,
  ) -> Self {
    Self {
      registry,
      events,
      metrics,
      node_id,
    }
  }

  /// Resolves and runs the job of `definition`, then fires the matching event.
  ///
  /// `occurrence` is `None` for broadcast echoes.
  pub async fn execute(&self, definition: &Definition, occurrence: Option<&OccurrenceKey>) -> JobResult {
    let occurrence_id = occurrence.map(OccurrenceKey::id);
    let echo = occurrence.is_none();
    let span = tracing::span!(
      tracing::Level::INFO,
      "schedule_exec",
      node_id = %self.node_id,
      schedule = %definition.name,
      runs = %definition.runs,
      occurrence = occurrence_id.as_deref().unwrap_or("-"),
      echo
    );

    async move {
      let started = Instant::now();
      let result = match self.registry.resolve(&definition.runs) {
        Some(job) => self.invoke(job, definition.clone(), occurrence_id, echo).await,
        None => Err(JobError::NotRegistered(definition.runs.clone())),
      };
      let duration = started.elapsed();
      self.metrics.job_execution_duration.record(duration);

      match &result {
        Ok(value) => {
          SchedulerMetrics::incr(&self.metrics.jobs_succeeded);
          debug!(duration_ms = duration.as_millis() as u64, "Job succeeded.");
          self.events.on_schedule_success(definition, value);
        }
        Err(e) => {
          if matches!(e, JobError::Panicked) {
            SchedulerMetrics::incr(&self.metrics.jobs_panicked);
          }
          SchedulerMetrics::incr(&self.metrics.jobs_failed);
          debug!(duration_ms = duration.as_millis() as u64, error = %e, "Job failed.");
          self.events.on_schedule_failure(definition, e);
        }
      }
      result
    }
    .instrument(span)
    .await
  }

  /// Calls the job and awaits its outcome on a separate task so panics in
  /// either the call or the deferred future are contained.
  async fn invoke(
    &self,
    job: crate::job::BoxedRunFn,
    definition: Definition,
    occurrence_id: Option<String>,
    echo: bool,
  ) -> JobResult {
    let schedule = definition.name.clone();
    let task = async move {
      match job(definition) {
        JobOutcome::Ready(result) => result,
        JobOutcome::Deferred(future) => future.await,
      }
    };

    #[cfg(feature = "job_context")]
    let handle = {
      let context = JobContext {
        schedule,
        occurrence: occurrence_id,
        node_id: self.node_id.clone(),
        echo,
      };
      tokio::spawn(CURRENT_JOB_CONTEXT.scope(context, task).in_current_span())
    };
    #[cfg(not(feature = "job_context"))]
    let handle = {
      let _ = (schedule, occurrence_id, echo);
      tokio::spawn(task.in_current_span())
    };

    match handle.await {
      Ok(result) => result,
      Err(join_error) if join_error.is_panic() => {
        error!("Job panicked.");
        Err(JobError::Panicked)
      }
      Err(_) => {
        warn!("Job task was cancelled during execution.");
        Err(JobError::failed("job task was cancelled"))
      }
    }
  }
}

/// Pops claimed occurrences off the shared queue and executes them.
pub(crate) struct ConsumptionLoop {
  manager: DefinitionManager,
  executor: Executor,
  broadcaster: MultiBroadcaster,
  metrics: SchedulerMetrics,
  node_id: String,
  error_backoff: BackoffPolicy,
  /// Error tracks keyed by occurrence id, alive while that occurrence is processed.
  retries: ExponentialRetries,
}

impl ConsumptionLoop {
  pub fn new(
    manager: DefinitionManager,
    executor: Executor,
    broadcaster: MultiBroadcaster,
    metrics: SchedulerMetrics,
    node_id: String,
    error_backoff: BackoffPolicy,
  ) -> Self {
    Self {
      manager,
      executor,
      broadcaster,
      metrics,
      node_id,
      error_backoff,
      retries: ExponentialRetries::new(),
    }
  }

  /// Claims occurrences until shutdown. Each claim is processed on its own
  /// task, so the next claim is requested before the job settles.
  pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
    info!(node_id = %self.node_id, "Consumer started. Waiting for occurrences...");
    let this = Arc::new(self);

    loop {
      let claimed = tokio::select! {
        biased;

        changed = shutdown_rx.changed() => {
          if shutdown_requested(changed, &shutdown_rx) {
            debug!(node_id = %this.node_id, "Consumer received shutdown signal.");
            break;
          }
          continue;
        }

        claimed = this.manager.store().claim(this.manager.keys(), this.manager.lock_time()) => claimed,
      };

      match claimed {
        Ok(Claim::Fresh(occurrence)) => {
          SchedulerMetrics::incr(&this.metrics.occurrences_claimed);
          trace!(node_id = %this.node_id, occurrence = %occurrence.id(), "Claimed occurrence.");
          let worker = this.clone();
          let shutdown_rx = shutdown_rx.clone();
          tokio::spawn(async move {
            worker.process(occurrence, shutdown_rx).await;
          });
        }
        Ok(Claim::Redelivered(occurrence)) => {
          SchedulerMetrics::incr(&this.metrics.duplicates_absorbed);
          debug!(node_id = %this.node_id, occurrence = %occurrence.id(), "Ignoring redelivered occurrence.");
        }
        Err(StoreError::Disconnected) => {
          warn!(node_id = %this.node_id, "Store disconnected, consumer waiting for it to become ready.");
          tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
              if shutdown_requested(changed, &shutdown_rx) {
                break;
              }
            }

            _ = this.manager.store().wait_ready() => {
              info!(node_id = %this.node_id, "Store ready again, consumer resuming.");
            }
          }
        }
        Err(e) => {
          SchedulerMetrics::incr(&this.metrics.store_errors);
          error!(node_id = %this.node_id, error = %e, "Failed to claim occurrence.");
          tokio::task::yield_now().await;
        }
      }
    }

    info!(node_id = %this.node_id, "Consumer stopped.");
  }

  /// Executes one claimed occurrence end to end.
  ///
  /// The claim already took the occurrence off the queue, so every store call
  /// that keeps the series alive is retried under the error backoff until it
  /// succeeds or shutdown is requested.
  pub(crate) async fn process(&self, occurrence: OccurrenceKey, mut shutdown_rx: watch::Receiver<bool>) {
    let track = occurrence.id();
    if self.run_occurrence(&occurrence, &track, &mut shutdown_rx).await.is_none() {
      warn!(
        occurrence = %track,
        "Shutdown while retrying store calls, occurrence left to expire from the active set."
      );
    }
    self.retries.remove(&track);
  }

  /// Returns `None` when shutdown interrupted a retry.
  async fn run_occurrence(
    &self,
    occurrence: &OccurrenceKey,
    track: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
  ) -> Option<()> {
    let store = self.manager.store();
    let keys = self.manager.keys();

    let current = loop {
      match store.get_definition(keys, &occurrence.name).await {
        Ok(current) => break current,
        Err(e) => self.retry_after(track, "load schedule", e, shutdown_rx).await?,
      }
    };

    let mut definition = match current {
      Some(definition) if definition.version_hash == occurrence.version_hash && definition.enabled => definition,
      other => {
        SchedulerMetrics::incr(&self.metrics.occurrences_discarded_stale);
        debug!(
          occurrence = %track,
          exists = other.is_some(),
          "Discarding occurrence of a removed, disabled or redefined schedule."
        );
        return self.complete(occurrence, track, shutdown_rx).await;
      }
    };

    definition.times_ran += 1;
    definition.last_ran = Some(self.manager.now());
    definition.last_due = Some(occurrence.due);
    definition.occurrence.mark_once_completed();

    // Advance the series before running so a slow or crashing job cannot stall it.
    while let Err(e) = self.manager.schedule_next(&mut definition).await {
      self.retry_after(track, "schedule next occurrence", e, shutdown_rx).await?;
    }

    if definition.multi {
      self.broadcaster.publish(&definition).await;
    }

    let _ = self.executor.execute(&definition, Some(occurrence)).await;
    self.complete(occurrence, track, shutdown_rx).await?;

    let latest = loop {
      match store.get_definition(keys, &occurrence.name).await {
        Ok(latest) => break latest,
        Err(e) => self.retry_after(track, "reload schedule", e, shutdown_rx).await?,
      }
    };
    match latest {
      Some(mut latest)
        if latest.version_hash == occurrence.version_hash
          && latest.enabled
          && !latest.occurrence.is_completed_once() =>
      {
        while let Err(e) = self.manager.schedule_next(&mut latest).await {
          self.retry_after(track, "schedule next occurrence", e, shutdown_rx).await?;
        }
      }
      _ => {
        trace!(occurrence = %track, "Schedule finished or changed, not rescheduling after run.");
      }
    }
    Some(())
  }

  async fn complete(
    &self,
    occurrence: &OccurrenceKey,
    track: &str,
    shutdown_rx: &mut watch::Receiver<bool>,
  ) -> Option<()> {
    while let Err(e) = self
      .manager
      .store()
      .complete(self.manager.keys(), occurrence, self.manager.lock_time())
      .await
    {
      self.retry_after(track, "complete occurrence", e, shutdown_rx).await?;
    }
    Some(())
  }

  /// Counts a failed store call and waits out the next delay of `track`
  /// (and, after a disconnect, for the store to be ready again).
  /// Returns `None` once shutdown is requested.
  async fn retry_after(
    &self,
    track: &str,
    action: &str,
    error: StoreError,
    shutdown_rx: &mut watch::Receiver<bool>,
  ) -> Option<()> {
    SchedulerMetrics::incr(&self.metrics.store_errors);
    if self.retries.step(track).is_none() {
      self.retries.create(track, self.error_backoff);
    }
    let delay = self.retries.get_delay(track);
    let disconnected = matches!(error, StoreError::Disconnected);
    warn!(
      occurrence = %track,
      action,
      error = %error,
      delay_ms = delay.as_millis() as u64,
      "Store call failed, retrying."
    );

    if *shutdown_rx.borrow() {
      return None;
    }
    let pause = async {
      if disconnected {
        self.manager.store().wait_ready().await;
      }
      tokio::time::sleep(delay).await;
    };
    tokio::select! {
      biased;

      changed = shutdown_rx.changed() => {
        if shutdown_requested(changed, shutdown_rx) {
          return None;
        }
      }

      _ = pause => {}
    }
    Some(())
  }
}
