use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::{BackoffPolicy, ExponentialRetries};
use crate::job::DefinitionInput;
use crate::manager::DefinitionManager;
use crate::metrics::SchedulerMetrics;
use crate::store::SweepOutcome;

/// Backoff track used while another node holds the sweep lock.
pub(crate) const LOCK_TRACK: &str = "lock";
/// Backoff track used after store errors.
pub(crate) const ERROR_TRACK: &str = "error";

/// Periodic, cluster-coordinated promotion of due occurrences into the queue.
pub(crate) struct SweepEngine {
  manager: DefinitionManager,
  node_id: String,
  process_interval: StdDuration,
  lock_ttl: StdDuration,
  defaults: Arc<Vec<DefinitionInput>>,
  backoff: ExponentialRetries,
  metrics: SchedulerMetrics,
}

impl SweepEngine {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    manager: DefinitionManager,
    node_id: String,
    process_interval: StdDuration,
    lock_ttl: StdDuration,
    defaults: Arc<Vec<DefinitionInput>>,
    lock_backoff: BackoffPolicy,
    error_backoff: BackoffPolicy,
    metrics: SchedulerMetrics,
  ) -> Self {
    let backoff = ExponentialRetries::new();
    backoff.create(LOCK_TRACK, lock_backoff);
    backoff.create(ERROR_TRACK, error_backoff);
    Self {
      manager,
      node_id,
      process_interval,
      lock_ttl,
      defaults,
      backoff,
      metrics,
    }
  }

  /// Runs until the shutdown flag flips to `true` (or its sender is dropped).
  pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
    info!(node_id = %self.node_id, "Sweeper started.");
    let mut delay = self.process_interval;

    loop {
      tokio::select! {
        biased;

        changed = shutdown_rx.changed() => {
          if changed.is_err() || *shutdown_rx.borrow() {
            debug!(node_id = %self.node_id, "Sweeper received shutdown signal.");
            break;
          }
        }

        _ = sleep(delay) => {
          delay = self.tick().await;
        }
      }
    }

    info!(node_id = %self.node_id, "Sweeper stopped.");
  }

  /// Performs one sweep attempt and returns the delay before the next.
  pub async fn tick(&self) -> StdDuration {
    let started = Instant::now();
    let outcome = self
      .manager
      .store()
      .sweep(self.manager.keys(), self.manager.now(), &self.node_id, self.lock_ttl)
      .await;

    match outcome {
      Ok(SweepOutcome::Locked { holder }) => {
        SchedulerMetrics::incr(&self.metrics.sweep_lock_contention);
        let delay = self.process_interval + self.backoff.get_delay(LOCK_TRACK);
        debug!(
          node_id = %self.node_id,
          %holder,
          delay_ms = delay.as_millis() as u64,
          "Sweep skipped, lock held by another node."
        );
        delay
      }
      Ok(SweepOutcome::Swept { moved, flushed }) => {
        self.backoff.reset(ERROR_TRACK);
        self.backoff.reset(LOCK_TRACK);
        SchedulerMetrics::incr(&self.metrics.sweeps_run);
        self.metrics.occurrences_moved.fetch_add(moved, Ordering::Relaxed);

        if flushed {
          SchedulerMetrics::incr(&self.metrics.flushes_detected);
          warn!(
            node_id = %self.node_id,
            defaults = self.defaults.len(),
            "Flush sentinel missing, re-registering default schedules."
          );
          let registered = self.manager.register_defaults(&self.defaults).await;
          debug!(registered, "Default schedules re-registered.");
        }

        let elapsed = started.elapsed();
        self.metrics.sweep_duration.record(elapsed);
        if moved > 0 {
          debug!(node_id = %self.node_id, moved, elapsed_us = elapsed.as_micros() as u64, "Sweep moved occurrences.");
        } else {
          trace!(node_id = %self.node_id, "Sweep found nothing due.");
        }
        self.process_interval + self.backoff.get_delay(LOCK_TRACK)
      }
      Err(e) => {
        SchedulerMetrics::incr(&self.metrics.store_errors);
        let delay = self.process_interval + self.backoff.get_delay(ERROR_TRACK);
        error!(
          node_id = %self.node_id,
          error = %e,
          delay_ms = delay.as_millis() as u64,
          "Sweep failed."
        );
        delay
      }
    }
  }
}
