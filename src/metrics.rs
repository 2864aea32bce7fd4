use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// --- Simple Histogram Implementation ---

/// A basic concurrent histogram storing count, sum and the last observation.
///
/// Uses `Relaxed` ordering; counters are independent of each other.
#[derive(Debug, Default)]
pub struct SimpleHistogram {
  count: AtomicUsize,
  sum_micros: AtomicUsize,
  last_micros: AtomicUsize,
}

impl SimpleHistogram {
  /// Records a duration observation in the histogram.
  pub fn record(&self, duration: Duration) {
    let micros = duration.as_micros().try_into().unwrap_or(usize::MAX);
    self.count.fetch_add(1, Ordering::Relaxed);
    self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    self.last_micros.store(micros, Ordering::Relaxed);
  }

  pub fn get_count(&self) -> usize {
    self.count.load(Ordering::Relaxed)
  }

  /// Gets the total sum of durations recorded (in microseconds).
  pub fn get_sum_micros(&self) -> usize {
    self.sum_micros.load(Ordering::Relaxed)
  }

  pub fn get_last_micros(&self) -> usize {
    self.last_micros.load(Ordering::Relaxed)
  }
}

// --- Main Metrics Struct (Internal State) ---

/// Per-node counters shared between the sweeper, the consumer and the
/// broadcaster. Cloning only clones the `Arc`s.
#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
  // --- Sweeping ---
  /// Sweeps that acquired the lock and ran.
  pub sweeps_run: Arc<AtomicUsize>,
  /// Sweep attempts that found the lock held by another node.
  pub sweep_lock_contention: Arc<AtomicUsize>,
  /// Waiting entries moved into the queue by this node.
  pub occurrences_moved: Arc<AtomicUsize>,
  /// Store operations that failed (sweep, claim, completion).
  pub store_errors: Arc<AtomicUsize>,
  /// Sweeps that found the flush sentinel missing.
  pub flushes_detected: Arc<AtomicUsize>,

  // --- Consumption ---
  pub occurrences_claimed: Arc<AtomicUsize>,
  /// Claims of an occurrence that had already been processed recently.
  pub duplicates_absorbed: Arc<AtomicUsize>,
  /// Claimed occurrences dropped because their definition changed or vanished.
  pub occurrences_discarded_stale: Arc<AtomicUsize>,
  pub jobs_succeeded: Arc<AtomicUsize>,
  /// Failed jobs, including unregistered job identifiers and panics.
  pub jobs_failed: Arc<AtomicUsize>,
  pub jobs_panicked: Arc<AtomicUsize>,

  // --- Broadcast ---
  pub multi_sent: Arc<AtomicUsize>,
  pub multi_received: Arc<AtomicUsize>,

  // --- Histograms/Summaries ---
  pub sweep_duration: Arc<SimpleHistogram>,
  pub job_execution_duration: Arc<SimpleHistogram>,
}

impl SchedulerMetrics {
  /// Creates a new `SchedulerMetrics` instance with all counters initialized to zero.
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn incr(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
  }

  /// Creates a point-in-time snapshot of the current metric values.
  pub fn snapshot(&self) -> MetricsSnapshot {
    let order = Ordering::Relaxed;

    MetricsSnapshot {
      sweeps_run: self.sweeps_run.load(order),
      sweep_lock_contention: self.sweep_lock_contention.load(order),
      occurrences_moved: self.occurrences_moved.load(order),
      store_errors: self.store_errors.load(order),
      flushes_detected: self.flushes_detected.load(order),
      occurrences_claimed: self.occurrences_claimed.load(order),
      duplicates_absorbed: self.duplicates_absorbed.load(order),
      occurrences_discarded_stale: self.occurrences_discarded_stale.load(order),
      jobs_succeeded: self.jobs_succeeded.load(order),
      jobs_failed: self.jobs_failed.load(order),
      jobs_panicked: self.jobs_panicked.load(order),
      multi_sent: self.multi_sent.load(order),
      multi_received: self.multi_received.load(order),
      last_sweep_duration_micros: self.sweep_duration.get_last_micros(),
      job_execution_duration_count: self.job_execution_duration.get_count(),
      job_execution_duration_sum_micros: self.job_execution_duration.get_sum_micros(),
    }
  }
}

// --- Metrics Snapshot Struct (Public Data) ---

/// A snapshot of a node's metrics at a specific point in time.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
  pub sweeps_run: usize,
  pub sweep_lock_contention: usize,
  pub occurrences_moved: usize,
  pub store_errors: usize,
  pub flushes_detected: usize,
  pub occurrences_claimed: usize,
  pub duplicates_absorbed: usize,
  pub occurrences_discarded_stale: usize,
  pub jobs_succeeded: usize,
  pub jobs_failed: usize,
  pub jobs_panicked: usize,
  pub multi_sent: usize,
  pub multi_received: usize,
  pub last_sweep_duration_micros: usize,
  pub job_execution_duration_count: usize,
  pub job_execution_duration_sum_micros: usize,
}

impl MetricsSnapshot {
  /// Calculates the mean job execution duration in microseconds, if any jobs completed.
  pub fn mean_execution_duration_micros(&self) -> Option<f64> {
    if self.job_execution_duration_count == 0 {
      None
    } else {
      Some(self.job_execution_duration_sum_micros as f64 / self.job_execution_duration_count as f64)
    }
  }

  pub fn mean_execution_duration(&self) -> Option<Duration> {
    self
      .mean_execution_duration_micros()
      .map(|micros| Duration::from_micros(micros as u64))
  }
}
