use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use parking_lot::Mutex;

/// Source of the current time for occurrence computation and sweeping.
///
/// Injected into the scheduler so tests can drive time explicitly instead of
/// relying on a cached module-level timestamp.
pub trait Clock: Send + Sync + 'static {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time via `Utc::now()`. Uncached.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
///
/// Cloning shares the underlying instant.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  pub fn set(&self, instant: DateTime<Utc>) {
    *self.now.lock() = instant;
  }

  pub fn advance(&self, by: ChronoDuration) {
    let mut now = self.now.lock();
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock()
  }
}

/// One time-unit of occurrence arithmetic.
pub(crate) fn one_unit() -> ChronoDuration {
  ChronoDuration::seconds(1)
}

/// Rounds up to the next whole second; whole seconds are returned unchanged.
pub fn ceil_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
  let floored = floor_to_second(instant);
  if floored == instant {
    instant
  } else {
    floored.checked_add_signed(one_unit()).unwrap_or(floored)
  }
}

/// Drops any sub-second component.
pub fn floor_to_second(instant: DateTime<Utc>) -> DateTime<Utc> {
  instant.with_nanosecond(0).unwrap_or(instant)
}
