use std::collections::HashMap;
use std::time::Duration as StdDuration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::warn;

/// Parameters of one backoff track.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
  /// Delay added per step, in milliseconds.
  pub base_ms: u64,
  /// Step count at which the delay plateaus (inclusive).
  pub max_steps: u32,
  /// Fraction of `base_ms` used to widen the random window, if any.
  pub jitter: Option<f64>,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      base_ms: 1_000,
      max_steps: 10,
      jitter: None,
    }
  }
}

#[derive(Debug, Clone, Copy)]
struct Track {
  base_ms: u64,
  max_steps: u32,
  jitter_ms: u64,
  step: u32,
}

/// Stateful, per-tag retry-delay generator.
///
/// Each call to [`get_delay`](Self::get_delay) returns `base * (step - 1)` and
/// then advances `step` until it reaches `max_steps`, after which the delay
/// plateaus. [`reset`](Self::reset) returns the track to step 1.
#[derive(Debug, Default)]
pub struct ExponentialRetries {
  tracks: Mutex<HashMap<String, Track>>,
}

impl ExponentialRetries {
  pub fn new() -> Self {
    Self::default()
  }

  /// Creates (or replaces) the track for `tag`.
  pub fn create(&self, tag: impl Into<String>, policy: BackoffPolicy) {
    let jitter_ms = policy
      .jitter
      .filter(|fraction| *fraction > 0.0)
      .map_or(0, |fraction| (policy.base_ms as f64 * fraction).round() as u64);
    self.tracks.lock().insert(
      tag.into(),
      Track {
        base_ms: policy.base_ms,
        max_steps: policy.max_steps.max(1),
        jitter_ms,
        step: 1,
      },
    );
  }

  /// Returns the delay for the current step of `tag` and advances it.
  ///
  /// Unknown tags yield no delay.
  pub fn get_delay(&self, tag: &str) -> StdDuration {
    let mut tracks = self.tracks.lock();
    let Some(track) = tracks.get_mut(tag) else {
      warn!(tag, "Backoff requested for an unknown tag.");
      return StdDuration::ZERO;
    };

    let step = u64::from(track.step);
    let mut delay = track.base_ms.saturating_mul(step.saturating_sub(1));
    let previous = track.base_ms.saturating_mul(step.saturating_sub(2));
    if previous > 0 && track.jitter_ms > 0 {
      let low = previous + track.jitter_ms;
      let high = delay + track.jitter_ms;
      delay = low + (rand::random::<f64>() * (high - low) as f64).round() as u64;
    }

    if track.step < track.max_steps {
      track.step += 1;
    }
    StdDuration::from_millis(delay)
  }

  /// Returns `tag` to its first step.
  pub fn reset(&self, tag: &str) {
    if let Some(track) = self.tracks.lock().get_mut(tag) {
      track.step = 1;
    }
  }

  /// Drops the track for `tag`.
  pub fn remove(&self, tag: &str) {
    self.tracks.lock().remove(tag);
  }

  /// Current step of `tag`, if it exists.
  pub fn step(&self, tag: &str) -> Option<u32> {
    self.tracks.lock().get(tag).map(|track| track.step)
  }
}
