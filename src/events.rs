use serde_json::Value;
use tracing::{error, info};

use crate::error::JobError;
use crate::job::Definition;

/// Receives the outcome of every job execution on this node.
///
/// A handler is always present; [`LoggingEvents`] is used when none is
/// configured.
pub trait ScheduleEvents: Send + Sync + 'static {
  fn on_schedule_success(&self, schedule: &Definition, result: &Value);

  fn on_schedule_failure(&self, schedule: &Definition, error: &JobError);
}

/// Logs outcomes through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEvents;

impl ScheduleEvents for LoggingEvents {
  fn on_schedule_success(&self, schedule: &Definition, result: &Value) {
    info!(
      schedule = %schedule.name,
      runs = %schedule.runs,
      data = %schedule.data,
      result = %result,
      "Schedule has completed successfully."
    );
  }

  fn on_schedule_failure(&self, schedule: &Definition, error: &JobError) {
    error!(
      schedule = %schedule.name,
      runs = %schedule.runs,
      data = %schedule.data,
      error = %error,
      "Schedule has failed to complete."
    );
  }
}
