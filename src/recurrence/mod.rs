//! Canonical recurrence rules.
//!
//! Every recurring interval, whether written as human text, a named shorthand
//! or raw cron, is normalised into a six or seven field cron expression
//! (`sec min hour dom mon dow [year]`) understood by the `cron` crate.

pub(crate) mod date;
pub(crate) mod text;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ScheduleError;

/// A parsed recurrence rule, stored as its canonical cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recurrence {
  expression: String,
}

impl Recurrence {
  /// Parses recurrence text, a named shorthand (`@daily`) or a cron expression.
  ///
  /// Anything containing letters is read as text first; if that fails and
  /// the input has the shape of a cron line (5 to 7 fields, e.g. with day
  /// names) it is retried as cron.
  pub fn parse(interval: &str) -> Result<Self, ScheduleError> {
    let trimmed = interval.trim();
    if trimmed.is_empty() {
      return Err(ScheduleError::MissingInterval);
    }

    if let Some(named) = trimmed.strip_prefix('@') {
      let expression = named_expression(named)
        .ok_or_else(|| ScheduleError::InvalidSchedule(format!("unknown shorthand '{trimmed}'")))?;
      return Self::from_cron(expression);
    }

    if trimmed.chars().any(|c| c.is_alphabetic()) {
      return match text::text_to_cron(trimmed) {
        Ok(expression) => Self::from_cron(&expression),
        Err(reason) => {
          let fields = trimmed.split_whitespace().count();
          if (5..=7).contains(&fields) {
            Self::from_cron(trimmed).map_err(|_| ScheduleError::InvalidSchedule(reason))
          } else {
            Err(ScheduleError::InvalidSchedule(reason))
          }
        }
      };
    }

    Self::from_cron(trimmed)
  }

  fn from_cron(expression: &str) -> Result<Self, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let canonical = match fields.len() {
      5 => format!("0 {}", fields.join(" ")),
      6 | 7 => fields.join(" "),
      n => {
        return Err(ScheduleError::InvalidSchedule(format!(
          "expected 5, 6 or 7 cron fields, found {n}"
        )))
      }
    };
    cron::Schedule::from_str(&canonical)
      .map_err(|e| ScheduleError::InvalidSchedule(format!("'{canonical}': {e}")))?;
    Ok(Self {
      expression: canonical,
    })
  }

  /// The canonical cron expression.
  pub fn expression(&self) -> &str {
    &self.expression
  }

  /// Up to `count` occurrences strictly after `after`, none later than `until`.
  pub fn occurrences(
    &self,
    count: usize,
    after: DateTime<Utc>,
    until: Option<DateTime<Utc>>,
  ) -> Vec<DateTime<Utc>> {
    let schedule = match cron::Schedule::from_str(&self.expression) {
      Ok(schedule) => schedule,
      Err(e) => {
        warn!(expression = %self.expression, error = %e, "Stored recurrence no longer parses.");
        return Vec::new();
      }
    };
    schedule
      .after(&after)
      .take_while(|at| until.map_or(true, |end| *at <= end))
      .take(count)
      .collect()
  }
}

fn named_expression(name: &str) -> Option<&'static str> {
  match name.to_ascii_lowercase().as_str() {
    "yearly" | "annually" => Some("0 0 0 1 1 *"),
    "monthly" => Some("0 0 0 1 * *"),
    "weekly" => Some("0 0 0 * * Sun"),
    "daily" | "midnight" => Some("0 0 0 * * *"),
    "hourly" => Some("0 0 * * * *"),
    "minutely" => Some("0 * * * * *"),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration as ChronoDuration;

  fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
  }

  #[test]
  fn five_field_cron_gets_seconds() {
    let rule = Recurrence::parse("0/15 * * * *").unwrap();
    assert_eq!(rule.expression(), "0 0/15 * * * *");
  }

  #[test]
  fn cron_with_day_names_falls_back_from_text() {
    let rule = Recurrence::parse("0 0 9 * * Mon").unwrap();
    assert_eq!(rule.expression(), "0 0 9 * * Mon");
  }

  #[test]
  fn named_shorthand() {
    assert_eq!(Recurrence::parse("@daily").unwrap().expression(), "0 0 0 * * *");
    assert!(matches!(
      Recurrence::parse("@fortnightly"),
      Err(ScheduleError::InvalidSchedule(_))
    ));
  }

  #[test]
  fn rejects_garbage() {
    assert!(matches!(
      Recurrence::parse("wehrnsfhb"),
      Err(ScheduleError::InvalidSchedule(_))
    ));
    assert!(matches!(
      Recurrence::parse("1 2 3"),
      Err(ScheduleError::InvalidSchedule(_))
    ));
  }

  #[test]
  fn occurrences_are_exclusive_and_bounded() {
    let rule = Recurrence::parse("every 1 seconds").unwrap();
    let start = at("2024-01-01T00:00:00Z");
    let got = rule.occurrences(3, start, None);
    assert_eq!(
      got,
      vec![
        start + ChronoDuration::seconds(1),
        start + ChronoDuration::seconds(2),
        start + ChronoDuration::seconds(3),
      ]
    );

    let bounded = rule.occurrences(10, start, Some(start + ChronoDuration::seconds(2)));
    assert_eq!(bounded.len(), 2);
  }

  #[test]
  fn serializes_as_plain_expression() {
    let rule = Recurrence::parse("every 5 minutes").unwrap();
    assert_eq!(serde_json::to_string(&rule).unwrap(), "\"0 0/5 * * * *\"");
  }
}
