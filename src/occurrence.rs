//! Occurrence rules: turning a definition into bound timestamps and computing
//! the next due time from run history.
//!
//! All arithmetic is done at whole-second resolution. The "time unit" that
//! appears throughout is one second: queries for occurrences start one unit
//! before the lower bound so that an occurrence landing exactly on it is
//! still reported.

use std::cmp;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::clock::{ceil_to_second, one_unit};
use crate::error::ScheduleError;
use crate::job::{DateInput, Definition, DefinitionInput, IntervalInput};
use crate::recurrence::{date, Recurrence};

/// Rendering of an unbounded `ends`.
pub const NO_END_DATE: &str = "No End Date";

/// Stand-in `ends` for recurring rules without an end bound.
pub fn unbounded_end() -> DateTime<Utc> {
  DateTime::from_timestamp(999_999_999_999, 0).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// The computed timing state embedded in every [`Definition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OccurrenceRule {
  Once(OnceRule),
  Recurring(RecurringRule),
}

/// A single absolute execution time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnceRule {
  pub at: DateTime<Utc>,
  pub starts: DateTime<Utc>,
  /// One second past `at`.
  pub ends: DateTime<Utc>,
  pub next: Option<DateTime<Utc>>,
  /// Flipped once the single execution has been claimed.
  pub once_completed: bool,
  pub start_human: String,
  pub end_human: String,
  pub next_human: String,
}

/// A recurrence bounded by `[starts, ends]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringRule {
  pub rule: Recurrence,
  pub starts: DateTime<Utc>,
  /// Resolved upper bound, [`unbounded_end`] when neither `ends` nor `times` was given.
  /// Stored as unix seconds since the unbounded value lies past year 9999.
  #[serde(with = "chrono::serde::ts_seconds")]
  pub ends: DateTime<Utc>,
  /// Raw `starts` as supplied, if any.
  pub starts_input: Option<DateInput>,
  /// Raw `ends` as supplied, if any.
  pub ends_input: Option<DateInput>,
  pub next: Option<DateTime<Utc>>,
  /// Repeat cap, `-1` when unbounded.
  pub times: i64,
  pub start_human: String,
  pub end_human: String,
  pub next_human: String,
}

impl RecurringRule {
  pub fn is_bounded(&self) -> bool {
    self.ends < unbounded_end()
  }
}

impl OccurrenceRule {
  pub fn next(&self) -> Option<DateTime<Utc>> {
    match self {
      OccurrenceRule::Once(rule) => rule.next,
      OccurrenceRule::Recurring(rule) => rule.next,
    }
  }

  pub fn starts(&self) -> DateTime<Utc> {
    match self {
      OccurrenceRule::Once(rule) => rule.starts,
      OccurrenceRule::Recurring(rule) => rule.starts,
    }
  }

  pub fn ends(&self) -> DateTime<Utc> {
    match self {
      OccurrenceRule::Once(rule) => rule.ends,
      OccurrenceRule::Recurring(rule) => rule.ends,
    }
  }

  pub fn is_once(&self) -> bool {
    matches!(self, OccurrenceRule::Once(_))
  }

  /// True for a one-shot rule whose execution has been claimed.
  pub fn is_completed_once(&self) -> bool {
    matches!(self, OccurrenceRule::Once(rule) if rule.once_completed)
  }

  /// Records a newly computed due time and its rendering.
  pub fn set_next(&mut self, next: Option<DateTime<Utc>>) {
    let human = next.map(|at| at.to_rfc3339()).unwrap_or_default();
    match self {
      OccurrenceRule::Once(rule) => {
        rule.next = next;
        rule.next_human = human;
      }
      OccurrenceRule::Recurring(rule) => {
        rule.next = next;
        rule.next_human = human;
      }
    }
  }

  pub(crate) fn mark_once_completed(&mut self) {
    if let OccurrenceRule::Once(rule) = self {
      rule.once_completed = true;
    }
  }
}

/// Parses the timing fields of `input` into an occurrence rule.
///
/// `now` is rounded up to the whole second before use.
pub fn parse(input: &DefinitionInput, now: DateTime<Utc>) -> Result<OccurrenceRule, ScheduleError> {
  match input.interval.as_ref() {
    None => Err(ScheduleError::MissingInterval),
    Some(IntervalInput::Timestamp(secs)) => parse_once(*secs, now),
    Some(IntervalInput::Text(text)) => parse_recurring(text, input, now),
  }
}

fn parse_once(secs: i64, now: DateTime<Utc>) -> Result<OccurrenceRule, ScheduleError> {
  let at = DateTime::from_timestamp(secs, 0)
    .ok_or_else(|| ScheduleError::InvalidSchedule(format!("timestamp {secs} is out of range")))?;
  if at <= now {
    return Err(ScheduleError::PastTimestamp(at));
  }
  let ends = at
    .checked_add_signed(one_unit())
    .ok_or_else(|| ScheduleError::InvalidSchedule(format!("timestamp {secs} is out of range")))?;
  Ok(OccurrenceRule::Once(OnceRule {
    at,
    starts: at,
    ends,
    next: Some(at),
    once_completed: false,
    start_human: at.to_rfc3339(),
    end_human: ends.to_rfc3339(),
    next_human: at.to_rfc3339(),
  }))
}

fn parse_recurring(
  interval: &str,
  input: &DefinitionInput,
  now: DateTime<Utc>,
) -> Result<OccurrenceRule, ScheduleError> {
  let rule = Recurrence::parse(interval)?;
  let now = ceil_to_second(now);
  let forward = input.forward_dates_only;

  let mut starts = match &input.starts {
    Some(raw) => {
      resolve_date(raw, now, forward).ok_or_else(|| ScheduleError::InvalidStartDate(raw.to_string()))?
    }
    None => now,
  };
  if starts.checked_sub_signed(one_unit()).is_none() {
    let raw = input.starts.as_ref().map_or_else(|| starts.to_rfc3339(), ToString::to_string);
    return Err(ScheduleError::InvalidStartDate(raw));
  }

  let mut ends = match &input.ends {
    Some(raw) => Some(
      resolve_date(raw, now, forward).ok_or_else(|| ScheduleError::InvalidEndDate(raw.to_string()))?,
    ),
    None => None,
  };

  if ends.is_none() {
    if let Some(times) = input.times {
      ends = Some(nth_occurrence(&rule, starts, times)?);
    }
  }

  if forward {
    if starts < now {
      starts = now;
    }
    if let Some(end) = ends {
      if end < now {
        return Err(ScheduleError::PastWindow(end));
      }
    }
  }

  let bound = ends.unwrap_or_else(unbounded_end);
  let anchor = starts - one_unit();
  let next = rule
    .occurrences(2, anchor, Some(bound))
    .into_iter()
    .find(|at| *at != anchor)
    .ok_or(ScheduleError::ExhaustedWindow)?;

  trace!(expression = rule.expression(), %starts, %next, "Parsed recurring rule.");

  Ok(OccurrenceRule::Recurring(RecurringRule {
    start_human: starts.to_rfc3339(),
    end_human: ends.map_or_else(|| NO_END_DATE.to_string(), |end| end.to_rfc3339()),
    next_human: next.to_rfc3339(),
    rule,
    starts,
    ends: bound,
    starts_input: input.starts.clone(),
    ends_input: input.ends.clone(),
    next: Some(next),
    times: input.times.map_or(-1, i64::from),
  }))
}

/// Timestamp of the `times`-th occurrence at or after `starts`.
fn nth_occurrence(
  rule: &Recurrence,
  starts: DateTime<Utc>,
  times: u32,
) -> Result<DateTime<Utc>, ScheduleError> {
  if times == 0 {
    return Err(ScheduleError::ExhaustedWindow);
  }
  rule
    .occurrences(times as usize, starts - one_unit(), None)
    .get(times as usize - 1)
    .copied()
    .ok_or(ScheduleError::ExhaustedWindow)
}

fn resolve_date(input: &DateInput, now: DateTime<Utc>, forward: bool) -> Option<DateTime<Utc>> {
  let resolved = match input {
    DateInput::Timestamp(secs) => DateTime::from_timestamp(*secs, 0),
    DateInput::Date(at) => Some(*at),
    DateInput::Phrase(phrase) => date::resolve_phrase(phrase, now, forward),
  };
  resolved.map(ceil_to_second)
}

/// Next due time for `definition` given its run history, or `None` when the
/// series is finished (or paused).
pub fn compute_next_after_run(definition: &Definition, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
  if !definition.enabled {
    return None;
  }
  let now = ceil_to_second(now);

  let rule = match &definition.occurrence {
    OccurrenceRule::Once(rule) => {
      if rule.once_completed || definition.last_ran.is_some() {
        return None;
      }
      return rule.next;
    }
    OccurrenceRule::Recurring(rule) => rule,
  };

  if rule.ends < now {
    debug!(schedule = %definition.name, ends = %rule.ends, "Schedule window has ended.");
    return None;
  }
  if let Some(times) = definition.times {
    if definition.times_ran >= u64::from(times) {
      debug!(schedule = %definition.name, times, "Schedule reached its repeat cap.");
      return None;
    }
  }

  if definition.last_ran.is_none() {
    return rule.next;
  }

  let floor = cmp::max(rule.starts, now);
  let floor = definition.last_due.map_or(floor, |due| cmp::max(floor, due));
  let anchor = floor - one_unit();
  rule
    .rule
    .occurrences(2, anchor, Some(rule.ends))
    .into_iter()
    .filter(|at| *at != anchor)
    .find(|at| definition.last_due.map_or(true, |due| *at > due))
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration as ChronoDuration;

  fn now() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
  }

  fn input(interval: impl Into<IntervalInput>) -> DefinitionInput {
    DefinitionInput::new("sample", "jobs.sample", interval)
  }

  fn recurring(rule: &OccurrenceRule) -> &RecurringRule {
    match rule {
      OccurrenceRule::Recurring(rule) => rule,
      other => panic!("expected recurring rule, got {other:?}"),
    }
  }

  #[test]
  fn every_second_is_due_within_a_second() {
    let now = now() + ChronoDuration::milliseconds(250);
    let rule = parse(&input("every 1 seconds"), now).unwrap();
    let rule = recurring(&rule);
    let next = rule.next.unwrap();
    assert!(next > now && next - now <= ChronoDuration::seconds(1));
    assert_eq!(rule.end_human, NO_END_DATE);
    assert_eq!(rule.times, -1);
    assert!(!rule.is_bounded());
  }

  #[test]
  fn next_respects_window() {
    let starts = now() + ChronoDuration::hours(2);
    let ends = now() + ChronoDuration::hours(6);
    for interval in ["every 1 hours", "every 15 minutes", "0 30 * * * *", "every day at 4am"] {
      let parsed = parse(&input(interval).starts(starts).ends(ends), now());
      let Ok(rule) = parsed else { continue };
      let rule = recurring(&rule);
      let next = rule.next.unwrap();
      assert!(next >= rule.starts, "{interval}: {next} < {}", rule.starts);
      assert!(next <= rule.ends, "{interval}: {next} > {}", rule.ends);
    }
  }

  #[test]
  fn occurrence_on_start_boundary_counts() {
    // 1_700_000_000 is 22:13:20 UTC, on a 20 second boundary.
    let rule = parse(&input("0/20 * * * * *").starts(now()), now()).unwrap();
    assert_eq!(rule.next(), Some(now()));
  }

  #[test]
  fn times_sets_end_to_nth_occurrence() {
    let rule = parse(&input("every 1 seconds").times(2), now()).unwrap();
    let rule = recurring(&rule);
    // The start instant itself is the first occurrence.
    assert_eq!(rule.next, Some(now()));
    assert_eq!(rule.ends, now() + ChronoDuration::seconds(1));
    assert_eq!(rule.times, 2);
    assert!(rule.is_bounded());
  }

  #[test]
  fn zero_times_is_exhausted() {
    assert!(matches!(
      parse(&input("every 1 seconds").times(0), now()),
      Err(ScheduleError::ExhaustedWindow)
    ));
  }

  #[test]
  fn window_before_first_occurrence_is_exhausted() {
    let ends = now() + ChronoDuration::seconds(30);
    assert!(matches!(
      parse(&input("every day at noon").starts(now()).ends(ends), now()),
      Err(ScheduleError::ExhaustedWindow)
    ));
  }

  #[test]
  fn once_in_the_past_is_rejected() {
    let past = (now() - ChronoDuration::seconds(5)).timestamp();
    assert!(matches!(
      parse(&input(past), now()),
      Err(ScheduleError::PastTimestamp(_))
    ));
  }

  #[test]
  fn once_in_the_future() {
    let at = now() + ChronoDuration::seconds(2);
    let rule = parse(&input(at), now()).unwrap();
    match rule {
      OccurrenceRule::Once(once) => {
        assert_eq!(once.starts, at);
        assert_eq!(once.next, Some(at));
        assert_eq!(once.ends, at + ChronoDuration::seconds(1));
        assert!(!once.once_completed);
      }
      other => panic!("expected once rule, got {other:?}"),
    }
  }

  #[test]
  fn extreme_timestamps_are_rejected_not_overflowed() {
    let last = DateTime::<Utc>::MAX_UTC.timestamp();
    assert!(matches!(
      parse(&input(last), now()),
      Err(ScheduleError::InvalidSchedule(_))
    ));

    let first = DateTime::<Utc>::MIN_UTC.timestamp();
    assert!(matches!(
      parse(&input("every 1 minutes").starts(first), now()),
      Err(ScheduleError::InvalidStartDate(_))
    ));
  }

  #[test]
  fn forward_only_clamps_and_rejects() {
    let rule = parse(
      &input("every 1 minutes")
        .starts(now() - ChronoDuration::days(3))
        .forward_dates_only(true),
      now(),
    )
    .unwrap();
    assert_eq!(rule.starts(), now());

    assert!(matches!(
      parse(
        &input("every 1 minutes")
          .ends(now() - ChronoDuration::days(1))
          .forward_dates_only(true),
        now()
      ),
      Err(ScheduleError::PastWindow(_))
    ));
  }

  #[test]
  fn invalid_dates_name_their_field() {
    assert!(matches!(
      parse(&input("every 1 minutes").starts("wehrnsfhb"), now()),
      Err(ScheduleError::InvalidStartDate(s)) if s == "wehrnsfhb"
    ));
    assert!(matches!(
      parse(&input("every 1 minutes").ends("soonish"), now()),
      Err(ScheduleError::InvalidEndDate(_))
    ));
  }

  #[test]
  fn starts_and_ends_inputs_stay_separate() {
    let rule = parse(&input("every 1 minutes").ends("in 2 hours"), now()).unwrap();
    let rule = recurring(&rule);
    assert_eq!(rule.ends_input, Some(DateInput::Phrase("in 2 hours".into())));
    assert_eq!(rule.ends, now() + ChronoDuration::hours(2));
    assert_eq!(rule.starts_input, None);
  }

  fn definition(input: DefinitionInput) -> Definition {
    Definition::from_input(input, now()).unwrap()
  }

  #[test]
  fn first_run_uses_parsed_next() {
    let def = definition(input("every 5 minutes"));
    assert_eq!(compute_next_after_run(&def, now()), def.next());
  }

  #[test]
  fn later_runs_skip_the_claimed_occurrence() {
    let mut def = definition(input("every 1 seconds"));
    let due = def.next().unwrap();
    def.times_ran = 1;
    def.last_ran = Some(due);
    def.last_due = Some(due);
    assert_eq!(
      compute_next_after_run(&def, due),
      Some(due + ChronoDuration::seconds(1))
    );
    // A lagging clock never reschedules into the past.
    assert_eq!(
      compute_next_after_run(&def, due - ChronoDuration::seconds(30)),
      Some(due + ChronoDuration::seconds(1))
    );
  }

  #[test]
  fn nothing_after_disable_or_completion() {
    let mut def = definition(input("every 1 seconds"));
    def.enabled = false;
    assert_eq!(compute_next_after_run(&def, now()), None);

    let mut once = definition(input(now() + ChronoDuration::seconds(2)));
    assert_eq!(compute_next_after_run(&once, now()), once.next());
    once.occurrence.mark_once_completed();
    assert_eq!(compute_next_after_run(&once, now()), None);
  }

  #[test]
  fn stops_at_repeat_cap() {
    let mut def = definition(input("every 1 seconds").times(2));
    def.times_ran = 2;
    def.last_ran = Some(now() + ChronoDuration::seconds(2));
    def.last_due = def.last_ran;
    assert_eq!(compute_next_after_run(&def, now() + ChronoDuration::seconds(2)), None);
  }

  #[test]
  fn stops_after_window() {
    let mut def = definition(input("every 1 seconds").ends(now() + ChronoDuration::seconds(10)));
    def.times_ran = 1;
    def.last_ran = Some(now());
    assert_eq!(compute_next_after_run(&def, now() + ChronoDuration::seconds(11)), None);
  }

  #[test]
  fn unbounded_rule_survives_json() {
    let rule = parse(&input("every 5 minutes"), now()).unwrap();
    let encoded = serde_json::to_value(&rule).unwrap();
    assert_eq!(encoded["kind"], "recurring");
    assert_eq!(encoded["ends"], 999_999_999_999_i64);
    let decoded: OccurrenceRule = serde_json::from_value(encoded).unwrap();
    assert_eq!(decoded, rule);
  }
}
