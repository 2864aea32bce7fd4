//! Resolution of human date phrases used for `starts` and `ends`.
//!
//! Day-level phrases (`today`, `tomorrow`, weekdays) keep the current time of
//! day unless an explicit `at <time>` suffix is given.

use chrono::{
  DateTime, Datelike, Duration as ChronoDuration, Months, NaiveDate, NaiveDateTime, NaiveTime,
  Utc, Weekday,
};

use super::text::{parse_time, weekday_name};

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Resolves `phrase` relative to `now`.
///
/// With `forward_only`, ambiguous phrases prefer the future interpretation.
/// Returns `None` when nothing date-like could be read from the phrase.
pub(crate) fn resolve_phrase(
  phrase: &str,
  now: DateTime<Utc>,
  forward_only: bool,
) -> Option<DateTime<Utc>> {
  let trimmed = phrase.trim();
  if trimmed.is_empty() {
    return None;
  }

  if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
    return Some(parsed.with_timezone(&Utc));
  }
  for format in NAIVE_FORMATS {
    if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
      return Some(DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc));
    }
  }
  if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
    return Some(DateTime::<Utc>::from_naive_utc_and_offset(
      date.and_time(NaiveTime::MIN),
      Utc,
    ));
  }

  let lowered = trimmed.to_lowercase();
  let tokens: Vec<&str> = lowered.split_whitespace().collect();

  // Split off a trailing `at <time>` clause.
  let (base, time_of_day) = match tokens.iter().position(|t| *t == "at") {
    Some(idx) => {
      let (consumed, time) = parse_time(&tokens[idx + 1..]).ok()?;
      if idx + 1 + consumed != tokens.len() {
        return None;
      }
      (&tokens[..idx], Some(time))
    }
    None => (&tokens[..], None),
  };

  let day = match base {
    [] if time_of_day.is_some() => now,
    ["now"] | ["today"] => now,
    ["tomorrow"] => now + ChronoDuration::days(1),
    ["yesterday"] => now - ChronoDuration::days(1),
    ["in", amount, unit] => shift(now, amount, unit, true)?,
    [amount, unit, "from", "now"] => shift(now, amount, unit, true)?,
    [amount, unit, "ago"] => shift(now, amount, unit, false)?,
    ["next", day] => on_weekday(now, parse_weekday(day)?, Direction::Next),
    ["last", day] => on_weekday(now, parse_weekday(day)?, Direction::Last),
    ["this", day] | [day] => {
      let direction = if forward_only {
        Direction::Upcoming
      } else {
        Direction::Recent
      };
      on_weekday(now, parse_weekday(day)?, direction)
    }
    _ => return None,
  };

  match time_of_day {
    None => Some(day),
    Some((hour, minute, second)) => {
      let time = NaiveTime::from_hms_opt(hour, minute, second)?;
      let at = DateTime::<Utc>::from_naive_utc_and_offset(day.date_naive().and_time(time), Utc);
      // A bare `at 5pm` that already passed today means tomorrow.
      if base.is_empty() && forward_only && at < now {
        Some(at + ChronoDuration::days(1))
      } else {
        Some(at)
      }
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
  /// Today or the next matching day.
  Upcoming,
  /// Today or the most recent matching day.
  Recent,
  /// Strictly after today.
  Next,
  /// Strictly before today.
  Last,
}

fn on_weekday(now: DateTime<Utc>, target: Weekday, direction: Direction) -> DateTime<Utc> {
  let today = now.weekday().num_days_from_monday() as i64;
  let wanted = target.num_days_from_monday() as i64;
  let ahead = (wanted - today).rem_euclid(7);
  let behind = (today - wanted).rem_euclid(7);
  let offset = match direction {
    Direction::Upcoming => ahead,
    Direction::Recent => -behind,
    Direction::Next => {
      if ahead == 0 {
        7
      } else {
        ahead
      }
    }
    Direction::Last => {
      if behind == 0 {
        -7
      } else {
        -behind
      }
    }
  };
  now + ChronoDuration::days(offset)
}

fn parse_weekday(token: &str) -> Option<Weekday> {
  match weekday_name(token)? {
    "Mon" => Some(Weekday::Mon),
    "Tue" => Some(Weekday::Tue),
    "Wed" => Some(Weekday::Wed),
    "Thu" => Some(Weekday::Thu),
    "Fri" => Some(Weekday::Fri),
    "Sat" => Some(Weekday::Sat),
    "Sun" => Some(Weekday::Sun),
    _ => None,
  }
}

fn shift(now: DateTime<Utc>, amount: &str, unit: &str, forward: bool) -> Option<DateTime<Utc>> {
  let amount: u32 = match amount {
    "a" | "an" | "one" => 1,
    other => other.parse().ok()?,
  };
  let unit = unit.strip_suffix('s').unwrap_or(unit);
  let seconds = |n: i64| -> Option<DateTime<Utc>> {
    let delta = ChronoDuration::try_seconds(n)?;
    if forward {
      now.checked_add_signed(delta)
    } else {
      now.checked_sub_signed(delta)
    }
  };
  let months = |n: u32| -> Option<DateTime<Utc>> {
    if forward {
      now.checked_add_months(Months::new(n))
    } else {
      now.checked_sub_months(Months::new(n))
    }
  };
  let n = i64::from(amount);
  match unit {
    "second" | "sec" => seconds(n),
    "minute" | "min" => seconds(n * 60),
    "hour" | "hr" => seconds(n * 3_600),
    "day" => seconds(n * 86_400),
    "week" => seconds(n * 604_800),
    "month" => months(amount),
    "year" => months(amount.checked_mul(12)?),
    _ => None,
  }
}
