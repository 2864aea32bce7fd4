//! Human recurrence text to canonical cron translation.
//!
//! | Phrase | Cron (sec min hour dom mon dow) |
//! |--------|---------------------------------|
//! | `every 1 seconds` | `* * * * * *` |
//! | `every 5 minutes` | `0 0/5 * * * *` |
//! | `every other day at 6:30 pm` | `0 30 18 1/2 * *` |
//! | `every weekday at 9am` | `0 0 9 * * Mon,Tue,Wed,Thu,Fri` |
//! | `at 5:00 am on Monday` | `0 0 5 * * Mon` |

/// Resolution of a recurrence period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
  Second,
  Minute,
  Hour,
  Day,
  Week,
  Month,
}

impl Unit {
  fn from_token(token: &str) -> Option<Unit> {
    match token {
      "s" | "sec" | "secs" | "second" | "seconds" => Some(Unit::Second),
      "min" | "mins" | "minute" | "minutes" => Some(Unit::Minute),
      "h" | "hr" | "hrs" | "hour" | "hours" => Some(Unit::Hour),
      "day" | "days" => Some(Unit::Day),
      "week" | "weeks" => Some(Unit::Week),
      "month" | "months" => Some(Unit::Month),
      _ => None,
    }
  }

  /// Largest step that still makes sense for the next-larger field.
  fn max_step(self) -> u32 {
    match self {
      Unit::Second | Unit::Minute => 59,
      Unit::Hour => 23,
      Unit::Day => 31,
      Unit::Week => 1,
      Unit::Month => 12,
    }
  }
}

/// What followed an `every` keyword.
enum Every {
  Period(Unit, u32),
  Days(Vec<&'static str>),
}

#[derive(Debug)]
struct CronFields {
  second: String,
  minute: String,
  hour: String,
  day_of_month: String,
  month: String,
  day_of_week: String,
}

impl CronFields {
  fn midnight() -> Self {
    Self {
      second: "0".into(),
      minute: "0".into(),
      hour: "0".into(),
      day_of_month: "*".into(),
      month: "*".into(),
      day_of_week: "*".into(),
    }
  }

  fn render(&self) -> String {
    format!(
      "{} {} {} {} {} {}",
      self.second, self.minute, self.hour, self.day_of_month, self.month, self.day_of_week
    )
  }
}

fn step(start: u32, n: u32) -> String {
  if n == 1 {
    "*".to_string()
  } else {
    format!("{start}/{n}")
  }
}

/// Translates recurrence text into a six-field cron expression.
///
/// Returns a human-readable reason on failure.
pub(crate) fn text_to_cron(text: &str) -> Result<String, String> {
  let lowered = text.trim().to_lowercase();
  let tokens = tokenize(&lowered);
  if tokens.is_empty() {
    return Err("recurrence text is empty".to_string());
  }

  let mut period: Option<(Unit, u32)> = None;
  let mut days: Vec<&'static str> = Vec::new();
  let mut at: Option<(u32, u32, u32)> = None;

  let mut i = 0;
  while i < tokens.len() {
    match tokens[i] {
      "every" => {
        let (consumed, every) = parse_every(&tokens[i + 1..])?;
        i += 1 + consumed;
        match every {
          Every::Period(unit, n) => {
            if period.replace((unit, n)).is_some() {
              return Err("more than one 'every' period given".to_string());
            }
          }
          Every::Days(list) => push_days(&mut days, &list),
        }
      }
      "at" => {
        let (consumed, time) = parse_time(&tokens[i + 1..])?;
        i += 1 + consumed;
        at = Some(time);
      }
      "on" => {
        let consumed = parse_day_list(&tokens[i + 1..], &mut days);
        if consumed == 0 {
          return Err("expected a weekday after 'on'".to_string());
        }
        i += 1 + consumed;
      }
      "and" => i += 1,
      other => return Err(format!("unexpected word '{other}'")),
    }
  }

  if period.is_none() && days.is_empty() && at.is_none() {
    return Err("no recurrence found".to_string());
  }

  let mut fields = CronFields::midnight();
  if let Some((unit, n)) = period {
    if n == 0 {
      return Err("a recurrence period must be at least 1".to_string());
    }
    if n > unit.max_step() {
      return Err(format!("a step of {n} is not supported for {unit:?} periods"));
    }
    match unit {
      Unit::Second => {
        fields.second = step(0, n);
        fields.minute = "*".into();
        fields.hour = "*".into();
      }
      Unit::Minute => {
        fields.minute = step(0, n);
        fields.hour = "*".into();
      }
      Unit::Hour => fields.hour = step(0, n),
      Unit::Day => fields.day_of_month = step(1, n),
      Unit::Week => {
        if days.is_empty() {
          days.push("Sun");
        }
      }
      Unit::Month => {
        if !days.is_empty() {
          return Err("monthly recurrences cannot be restricted to weekdays".to_string());
        }
        fields.day_of_month = "1".into();
        fields.month = step(1, n);
      }
    }
  }

  if let Some((hour, minute, second)) = at {
    if matches!(
      period,
      Some((Unit::Second, _)) | Some((Unit::Minute, _)) | Some((Unit::Hour, _))
    ) {
      return Err("'at' can only be combined with daily or coarser recurrences".to_string());
    }
    fields.second = second.to_string();
    fields.minute = minute.to_string();
    fields.hour = hour.to_string();
  }

  if !days.is_empty() {
    fields.day_of_week = days.join(",");
  }

  Ok(fields.render())
}

fn tokenize(text: &str) -> Vec<&str> {
  text
    .split(|c: char| c.is_whitespace() || c == ',')
    .filter(|t| !t.is_empty())
    .collect()
}

fn parse_every(tokens: &[&str]) -> Result<(usize, Every), String> {
  let first = *tokens
    .first()
    .ok_or_else(|| "expected a period after 'every'".to_string())?;

  if let Some(unit) = Unit::from_token(first) {
    return Ok((1, Every::Period(unit, 1)));
  }

  let day_list = weekday_group(first);
  if !day_list.is_empty() {
    return Ok((1, Every::Days(day_list)));
  }

  let n = if first == "other" {
    2
  } else {
    first
      .parse::<u32>()
      .map_err(|_| format!("expected a number or unit after 'every', found '{first}'"))?
  };
  let unit_token = tokens
    .get(1)
    .ok_or_else(|| format!("expected a unit after 'every {first}'"))?;
  let unit =
    Unit::from_token(unit_token).ok_or_else(|| format!("unknown recurrence unit '{unit_token}'"))?;
  Ok((2, Every::Period(unit, n)))
}

fn parse_day_list(tokens: &[&str], days: &mut Vec<&'static str>) -> usize {
  let mut consumed = 0;
  for token in tokens {
    if *token == "and" {
      consumed += 1;
      continue;
    }
    let group = weekday_group(token);
    if group.is_empty() {
      break;
    }
    push_days(days, &group);
    consumed += 1;
  }
  // A trailing 'and' belongs to whatever follows.
  while consumed > 0 && tokens[consumed - 1] == "and" {
    consumed -= 1;
  }
  consumed
}

fn push_days(days: &mut Vec<&'static str>, list: &[&'static str]) {
  for day in list {
    if !days.contains(day) {
      days.push(day);
    }
  }
}

/// Maps a weekday word (or group word) to cron day names.
fn weekday_group(token: &str) -> Vec<&'static str> {
  match token {
    "weekday" | "weekdays" => vec!["Mon", "Tue", "Wed", "Thu", "Fri"],
    "weekend" | "weekends" => vec!["Sat", "Sun"],
    other => weekday_name(other).into_iter().collect(),
  }
}

/// Cron day name for a single weekday word, singular or plural.
pub(crate) fn weekday_name(token: &str) -> Option<&'static str> {
  let token = token.strip_suffix('s').filter(|t| t.len() >= 3).unwrap_or(token);
  match token {
    "mon" | "monday" => Some("Mon"),
    "tue" | "tues" | "tuesday" => Some("Tue"),
    "wed" | "wednesday" => Some("Wed"),
    "thu" | "thur" | "thurs" | "thursday" => Some("Thu"),
    "fri" | "friday" => Some("Fri"),
    "sat" | "saturday" => Some("Sat"),
    "sun" | "sunday" => Some("Sun"),
    _ => None,
  }
}

/// Parses `H[:MM[:SS]] [am|pm]`, `noon` or `midnight` into `(hour, minute, second)`.
///
/// Returns the number of tokens consumed.
pub(crate) fn parse_time(tokens: &[&str]) -> Result<(usize, (u32, u32, u32)), String> {
  let first = *tokens
    .first()
    .ok_or_else(|| "expected a time after 'at'".to_string())?;

  match first {
    "noon" => return Ok((1, (12, 0, 0))),
    "midnight" => return Ok((1, (0, 0, 0))),
    _ => {}
  }

  let (clock, mut meridiem) = if let Some(rest) = first.strip_suffix("am") {
    (rest, Some(false))
  } else if let Some(rest) = first.strip_suffix("pm") {
    (rest, Some(true))
  } else {
    (first, None)
  };

  let mut consumed = 1;
  if meridiem.is_none() {
    match tokens.get(1).copied() {
      Some("am") => {
        meridiem = Some(false);
        consumed += 1;
      }
      Some("pm") => {
        meridiem = Some(true);
        consumed += 1;
      }
      _ => {}
    }
  }

  let mut parts = clock.split(':');
  let parse_part = |part: Option<&str>, what: &str| -> Result<u32, String> {
    match part {
      None => Ok(0),
      Some(p) => p
        .parse::<u32>()
        .map_err(|_| format!("invalid {what} in time '{first}'")),
    }
  };
  let mut hour = parse_part(parts.next(), "hour")?;
  let minute = parse_part(parts.next(), "minute")?;
  let second = parse_part(parts.next(), "second")?;
  if parts.next().is_some() {
    return Err(format!("invalid time '{first}'"));
  }

  if let Some(pm) = meridiem {
    if hour == 0 || hour > 12 {
      return Err(format!("hour {hour} is invalid with am/pm"));
    }
    hour = match (hour, pm) {
      (12, false) => 0,
      (12, true) => 12,
      (h, true) => h + 12,
      (h, false) => h,
    };
  }

  if hour > 23 || minute > 59 || second > 59 {
    return Err(format!("time '{first}' is out of range"));
  }
  Ok((consumed, (hour, minute, second)))
}
