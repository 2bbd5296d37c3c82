//! Date parsing, shifting and formatting for date-valued subjects.

use std::cmp::Ordering;

use chrono::{
  DateTime, Duration, FixedOffset, Months, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc,
};

use crate::ConditionError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Granularity of a shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftUnit {
  Minutes,
  Hours,
  Days,
  Months,
}

impl ShiftUnit {
  /// Parse the wire name; absent means days.
  pub fn parse(unit: Option<&str>) -> Option<Self> {
    match unit {
      None | Some("days") => Some(Self::Days),
      Some("minutes") => Some(Self::Minutes),
      Some("hours") => Some(Self::Hours),
      Some("months") => Some(Self::Months),
      Some(_) => None,
    }
  }

  /// Sub-day shifts produce date-times, the others plain dates.
  fn is_intraday(&self) -> bool {
    matches!(self, Self::Minutes | Self::Hours)
  }
}

/// A calendar date or a local date-time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Moment {
  Date(NaiveDate),
  DateTime(NaiveDateTime),
}

impl Moment {
  /// Accepts `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and
  /// RFC 3339. Zoned values are converted into `time_zone`.
  pub fn parse(value: &str, time_zone: FixedOffset) -> Option<Self> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, DATE_FORMAT) {
      return Some(Self::Date(date));
    }
    for format in [DATE_TIME_FORMAT, "%Y-%m-%dT%H:%M:%S"] {
      if let Ok(at) = NaiveDateTime::parse_from_str(value, format) {
        return Some(Self::DateTime(at));
      }
    }
    DateTime::parse_from_rfc3339(value)
      .ok()
      .map(|at| Self::DateTime(at.with_timezone(&time_zone).naive_local()))
  }

  /// "Now" in `time_zone`, as a date unless an intraday shift is applied.
  pub fn today(now: DateTime<Utc>, time_zone: FixedOffset, unit: ShiftUnit) -> Self {
    let local = now.with_timezone(&time_zone).naive_local();
    if unit.is_intraday() {
      Self::DateTime(local)
    } else {
      Self::Date(local.date())
    }
  }

  fn as_date_time(&self) -> NaiveDateTime {
    match self {
      Self::Date(date) => date.and_time(NaiveTime::MIN),
      Self::DateTime(at) => *at,
    }
  }

  /// Shift by `amount` units. Dates become date-times for intraday units.
  pub fn shift(self, amount: i64, unit: ShiftUnit) -> Option<Self> {
    let moment = if unit.is_intraday() {
      Self::DateTime(self.as_date_time())
    } else {
      self
    };

    match (moment, unit) {
      (Self::DateTime(at), ShiftUnit::Minutes) => {
        at.checked_add_signed(Duration::try_minutes(amount)?).map(Self::DateTime)
      }
      (Self::DateTime(at), ShiftUnit::Hours) => {
        at.checked_add_signed(Duration::try_hours(amount)?).map(Self::DateTime)
      }
      (Self::Date(date), ShiftUnit::Days) => {
        date.checked_add_signed(Duration::try_days(amount)?).map(Self::Date)
      }
      (Self::DateTime(at), ShiftUnit::Days) => {
        at.checked_add_signed(Duration::try_days(amount)?).map(Self::DateTime)
      }
      (Self::Date(date), ShiftUnit::Months) => shift_months(date, amount).map(Self::Date),
      (Self::DateTime(at), ShiftUnit::Months) => {
        shift_months(at.date(), amount).map(|date| Self::DateTime(date.and_time(at.time())))
      }
      (Self::Date(_), _) => None,
    }
  }

  pub fn format(&self) -> String {
    match self {
      Self::Date(date) => date.format(DATE_FORMAT).to_string(),
      Self::DateTime(at) => at.format(DATE_TIME_FORMAT).to_string(),
    }
  }

  /// Chronological order; a date sorts as its midnight.
  pub fn cmp_moment(&self, other: &Self) -> Ordering {
    self.as_date_time().cmp(&other.as_date_time())
  }
}

fn shift_months(date: NaiveDate, amount: i64) -> Option<NaiveDate> {
  let months = Months::new(u32::try_from(amount.unsigned_abs()).ok()?);
  if amount >= 0 {
    date.checked_add_months(months)
  } else {
    date.checked_sub_months(months)
  }
}

/// Parse `UTC`, `Z` or an offset such as `+02:00` / `-0530`.
pub fn parse_time_zone(name: &str) -> Result<FixedOffset, ConditionError> {
  let name = name.trim();
  if name.eq_ignore_ascii_case("utc") || name == "Z" {
    return Ok(Utc.fix());
  }

  let invalid = || ConditionError::InvalidTimeZone(name.to_string());
  let (sign, rest) = match name.as_bytes().first() {
    Some(b'+') => (1, &name[1..]),
    Some(b'-') => (-1, &name[1..]),
    _ => return Err(invalid()),
  };
  let (hours, minutes) = match rest.split_once(':') {
    Some((h, m)) => (h, m),
    None if rest.len() == 4 => rest.split_at(2),
    None => (rest, "0"),
  };
  let hours: i32 = hours.parse().map_err(|_| invalid())?;
  let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
  if minutes >= 60 {
    return Err(invalid());
  }

  FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn date(s: &str) -> Moment {
    Moment::parse(s, Utc.fix()).unwrap()
  }

  #[test]
  fn test_parse_formats() {
    assert!(matches!(date("2026-03-01"), Moment::Date(_)));
    assert!(matches!(date("2026-03-01 10:30:00"), Moment::DateTime(_)));
    assert!(matches!(date("2026-03-01T10:30:00"), Moment::DateTime(_)));
    assert_eq!(
      Moment::parse("2026-03-01T23:30:00Z", parse_time_zone("+02:00").unwrap())
        .unwrap()
        .format(),
      "2026-03-02 01:30:00"
    );
    assert!(Moment::parse("soon", Utc.fix()).is_none());
  }

  #[test]
  fn test_shift_days_and_months() {
    assert_eq!(date("2026-01-31").shift(1, ShiftUnit::Days).unwrap().format(), "2026-02-01");
    assert_eq!(date("2026-01-31").shift(1, ShiftUnit::Months).unwrap().format(), "2026-02-28");
    assert_eq!(date("2026-03-15").shift(-3, ShiftUnit::Months).unwrap().format(), "2025-12-15");
  }

  #[test]
  fn test_intraday_shift_promotes_dates() {
    assert_eq!(
      date("2026-03-01").shift(90, ShiftUnit::Minutes).unwrap().format(),
      "2026-03-01 01:30:00"
    );
    assert_eq!(
      date("2026-03-01 23:00:00").shift(2, ShiftUnit::Hours).unwrap().format(),
      "2026-03-02 01:00:00"
    );
  }

  #[test]
  fn test_today_respects_time_zone() {
    let now = DateTime::parse_from_rfc3339("2026-03-01T23:30:00Z")
      .unwrap()
      .with_timezone(&Utc);
    let tz = parse_time_zone("+02:00").unwrap();
    assert_eq!(Moment::today(now, tz, ShiftUnit::Days).format(), "2026-03-02");
    assert_eq!(Moment::today(now, Utc.fix(), ShiftUnit::Days).format(), "2026-03-01");
  }

  #[test]
  fn test_parse_time_zone() {
    assert_eq!(parse_time_zone("UTC").unwrap().local_minus_utc(), 0);
    assert_eq!(parse_time_zone("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 1800));
    assert_eq!(parse_time_zone("+0200").unwrap().local_minus_utc(), 7200);
    assert!(parse_time_zone("Europe/Paris").is_err());
  }

  #[test]
  fn test_date_orders_as_midnight() {
    assert_eq!(
      date("2026-03-01").cmp_moment(&date("2026-03-01 00:00:01")),
      Ordering::Less
    );
  }
}
