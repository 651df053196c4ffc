//! Five-field cron expressions, evaluated in UTC at minute resolution.
//!
//! Supported syntax per field: `*`, `n`, `a-b`, lists `a,b,c`, steps
//! `*/n`, `a-b/n`, `a/n`, month names (`JAN`..`DEC`) and weekday names
//! (`SUN`..`SAT`). Weekday `7` is Sunday. The presets `@yearly`,
//! `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight` and `@hourly`
//! expand to their usual expressions.
//!
//! When both day-of-month and day-of-week are restricted, a day matches if
//! *either* field matches.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::EngineError;

/// Searches give up after this many years without a match (Feb 29 needs 8).
const MAX_SEARCH_YEARS: i32 = 10;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Names for `min..`, in order.
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec { name: "month", min: 1, max: 12, names: MONTH_NAMES };
// 7 is accepted as a second Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec { name: "day-of-week", min: 0, max: 7, names: WEEKDAY_NAMES };

/// A parsed cron schedule.
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

impl CronSchedule {
    /// Parse a five-field expression or preset.
    ///
    /// # Errors
    /// [`EngineError::InvalidCron`] naming the offending field.
    pub fn parse(expression: &str) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidCron {
            expression: expression.to_owned(),
            reason,
        };

        let trimmed = expression.trim();
        let expanded = match trimmed.to_ascii_lowercase().as_str() {
            "@yearly" | "@annually" => "0 0 1 1 *",
            "@monthly" => "0 0 1 * *",
            "@weekly" => "0 0 * * 0",
            "@daily" | "@midnight" => "0 0 * * *",
            "@hourly" => "0 * * * *",
            other if other.starts_with('@') => {
                return Err(invalid(format!("unknown preset '{trimmed}'")));
            }
            _ => trimmed,
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(fields[0], &MINUTE).map_err(&invalid)?;
        let hours = parse_field(fields[1], &HOUR).map_err(&invalid)?;
        let days_of_month = parse_field(fields[2], &DAY_OF_MONTH).map_err(&invalid)?;
        let months = parse_field(fields[3], &MONTH).map_err(&invalid)?;
        let mut days_of_week = parse_field(fields[4], &DAY_OF_WEEK).map_err(&invalid)?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: trimmed.to_owned(),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The expression as written (presets are kept verbatim).
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = floor_minute(after.naive_utc()) + TimeDelta::minutes(1);
        let give_up = t.year() + MAX_SEARCH_YEARS;

        loop {
            if t.year() > give_up {
                return None;
            }
            if !bit(self.months, t.month()) {
                let (y, m) = if t.month() == 12 { (t.year() + 1, 1) } else { (t.year(), t.month() + 1) };
                t = NaiveDate::from_ymd_opt(y, m, 1)?.and_time(NaiveTime::MIN);
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_time(NaiveTime::MIN);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = floor_hour(t) + TimeDelta::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += TimeDelta::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }
    }

    /// Latest fire time at or before `at`.
    pub fn prev_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = floor_minute(at.naive_utc());
        let give_up = t.year() - MAX_SEARCH_YEARS;

        loop {
            if t.year() < give_up {
                return None;
            }
            if !bit(self.months, t.month()) {
                t = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)?.and_time(NaiveTime::MIN)
                    - TimeDelta::minutes(1);
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().and_time(NaiveTime::MIN) - TimeDelta::minutes(1);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = floor_hour(t) - TimeDelta::minutes(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t -= TimeDelta::minutes(1);
                continue;
            }
            return Some(t.and_utc());
        }
    }

    /// Latest fire time strictly before `before`.
    pub fn prev_before(&self, before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.prev_at_or_before(before - TimeDelta::nanoseconds(1))
    }

    /// The next `count` fire times after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = after;
        while out.len() < count {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days_of_month, date.day());
        let dow = bit(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronSchedule {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.expression)
    }
}

impl<'de> Deserialize<'de> for CronSchedule {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn bit(mask: u64, value: u32) -> bool {
    mask & (1u64 << value) != 0
}

fn floor_minute(t: NaiveDateTime) -> NaiveDateTime {
    t - TimeDelta::seconds(i64::from(t.second())) - TimeDelta::nanoseconds(i64::from(t.nanosecond()))
}

fn floor_hour(t: NaiveDateTime) -> NaiveDateTime {
    floor_minute(t) - TimeDelta::minutes(i64::from(t.minute()))
}

fn parse_field(raw: &str, spec: &FieldSpec) -> Result<u64, String> {
    let mut mask = 0u64;

    for part in raw.split(',') {
        if part.is_empty() {
            return Err(format!("empty list item in {} field", spec.name));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}' in {} field", spec.name))?;
                if step == 0 {
                    return Err(format!("step must be positive in {} field", spec.name));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (parse_value(a, spec)?, parse_value(b, spec)?)
        } else {
            let v = parse_value(range, spec)?;
            // `a/n` means "from a to the end, every n".
            (v, if step.is_some() { spec.max } else { v })
        };

        if lo > hi {
            return Err(format!("range {lo}-{hi} is reversed in {} field", spec.name));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step.unwrap_or(1);
        }
    }

    Ok(mask)
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, String> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(raw))
            .map(|idx| spec.min + idx as u32)
            .ok_or_else(|| format!("invalid {} value '{raw}'", spec.name))?,
    };

    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} value {value} out of range {}-{}",
            spec.name, spec.min, spec.max
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn cron(expr: &str) -> CronSchedule {
        CronSchedule::parse(expr).unwrap()
    }

    #[test]
    fn nightly_schedule_fires_at_two() {
        let nightly = cron("0 2 * * *");
        assert_eq!(nightly.next_after(utc(2025, 1, 1, 0, 0)), Some(utc(2025, 1, 1, 2, 0)));
        // Strictly after: a fire time is not its own successor.
        assert_eq!(nightly.next_after(utc(2025, 1, 1, 2, 0)), Some(utc(2025, 1, 2, 2, 0)));
        assert_eq!(nightly.next_after(utc(2025, 12, 31, 3, 0)), Some(utc(2026, 1, 1, 2, 0)));
    }

    #[test]
    fn previous_fire_times() {
        let nightly = cron("0 2 * * *");
        let now = utc(2025, 6, 10, 10, 0);
        assert_eq!(nightly.prev_at_or_before(now), Some(utc(2025, 6, 10, 2, 0)));
        assert_eq!(nightly.prev_at_or_before(utc(2025, 6, 10, 2, 0)), Some(utc(2025, 6, 10, 2, 0)));
        assert_eq!(nightly.prev_before(utc(2025, 6, 10, 2, 0)), Some(utc(2025, 6, 9, 2, 0)));
        assert_eq!(nightly.prev_before(utc(2025, 3, 1, 1, 0)), Some(utc(2025, 2, 28, 2, 0)));
    }

    #[test]
    fn seconds_are_ignored() {
        let nightly = cron("0 2 * * *");
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 2, 0, 30).unwrap();
        assert_eq!(nightly.prev_before(t), Some(utc(2025, 1, 1, 2, 0)));
        assert_eq!(nightly.next_after(t), Some(utc(2025, 1, 2, 2, 0)));
    }

    #[test]
    fn steps_ranges_and_names() {
        let business = cron("*/15 9-17 * * MON-FRI");
        // Friday 2025-06-06 17:50 → Monday 09:00
        assert_eq!(business.next_after(utc(2025, 6, 6, 17, 50)), Some(utc(2025, 6, 9, 9, 0)));
        assert_eq!(business.next_after(utc(2025, 6, 9, 9, 0)), Some(utc(2025, 6, 9, 9, 15)));

        let quarterly = cron("0 6 1 jan,apr,jul,oct *");
        assert_eq!(quarterly.next_after(utc(2025, 4, 2, 0, 0)), Some(utc(2025, 7, 1, 6, 0)));

        let offset_step = cron("5/20 * * * *");
        assert_eq!(
            offset_step.upcoming(utc(2025, 1, 1, 0, 0), 3),
            vec![utc(2025, 1, 1, 0, 5), utc(2025, 1, 1, 0, 25), utc(2025, 1, 1, 0, 45)]
        );
    }

    #[test]
    fn day_of_month_or_day_of_week() {
        // Both restricted: the 13th OR any Friday.
        let either = cron("0 0 13 * FRI");
        assert_eq!(either.next_after(utc(2025, 6, 1, 0, 0)), Some(utc(2025, 6, 6, 0, 0)));

        // Day-of-week unrestricted: only the 13th.
        let thirteenth = cron("0 0 13 * *");
        assert_eq!(thirteenth.next_after(utc(2025, 6, 1, 0, 0)), Some(utc(2025, 6, 13, 0, 0)));
    }

    #[test]
    fn seven_is_sunday() {
        assert_eq!(cron("0 0 * * 7").next_after(utc(2025, 6, 2, 0, 0)), Some(utc(2025, 6, 8, 0, 0)));
        assert_eq!(cron("0 0 * * 7"), CronSchedule { expression: "0 0 * * 7".into(), ..cron("0 0 * * 0") });
    }

    #[test]
    fn presets_expand() {
        assert_eq!(cron("@daily").next_after(utc(2025, 1, 1, 2, 0)), Some(utc(2025, 1, 2, 0, 0)));
        assert_eq!(cron("@hourly").next_after(utc(2025, 1, 1, 2, 30)), Some(utc(2025, 1, 1, 3, 0)));
        assert_eq!(cron("@yearly").next_after(utc(2025, 1, 1, 2, 0)), Some(utc(2026, 1, 1, 0, 0)));
        assert_eq!(cron("@weekly").next_after(utc(2025, 6, 2, 0, 0)), Some(utc(2025, 6, 8, 0, 0)));
        assert_eq!(cron("@daily").expression(), "@daily");
    }

    #[test]
    fn rare_and_impossible_dates() {
        assert_eq!(cron("0 0 29 2 *").next_after(utc(2025, 1, 1, 0, 0)), Some(utc(2028, 2, 29, 0, 0)));
        assert_eq!(cron("30 23 31 12 *").next_after(utc(2025, 6, 1, 0, 0)), Some(utc(2025, 12, 31, 23, 30)));
        assert_eq!(cron("0 0 30 2 *").next_after(utc(2025, 1, 1, 0, 0)), None);
        assert_eq!(cron("0 0 30 2 *").prev_at_or_before(utc(2025, 1, 1, 0, 0)), None);
    }

    #[test]
    fn invalid_expressions_are_rejected() {
        for (expr, needle) in [
            ("0 2 * *", "expected 5 fields"),
            ("61 * * * *", "minute value 61"),
            ("0 24 * * *", "hour value 24"),
            ("0 0 0 * *", "day-of-month value 0"),
            ("*/0 * * * *", "step must be positive"),
            ("0 5-1 * * *", "reversed"),
            ("0 0 * FOO *", "invalid month value"),
            ("0 0 * * 1,", "empty list item"),
            ("@fortnightly", "unknown preset"),
        ] {
            match CronSchedule::parse(expr) {
                Err(EngineError::InvalidCron { reason, .. }) => {
                    assert!(reason.contains(needle), "{expr}: {reason}")
                }
                other => panic!("{expr}: expected InvalidCron, got {other:?}"),
            }
        }
    }

    #[test]
    fn serde_uses_the_expression_string() {
        let parsed: CronSchedule = serde_json::from_str("\"0 2 * * *\"").unwrap();
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"0 2 * * *\"");
        assert!(serde_json::from_str::<CronSchedule>("\"nope\"").is_err());
    }
}
