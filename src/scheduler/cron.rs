//! Five-field cron expressions: parsing, matching and next-run search.
//!
//! Fields are minute (0-59), hour (0-23), day of month (1-31), month (1-12)
//! and day of week (0-6, Sunday = 0; 7 is accepted as Sunday). Each field
//! accepts `*`, single values, lists `a,b`, ranges `a-b`, and steps `*/n`,
//! `a-b/n`, `a/n` (a through the field maximum). A time is due when all
//! five fields match. All times are UTC.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

/// How far ahead [`CronExpression::next_run_date`] searches.
pub const MAX_LOOKAHEAD_DAYS: i64 = 366;

/// A parsed cron expression. Each field is the explicit set of allowed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CronExpression {
    source: String,
    minutes: BTreeSet<u32>,
    hours: BTreeSet<u32>,
    days: BTreeSet<u32>,
    months: BTreeSet<u32>,
    weekdays: BTreeSet<u32>,
}

impl CronExpression {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let field = |idx: usize, name: &str, min: u32, max: u32| {
            parse_field(fields[idx], min, max).map_err(|reason| {
                invalid(expression, format!("{name} field '{}': {reason}", fields[idx]))
            })
        };

        let minutes = field(0, "minute", 0, 59)?;
        let hours = field(1, "hour", 0, 23)?;
        let days = field(2, "day-of-month", 1, 31)?;
        let months = field(3, "month", 1, 12)?;
        let weekdays = field(4, "day-of-week", 0, 7)?
            .into_iter()
            .map(|d| d % 7)
            .collect();

        Ok(Self {
            source: fields.join(" "),
            minutes,
            hours,
            days,
            months,
            weekdays,
        })
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `dt` (to the minute) matches every field.
    pub fn is_due(&self, dt: DateTime<Utc>) -> bool {
        self.matches_day(dt)
            && self.hours.contains(&dt.hour())
            && self.minutes.contains(&dt.minute())
    }

    fn matches_day(&self, dt: DateTime<Utc>) -> bool {
        self.months.contains(&dt.month())
            && self.days.contains(&dt.day())
            && self.weekdays.contains(&dt.weekday().num_days_from_sunday())
    }

    /// First due minute at or after `from` (truncated to the minute).
    pub fn next_run_date(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let start = truncate_to_minute(from);
        let limit = start + Duration::days(MAX_LOOKAHEAD_DAYS);
        let mut candidate = start;

        while candidate <= limit {
            if !self.matches_day(candidate) {
                candidate = start_of_next_day(candidate);
                continue;
            }
            if !self.hours.contains(&candidate.hour()) {
                candidate = start_of_next_hour(candidate);
                continue;
            }
            if self.minutes.contains(&candidate.minute()) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }

        Err(ScheduleError::NoUpcomingRun {
            expression: self.source.clone(),
            days: MAX_LOOKAHEAD_DAYS,
        })
    }

    /// Up to `count` consecutive run times starting at `from`.
    pub fn upcoming(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = from;
        while out.len() < count {
            match self.next_run_date(cursor) {
                Ok(next) => {
                    out.push(next);
                    cursor = next + Duration::minutes(1);
                }
                Err(_) => break,
            }
        }
        out
    }
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

fn start_of_next_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    truncate_to_minute(dt) - Duration::minutes(dt.minute() as i64) + Duration::hours(1)
}

fn start_of_next_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = dt
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|n| n.and_utc())
        .unwrap_or(dt);
    midnight + Duration::days(1)
}

fn invalid(expression: &str, reason: String) -> ScheduleError {
    ScheduleError::InvalidCron {
        expression: expression.to_string(),
        reason,
    }
}

/// Expand one field into its value set.
fn parse_field(text: &str, min: u32, max: u32) -> Result<BTreeSet<u32>, String> {
    let mut values = BTreeSet::new();

    for part in text.split(',') {
        if part.is_empty() {
            return Err("empty list element".into());
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step '{step}'"))?;
                if step == 0 {
                    return Err("step must be at least 1".into());
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(a, min, max)?;
            let hi = parse_value(b, min, max)?;
            if lo > hi {
                return Err(format!("range {lo}-{hi} is reversed"));
            }
            (lo, hi)
        } else {
            let value = parse_value(range, min, max)?;
            match step {
                Some(_) => (value, max),
                None => (value, value),
            }
        };

        values.extend((lo..=hi).step_by(step.unwrap_or(1) as usize));
    }

    Ok(values)
}

fn parse_value(text: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = text
        .parse()
        .map_err(|_| format!("'{text}' is not a number"))?;
    if value < min || value > max {
        return Err(format!("{value} is outside {min}-{max}"));
    }
    Ok(value)
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for CronExpression {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<CronExpression> for String {
    fn from(expr: CronExpression) -> Self {
        expr.source
    }
}
