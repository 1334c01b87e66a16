//! Cron schedules for recurring jobs.
//!
//! Recurring jobs are defined with standard 5-field Unix cron expressions
//! (`minute hour day-of-month month day-of-week`). The `cron` crate expects the
//! extended 7-field form, so 5-field expressions are widened with a `0` seconds
//! field and a `*` year field before parsing.
//!
//! The crate also numbers days of the week 1-7 starting on Sunday, while Unix
//! cron uses 0-7 with both 0 and 7 meaning Sunday. Numeric day-of-week values
//! in 5-field expressions are therefore rewritten to day names while widening.

use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::error::{DomainError, DomainResult};

/// A parsed cron expression.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> DomainResult<Self> {
        let schedule = Schedule::from_str(&to_extended_format(expression))
            .map_err(|e| DomainError::invalid_cron(expression, e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The expression as originally supplied.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Next fire time strictly after `after`, if the schedule fires again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// Like [`CronSchedule::next_after`], but a schedule that never fires again
    /// is reported as an invalid cron.
    pub fn require_next_after(&self, after: DateTime<Utc>) -> DomainResult<DateTime<Utc>> {
        self.next_after(after).ok_or_else(|| {
            DomainError::invalid_cron(&self.expression, "schedule has no upcoming fire time")
        })
    }
}

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

fn to_extended_format(expression: &str) -> String {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    match fields.as_slice() {
        [minute, hour, day, month, weekday] => {
            let weekday = unix_weekdays_to_names(weekday);
            format!("0 {minute} {hour} {day} {month} {weekday} *")
        }
        _ => expression.trim().to_string(),
    }
}

/// Rewrites a Unix day-of-week field into day names. Items that are already
/// named, or that fall outside 0-7, are passed through for the parser to judge.
fn unix_weekdays_to_names(field: &str) -> String {
    if field == "*" || field == "?" {
        return field.to_string();
    }

    field
        .split(',')
        .map(|item| match unix_weekday_item(item) {
            Some(days) => days
                .into_iter()
                .map(|day| DAY_NAMES[day])
                .collect::<Vec<_>>()
                .join(","),
            None => item.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Expands one numeric list item (`n`, `a-b`, `*/s`, `a-b/s`, `n/s`) into the
/// Sunday-based day indices it selects.
fn unix_weekday_item(item: &str) -> Option<BTreeSet<usize>> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step.parse::<usize>().ok().filter(|s| *s > 0)?)),
        None => (item, None),
    };

    let parse_day = |value: &str| value.parse::<usize>().ok().filter(|d| *d <= 7);

    let (start, end) = if range == "*" {
        (0, 7)
    } else if let Some((a, b)) = range.split_once('-') {
        (parse_day(a)?, parse_day(b)?)
    } else {
        let day = parse_day(range)?;
        (day, if step.is_some() { 7 } else { day })
    };

    if start > end {
        return None;
    }

    Some(
        (start..=end)
            .step_by(step.unwrap_or(1))
            .map(|day| day % 7)
            .collect(),
    )
}
