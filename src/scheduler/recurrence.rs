//! Next-run computation.
//!
//! All times are UTC. Daily, weekly and monthly rules are computed
//! directly; cron expressions go through the `cron` crate.

use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc, Weekday};

use super::{ScheduleError, ScheduleResult};
use crate::model::Recurrence;

/// Check a recurrence without computing anything from it.
pub fn validate_recurrence(recurrence: &Recurrence) -> ScheduleResult<()> {
    match recurrence {
        Recurrence::Daily { time } => parse_time(time).map(|_| ()),
        Recurrence::Weekly { day_of_week, time } => {
            parse_weekday(day_of_week)?;
            parse_time(time).map(|_| ())
        }
        Recurrence::Monthly { day_of_month, time } => {
            check_day_of_month(*day_of_month)?;
            parse_time(time).map(|_| ())
        }
        Recurrence::Cron { expression } => parse_cron(expression).map(|_| ()),
    }
}

/// First run of `recurrence` strictly after `now`.
pub fn compute_next_run(recurrence: &Recurrence, now: DateTime<Utc>) -> ScheduleResult<DateTime<Utc>> {
    match recurrence {
        Recurrence::Daily { time } => Ok(next_daily(parse_time(time)?, now)),
        Recurrence::Weekly { day_of_week, time } => {
            Ok(next_weekly(parse_weekday(day_of_week)?, parse_time(time)?, now))
        }
        Recurrence::Monthly { day_of_month, time } => {
            next_monthly(check_day_of_month(*day_of_month)?, parse_time(time)?, now)
        }
        Recurrence::Cron { expression } => parse_cron(expression)?
            .after(&now)
            .next()
            .ok_or_else(|| ScheduleError::NoUpcomingRun(expression.clone())),
    }
}

/// Today at `time` if still ahead, else tomorrow.
pub fn next_daily(time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        today + Duration::days(1)
    }
}

/// Next `weekday` at `time`; today counts when the time is still ahead.
pub fn next_weekly(weekday: Weekday, time: NaiveTime, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    let ahead = (7 + weekday.num_days_from_monday() - today.weekday().num_days_from_monday()) % 7;
    let candidate = (today + Duration::days(i64::from(ahead))).and_time(time).and_utc();
    if candidate > now {
        candidate
    } else {
        candidate + Duration::days(7)
    }
}

/// This month's `day` at `time` if still ahead, else next month's. Days
/// past the end of a month fall on its last day.
pub fn next_monthly(day: u32, time: NaiveTime, now: DateTime<Utc>) -> ScheduleResult<DateTime<Utc>> {
    let first_of_month = now
        .date_naive()
        .with_day(1)
        .ok_or(ScheduleError::InvalidDayOfMonth(day))?;

    for offset in 0..2 {
        let month = first_of_month
            .checked_add_months(Months::new(offset))
            .ok_or(ScheduleError::InvalidDayOfMonth(day))?;
        let candidate = clamp_day(month, day).and_time(time).and_utc();
        if candidate > now {
            return Ok(candidate);
        }
    }
    // Next month's date always lies after now
    Err(ScheduleError::InvalidDayOfMonth(day))
}

fn clamp_day(first_of_month: NaiveDate, day: u32) -> NaiveDate {
    (1..=day)
        .rev()
        .find_map(|d| first_of_month.with_day(d))
        .unwrap_or(first_of_month)
}

fn parse_time(time: &str) -> ScheduleResult<NaiveTime> {
    let valid = time.len() == 5 && time.as_bytes()[2] == b':';
    valid
        .then(|| NaiveTime::parse_from_str(time, "%H:%M").ok())
        .flatten()
        .ok_or_else(|| ScheduleError::InvalidTime(time.to_string()))
}

fn parse_weekday(day: &str) -> ScheduleResult<Weekday> {
    Weekday::from_str(day.trim()).map_err(|_| ScheduleError::InvalidWeekday(day.to_string()))
}

fn check_day_of_month(day: u32) -> ScheduleResult<u32> {
    if (1..=31).contains(&day) {
        Ok(day)
    } else {
        Err(ScheduleError::InvalidDayOfMonth(day))
    }
}

/// Parse a cron expression; 5-field expressions get a leading seconds field.
fn parse_cron(expression: &str) -> ScheduleResult<cron::Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };
    cron::Schedule::from_str(&normalized).map_err(|e| ScheduleError::InvalidCron {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}
