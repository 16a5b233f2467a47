//! Recurrence expansion
//!
//! Occurrences are computed from the rule alone, so the same rule always
//! yields the same instants and the same occurrence keys. Local send times
//! are resolved in the rule's timezone: ambiguous local times take the
//! earlier instant and times skipped by a DST gap move forward by an hour.

use cadence_common::{
    ConfigError, RecurrenceKind, RecurrenceRule, Timestamp,
    time::{HOUR_MS, parse_timezone, resolve_local, to_datetime, to_timestamp},
};
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime};
use chrono_tz::Tz;

/// Occurrence key prefix for materialised recurrences
const RECURRING_PREFIX: &str = "r:";

/// Local anchor for interval schedules
const CUSTOM_ANCHOR: (i32, u32, u32) = (2000, 1, 1);

/// The occurrence key of a recurring instant
#[must_use]
pub fn occurrence_key(at: Timestamp) -> String {
    format!("{RECURRING_PREFIX}{at}")
}

#[must_use]
pub fn is_recurring_key(key: &str) -> bool {
    key.starts_with(RECURRING_PREFIX)
}

/// Up to `count` occurrences of `rule` strictly after `after`, ascending
pub fn occurrences_after(
    rule: &RecurrenceRule,
    after: Timestamp,
    count: usize,
) -> Result<Vec<Timestamp>, ConfigError> {
    rule.validate()?;
    let tz = parse_timezone(Some(&rule.timezone))?;

    if count == 0 {
        return Ok(Vec::new());
    }

    if let RecurrenceKind::Custom { every_hours } = rule.kind {
        return Ok(interval_occurrences(rule, tz, every_hours, after, count));
    }

    let mut date = to_datetime(after).with_timezone(&tz).date_naive();
    let mut occurrences = Vec::with_capacity(count);

    // Monthly rules advance by month, everything else by day; a year of
    // candidates per requested occurrence is far more than any rule needs.
    let limit = count.saturating_mul(400);
    for _ in 0..limit {
        if let Some(at) = candidate(rule, tz, date)
            && at > after
        {
            occurrences.push(at);
            if occurrences.len() == count {
                break;
            }
        }

        date = match rule.kind {
            RecurrenceKind::Weekly { .. } if date.weekday() == weekday_of(rule) => {
                date + Duration::days(7)
            }
            RecurrenceKind::Monthly { .. } => next_month(date),
            _ => date + Duration::days(1),
        };
    }

    Ok(occurrences)
}

fn weekday_of(rule: &RecurrenceRule) -> chrono::Weekday {
    match rule.kind {
        RecurrenceKind::Weekly { weekday } => weekday,
        _ => chrono::Weekday::Mon,
    }
}

/// The instant of the rule's send time on the local `date`, if the rule
/// fires on that date
fn candidate(rule: &RecurrenceRule, tz: Tz, date: NaiveDate) -> Option<Timestamp> {
    let date = match rule.kind {
        RecurrenceKind::Daily => date,
        RecurrenceKind::Weekly { weekday } => {
            if date.weekday() != weekday {
                return None;
            }
            date
        }
        RecurrenceKind::Monthly { day } => {
            let day = day.min(days_in_month(date.year(), date.month()));
            date.with_day(day)?
        }
        RecurrenceKind::Custom { .. } => return None,
    };

    let local = date.and_hms_opt(rule.send_hour, rule.send_minute, 0)?;
    Some(to_timestamp(resolve_local(tz, local)))
}

fn interval_occurrences(
    rule: &RecurrenceRule,
    tz: Tz,
    every_hours: u32,
    after: Timestamp,
    count: usize,
) -> Vec<Timestamp> {
    let step = u64::from(every_hours) * HOUR_MS;
    let anchor = NaiveDate::from_ymd_opt(CUSTOM_ANCHOR.0, CUSTOM_ANCHOR.1, CUSTOM_ANCHOR.2)
        .and_then(|date| date.and_hms_opt(rule.send_hour, rule.send_minute, 0))
        .map_or(0, |local: NaiveDateTime| to_timestamp(resolve_local(tz, local)));

    let first = if after < anchor {
        anchor
    } else {
        anchor + ((after - anchor) / step + 1) * step
    };

    (0..count as u64).map(|i| first + i * step).collect()
}

fn next_month(date: NaiveDate) -> NaiveDate {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(date)
}

fn days_in_month(year: i32, month: u32) -> u32 {
    NaiveDate::from_ymd_opt(year, month, 1).map_or(28, |first| {
        u32::try_from((next_month(first) - first).num_days()).unwrap_or(28)
    })
}
