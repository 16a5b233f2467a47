//! Epoch-millisecond timestamps and calendar usage windows
//!
//! Usage windows are fixed calendar periods evaluated in the account's
//! timezone, so "today" for a user in Auckland does not end at UTC midnight.

use std::fmt::{self, Display, Formatter};

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc,
};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

pub const MINUTE_MS: u64 = 60_000;
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Current wall-clock time in epoch milliseconds
#[must_use]
pub fn now_ms() -> Timestamp {
    to_timestamp(Utc::now())
}

#[must_use]
pub fn to_timestamp(at: DateTime<Utc>) -> Timestamp {
    u64::try_from(at.timestamp_millis()).unwrap_or(0)
}

#[must_use]
pub fn to_datetime(ms: Timestamp) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_default()
}

/// Parse an IANA timezone name, `None` meaning UTC
pub fn parse_timezone(name: Option<&str>) -> Result<Tz, ConfigError> {
    name.map_or(Ok(Tz::UTC), |name| {
        name.parse::<Tz>()
            .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))
    })
}

/// Resolve a local wall-clock time to UTC.
///
/// Ambiguous times (clocks going back) resolve to the earlier instant; times
/// inside a gap (clocks going forward) move forward by the gap.
#[must_use]
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(at) | LocalResult::Ambiguous(at, _) => at.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map_or_else(|| naive.and_utc(), |at| at.with_timezone(&Utc)),
    }
}

/// Local hour of day (0..24) for the instant in the given timezone
#[must_use]
pub fn local_hour(ms: Timestamp, tz: Tz) -> u32 {
    to_datetime(ms).with_timezone(&tz).hour()
}

/// A fixed calendar period against which send counts are capped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageWindow {
    Hourly,
    Daily,
    Monthly,
}

impl UsageWindow {
    pub const ALL: [Self; 3] = [Self::Monthly, Self::Daily, Self::Hourly];

    /// The `[start, end)` bounds of the window containing `now` in `tz`
    #[must_use]
    pub fn bounds(self, now: Timestamp, tz: Tz) -> (Timestamp, Timestamp) {
        let local = to_datetime(now).with_timezone(&tz).naive_local();
        let date = local.date();

        let (start, end) = match self {
            Self::Hourly => {
                let start = date.and_hms_opt(local.hour(), 0, 0).unwrap_or(local);
                (start, start + Duration::hours(1))
            }
            Self::Daily => {
                let start = date.and_hms_opt(0, 0, 0).unwrap_or(local);
                (start, start + Duration::days(1))
            }
            Self::Monthly => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
                let next = if date.month() == 12 {
                    NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                } else {
                    NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
                }
                .unwrap_or(first);
                (
                    first.and_hms_opt(0, 0, 0).unwrap_or(local),
                    next.and_hms_opt(0, 0, 0).unwrap_or(local),
                )
            }
        };

        (
            to_timestamp(resolve_local(tz, start)),
            to_timestamp(resolve_local(tz, end)),
        )
    }
}

impl Display for UsageWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        })
    }
}
