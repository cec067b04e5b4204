//! Daily wall-clock windows that gate immediate build triggering.
//!
//! Everything here is a pure function of the configured times and an injected
//! `now`, so callers decide which clock to read.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeWindowError {
    #[error("Invalid time of day: {0:?}")]
    InvalidTime(String),
}

/// Parse a free-form time of day such as `9:00`, `17:30:15`, `6pm` or `6:30 am`.
pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, TimeWindowError> {
    let invalid = || TimeWindowError::InvalidTime(raw.to_string());

    let lowered = raw.trim().to_ascii_lowercase();
    let (clock, meridiem) = if let Some(rest) = lowered.strip_suffix("am") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = lowered.strip_suffix("pm") {
        (rest.trim_end(), Some(true))
    } else {
        (lowered.as_str(), None)
    };

    let parts: Vec<&str> = clock.split(':').collect();
    if clock.is_empty() || parts.len() > 3 {
        return Err(invalid());
    }

    let number = |s: &str| -> Result<u32, TimeWindowError> {
        if s.is_empty() || s.len() > 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        s.parse().map_err(|_| invalid())
    };

    let mut hour = number(parts[0])?;
    let minute = parts.get(1).map(|s| number(*s)).transpose()?.unwrap_or(0);
    let (second, nanos) = match parts.get(2) {
        Some(sec) => match sec.split_once('.') {
            Some((whole, fraction)) => {
                if fraction.is_empty() || fraction.len() > 9 {
                    return Err(invalid());
                }
                if !fraction.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let scale = 10u32.pow(9 - fraction.len() as u32);
                let frac: u32 = fraction.parse().map_err(|_| invalid())?;
                (number(whole)?, frac * scale)
            }
            None => (number(*sec)?, 0),
        },
        None => (0, 0),
    };

    match meridiem {
        Some(is_pm) => {
            if !(1..=12).contains(&hour) {
                return Err(invalid());
            }
            hour %= 12;
            if is_pm {
                hour += 12;
            }
        }
        None if parts.len() == 1 => return Err(invalid()),
        None => {}
    }

    NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).ok_or_else(invalid)
}

/// A daily interval `[start, end]`; `end < start` means it wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, TimeWindowError> {
        Ok(Self {
            start: parse_time_of_day(start)?,
            end: parse_time_of_day(end)?,
        })
    }

    /// The whole day, `0:00` to `23:59:59`.
    pub fn all_day() -> Self {
        Self {
            start: NaiveTime::default(),
            end: NaiveTime::from_hms_opt(23, 59, 59).unwrap_or_default(),
        }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.end < self.start
    }

    pub fn contains(&self, now: NaiveDateTime) -> bool {
        in_window(self, now)
    }

    pub fn seconds_until_open(&self, now: NaiveDateTime) -> u64 {
        seconds_until_open(self.start, now)
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}",
            self.start.format("%H:%M:%S"),
            self.end.format("%H:%M:%S")
        )
    }
}

/// Whether `now` falls inside `window`, anchoring both ends on `now`'s date.
pub fn in_window(window: &TimeWindow, now: NaiveDateTime) -> bool {
    let today = now.date();
    let mut start = today.and_time(window.start);
    let mut end = today.and_time(window.end);
    if window.crosses_midnight() {
        if end >= now {
            // still inside the stretch that opened yesterday
            start -= TimeDelta::days(1);
        } else {
            end += TimeDelta::days(1);
        }
    }
    start <= now && now <= end
}

/// Whole seconds until today's `start`, rounded up; 0 once `start` has passed.
pub fn seconds_until_open(start: NaiveTime, now: NaiveDateTime) -> u64 {
    let opens_at = now.date().and_time(start);
    if opens_at <= now {
        return 0;
    }
    let delta = opens_at - now;
    let rounded_up = delta.num_seconds() + i64::from(delta.subsec_nanos() != 0);
    rounded_up.max(0) as u64
}
