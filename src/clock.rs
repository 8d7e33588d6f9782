use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use log::warn;

use crate::schedule::{day_name, format_minutes, time_to_minutes};

/// Wall-clock position inside the station's week
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub weekday: Weekday,
    pub minute_of_day: u32,
}

impl std::fmt::Display for LocalTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", day_name(self.weekday), format_minutes(self.minute_of_day))
    }
}

/// Converts instants to the station's local time
///
/// A named zone follows DST transitions; a fixed offset never changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StationClock {
    Named(Tz),
    Fixed(FixedOffset),
}

impl StationClock {
    pub fn utc() -> Self {
        StationClock::Fixed(Utc.fix())
    }

    /// Fixed offset east of UTC, in minutes (EDT is -240)
    pub fn fixed(offset_minutes: i32) -> Self {
        match FixedOffset::east_opt(offset_minutes * 60) {
            Some(offset) => StationClock::Fixed(offset),
            None => {
                warn!(
                    "UTC offset of {} minutes is out of range, using UTC",
                    offset_minutes
                );
                Self::utc()
            }
        }
    }

    /// IANA zone name such as "America/New_York"
    pub fn named(name: &str) -> Option<Self> {
        name.trim().parse::<Tz>().ok().map(StationClock::Named)
    }

    /// Named zone when configured and valid, fixed offset otherwise
    pub fn from_config(timezone: Option<&str>, utc_offset_minutes: i32) -> Self {
        match timezone.map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => Self::named(name).unwrap_or_else(|| {
                warn!(
                    "Unknown timezone '{}', falling back to fixed offset {} minutes",
                    name, utc_offset_minutes
                );
                Self::fixed(utc_offset_minutes)
            }),
            None => Self::fixed(utc_offset_minutes),
        }
    }

    pub fn local_time(&self, instant: DateTime<Utc>) -> LocalTime {
        match self {
            StationClock::Named(tz) => {
                let local = instant.with_timezone(tz);
                LocalTime {
                    weekday: local.weekday(),
                    minute_of_day: time_to_minutes(local.hour(), local.minute()),
                }
            }
            StationClock::Fixed(offset) => {
                let local = instant.with_timezone(offset);
                LocalTime {
                    weekday: local.weekday(),
                    minute_of_day: time_to_minutes(local.hour(), local.minute()),
                }
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            StationClock::Named(tz) => tz.name().to_string(),
            StationClock::Fixed(offset) => format!("UTC{}", offset),
        }
    }
}

impl Default for StationClock {
    fn default() -> Self {
        Self::utc()
    }
}
