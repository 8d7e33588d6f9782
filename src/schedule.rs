use chrono::Weekday;
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::constants::MINUTES_PER_DAY;

/// All days in schedule order, Monday first
pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Parse a time string in "HH:MM" format and return (hour, minute)
pub fn parse_time(time_str: &str) -> Result<(u32, u32), String> {
    let parts: Vec<&str> = time_str.trim().split(':').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid time format '{}', expected HH:MM", time_str));
    }
    let hour: u32 = parts[0]
        .parse()
        .map_err(|_| format!("Invalid hour in '{}'", time_str))?;
    let minute: u32 = parts[1]
        .parse()
        .map_err(|_| format!("Invalid minute in '{}'", time_str))?;
    if hour >= 24 || minute >= 60 {
        return Err(format!("Time '{}' out of range", time_str));
    }
    Ok((hour, minute))
}

/// Convert time to minutes since midnight
pub fn time_to_minutes(hour: u32, minute: u32) -> u32 {
    hour * 60 + minute
}

/// Parse "HH:MM" straight to minutes since midnight
pub fn parse_minute_of_day(time_str: &str) -> Result<u32, String> {
    let (hour, minute) = parse_time(time_str)?;
    Ok(time_to_minutes(hour, minute))
}

/// Format minutes since midnight as "HH:MM"
///
/// Break slots may run past midnight; those keep counting hours (e.g. "24:10").
pub fn format_minutes(minutes: u32) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

/// Full English day name, the form used as schedule keys
pub fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Parse a day name ("Monday", "mon", case-insensitive)
pub fn parse_day(name: &str) -> Option<Weekday> {
    name.trim().parse::<Weekday>().ok()
}

/// Errors raised while loading schedule data
#[derive(Debug)]
pub enum ScheduleError {
    /// The schedule file could not be read
    Io(PathBuf, std::io::Error),
    /// The document is not a schedule at all
    Parse(String),
}

impl fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleError::Io(path, err) => {
                write!(f, "Failed to read schedule '{}': {}", path.display(), err)
            }
            ScheduleError::Parse(msg) => write!(f, "Invalid schedule: {}", msg),
        }
    }
}

impl std::error::Error for ScheduleError {}

/// A single program entry in a day's sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSlot {
    /// Start time in minutes since local midnight
    pub time: u32,
    pub title: String,
    /// Artwork URL given directly on the slot
    pub artwork: Option<String>,
}

impl ProgramSlot {
    pub fn new(time: u32, title: impl Into<String>) -> Self {
        Self {
            time,
            title: title.into(),
            artwork: None,
        }
    }

    /// Build a slot from an "HH:MM" start time
    pub fn at(time_str: &str, title: impl Into<String>) -> Result<Self, String> {
        Ok(Self::new(parse_minute_of_day(time_str)?, title))
    }
}

/// How a day is defined in the weekly table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DayEntry {
    Slots(Vec<ProgramSlot>),
    /// "same as <day>"
    SameAs(Weekday),
}

/// Weekly program table as authored, aliases unresolved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeeklySchedule {
    days: HashMap<Weekday, DayEntry>,
}

#[derive(Deserialize)]
struct ScheduleDocument {
    schedule: HashMap<String, RawDay>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDay {
    Slots(Vec<serde_json::Value>),
    Alias(String),
}

#[derive(Deserialize)]
struct RawSlot {
    time: String,
    title: String,
    #[serde(default)]
    artwork: Option<String>,
}

/// Parse the alias forms "same as Monday" and plain "Monday"
fn parse_alias(value: &str) -> Option<Weekday> {
    let trimmed = value.trim();
    let target = if trimmed.to_lowercase().starts_with("same as") {
        trimmed.get("same as".len()..).unwrap_or("")
    } else {
        trimmed
    };
    parse_day(target)
}

impl WeeklySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_slots(&mut self, day: Weekday, slots: Vec<ProgramSlot>) -> &mut Self {
        self.days.insert(day, DayEntry::Slots(slots));
        self
    }

    pub fn set_alias(&mut self, day: Weekday, same_as: Weekday) -> &mut Self {
        self.days.insert(day, DayEntry::SameAs(same_as));
        self
    }

    pub fn entry(&self, day: Weekday) -> Option<&DayEntry> {
        self.days.get(&day)
    }

    /// Parse the JSON schedule document
    ///
    /// Malformed days and slots are skipped with a warning; only a document
    /// without a `schedule` object is rejected.
    pub fn from_json_str(content: &str) -> Result<Self, ScheduleError> {
        let doc: ScheduleDocument =
            serde_json::from_str(content).map_err(|e| ScheduleError::Parse(e.to_string()))?;

        let mut schedule = WeeklySchedule::new();
        for (name, raw) in doc.schedule {
            let Some(day) = parse_day(&name) else {
                warn!("Ignoring unknown schedule day '{}'", name);
                continue;
            };
            match raw {
                RawDay::Alias(value) => match parse_alias(&value) {
                    Some(target) => {
                        schedule.set_alias(day, target);
                    }
                    None => {
                        warn!("{}: unrecognized alias '{}', treating day as empty", name, value);
                        schedule.set_slots(day, Vec::new());
                    }
                },
                RawDay::Slots(values) => {
                    let mut slots = Vec::with_capacity(values.len());
                    for value in values {
                        let raw_slot: RawSlot = match serde_json::from_value(value) {
                            Ok(slot) => slot,
                            Err(e) => {
                                warn!("{}: skipping malformed slot: {}", name, e);
                                continue;
                            }
                        };
                        match ProgramSlot::at(&raw_slot.time, raw_slot.title) {
                            Ok(mut slot) => {
                                slot.artwork = raw_slot.artwork.filter(|a| !a.is_empty());
                                slots.push(slot);
                            }
                            Err(e) => warn!("{}: skipping slot: {}", name, e),
                        }
                    }
                    schedule.set_slots(day, slots);
                }
            }
        }
        Ok(schedule)
    }

    pub fn load(path: &Path) -> Result<Self, ScheduleError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ScheduleError::Io(path.to_path_buf(), e))?;
        Self::from_json_str(&content)
    }

    /// Resolve aliases into a new immutable table
    ///
    /// Exactly one indirection is followed. An alias pointing at another alias
    /// or at an undefined day resolves to an empty day.
    pub fn resolve(&self) -> ResolvedSchedule {
        let mut days: [Vec<ProgramSlot>; 7] = Default::default();
        for day in WEEK {
            let slots = match self.days.get(&day) {
                None => Vec::new(),
                Some(DayEntry::Slots(slots)) => normalize_day(day, slots),
                Some(DayEntry::SameAs(target)) => match self.days.get(target) {
                    Some(DayEntry::Slots(slots)) => normalize_day(day, slots),
                    Some(DayEntry::SameAs(_)) => {
                        warn!(
                            "{} is an alias of {}, which is itself an alias; treating {} as empty",
                            day_name(day),
                            day_name(*target),
                            day_name(day)
                        );
                        Vec::new()
                    }
                    None => {
                        warn!(
                            "{} is an alias of undefined day {}; treating it as empty",
                            day_name(day),
                            day_name(*target)
                        );
                        Vec::new()
                    }
                },
            };
            days[day.num_days_from_monday() as usize] = slots;
        }
        ResolvedSchedule { days }
    }
}

/// Sort by start time; on equal times the later-declared slot wins
fn normalize_day(day: Weekday, slots: &[ProgramSlot]) -> Vec<ProgramSlot> {
    let mut sorted: Vec<ProgramSlot> = slots
        .iter()
        .filter(|slot| {
            if slot.time >= MINUTES_PER_DAY {
                warn!("{}: dropping slot '{}' outside the day", day_name(day), slot.title);
                return false;
            }
            true
        })
        .cloned()
        .collect();
    sorted.sort_by_key(|slot| slot.time);

    let mut result: Vec<ProgramSlot> = Vec::with_capacity(sorted.len());
    for slot in sorted {
        match result.last_mut() {
            Some(last) if last.time == slot.time => {
                warn!(
                    "{}: '{}' and '{}' both start at {}, keeping '{}'",
                    day_name(day),
                    last.title,
                    slot.title,
                    format_minutes(slot.time),
                    slot.title
                );
                *last = slot;
            }
            _ => result.push(slot),
        }
    }
    result
}

/// Weekly table after alias resolution: every day is an ordered slot list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSchedule {
    days: [Vec<ProgramSlot>; 7],
}

impl ResolvedSchedule {
    pub fn day(&self, day: Weekday) -> &[ProgramSlot] {
        &self.days[day.num_days_from_monday() as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.days.iter().all(|slots| slots.is_empty())
    }
}

impl From<&ResolvedSchedule> for WeeklySchedule {
    fn from(resolved: &ResolvedSchedule) -> Self {
        let mut schedule = WeeklySchedule::new();
        for day in WEEK {
            schedule.set_slots(day, resolved.day(day).to_vec());
        }
        schedule
    }
}

/// Per-program commercial break offsets, in minutes from the program start
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakPatterns {
    patterns: HashMap<String, Vec<u32>>,
}

impl BreakPatterns {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register offsets for a title; they are stored strictly increasing
///
/// Offsets of a day or more are dropped.
    pub fn insert(&mut self, title: impl Into<String>, offsets: Vec<u32>) -> &mut Self {
        let title = title.into();
        let (mut normalized, outside): (Vec<u32>, Vec<u32>) = offsets
            .iter()
            .partition(|offset| **offset < MINUTES_PER_DAY);
        if !outside.is_empty() {
            warn!(
                "Skipping break offsets {:?} for '{}': a break must start within a day",
                outside, title
            );
        }
        normalized.sort_unstable();
        normalized.dedup();
        if outside.is_empty() && normalized != offsets {
            warn!(
                "Break offsets for '{}' are not strictly increasing, using {:?}",
                title, normalized
            );
        }
        self.patterns.insert(title, normalized);
        self
    }

    pub fn offsets(&self, title: &str) -> &[u32] {
        self.patterns.get(title).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl From<HashMap<String, Vec<u32>>> for BreakPatterns {
    fn from(map: HashMap<String, Vec<u32>>) -> Self {
        let mut patterns = BreakPatterns::new();
        for (title, offsets) in map {
            patterns.insert(title, offsets);
        }
        patterns
    }
}
