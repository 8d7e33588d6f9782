//! Answers "what is on air right now" from the weekly table.
//!
//! Resolution runs in four steps over the alias-resolved schedule:
//! pick the local day, borrow pre-dawn slots from the previous day when the
//! query precedes the day's first program, expand commercial breaks, then
//! take the latest slot that has started.

use chrono::{DateTime, Utc, Weekday};
use log::debug;

use crate::clock::{LocalTime, StationClock};
use crate::constants::{COMMERCIAL_BREAK_TITLE, MINUTES_PER_DAY};
use crate::schedule::{BreakPatterns, ProgramSlot, ResolvedSchedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// A program from the schedule
    Program,
    /// A synthesized break inside a program
    CommercialBreak,
    /// Nothing scheduled; the station fallback
    Default,
}

/// A slot from the expanded day sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedSlot {
    pub slot: ProgramSlot,
    pub kind: SlotKind,
}

/// The slot active at a queried instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedProgram {
    pub slot: ProgramSlot,
    pub kind: SlotKind,
    pub weekday: Weekday,
    pub minutes_since_midnight: u32,
}

impl ResolvedProgram {
    pub fn title(&self) -> &str {
        &self.slot.title
    }
}

/// Slots that may be on air on `weekday` at `minute`
///
/// When the day is empty, or `minute` precedes its first slot, the previous
/// day's slots that start before today's first slot are merged in.
pub fn day_sequence(
    schedule: &ResolvedSchedule,
    weekday: Weekday,
    minute: u32,
) -> Vec<ProgramSlot> {
    let today = schedule.day(weekday);
    let first = today.first().map(|slot| slot.time);

    let spills = match first {
        None => true,
        Some(first_time) => minute < first_time,
    };
    if !spills {
        return today.to_vec();
    }

    let cutoff = first.unwrap_or(MINUTES_PER_DAY);
    let mut sequence: Vec<ProgramSlot> = schedule
        .day(weekday.pred())
        .iter()
        .filter(|slot| slot.time < cutoff)
        .chain(today.iter())
        .cloned()
        .collect();
    sequence.sort_by_key(|slot| slot.time);
    sequence
}

/// Insert a break slot after each program at every configured offset
///
/// Offsets are not clipped to the program's end: a break past the next
/// program's start still appears, ordered by time. Breaks that would start
/// at or after midnight are dropped.
pub fn expand_breaks(slots: &[ProgramSlot], breaks: &BreakPatterns) -> Vec<ExpandedSlot> {
    let mut expanded = Vec::with_capacity(slots.len());
    for slot in slots {
        expanded.push(ExpandedSlot {
            slot: slot.clone(),
            kind: SlotKind::Program,
        });
        for offset in breaks.offsets(&slot.title) {
            match slot.time.checked_add(*offset) {
                Some(time) if time < MINUTES_PER_DAY => expanded.push(ExpandedSlot {
                    slot: ProgramSlot::new(time, COMMERCIAL_BREAK_TITLE),
                    kind: SlotKind::CommercialBreak,
                }),
                _ => debug!(
                    "Break {}m into '{}' falls past midnight, skipped",
                    offset, slot.title
                ),
            }
        }
    }
    // stable: equal times keep declaration order
    expanded.sort_by_key(|entry| entry.slot.time);
    expanded
}

/// Latest slot whose start is at or before `minute`; later-declared wins ties
pub fn select_active(expanded: &[ExpandedSlot], minute: u32) -> Option<&ExpandedSlot> {
    expanded.iter().filter(|entry| entry.slot.time <= minute).last()
}

/// Resolve against an already-converted local time
pub fn resolve_at(
    schedule: &ResolvedSchedule,
    breaks: &BreakPatterns,
    local: LocalTime,
    default_title: &str,
) -> ResolvedProgram {
    let sequence = day_sequence(schedule, local.weekday, local.minute_of_day);
    let expanded = expand_breaks(&sequence, breaks);

    match select_active(&expanded, local.minute_of_day) {
        Some(entry) => ResolvedProgram {
            slot: entry.slot.clone(),
            kind: entry.kind,
            weekday: local.weekday,
            minutes_since_midnight: local.minute_of_day,
        },
        None => ResolvedProgram {
            slot: ProgramSlot::new(0, default_title),
            kind: SlotKind::Default,
            weekday: local.weekday,
            minutes_since_midnight: local.minute_of_day,
        },
    }
}

pub fn resolve_active_program(
    schedule: &ResolvedSchedule,
    breaks: &BreakPatterns,
    clock: &StationClock,
    instant: DateTime<Utc>,
    default_title: &str,
) -> ResolvedProgram {
    resolve_at(schedule, breaks, clock.local_time(instant), default_title)
}

/// Schedule, break patterns and clock bundled for repeated queries
#[derive(Debug, Clone)]
pub struct ProgramResolver {
    schedule: ResolvedSchedule,
    breaks: BreakPatterns,
    clock: StationClock,
    default_title: String,
}

impl ProgramResolver {
    pub fn new(
        schedule: ResolvedSchedule,
        breaks: BreakPatterns,
        clock: StationClock,
        default_title: impl Into<String>,
    ) -> Self {
        Self {
            schedule,
            breaks,
            clock,
            default_title: default_title.into(),
        }
    }

    pub fn resolve(&self, instant: DateTime<Utc>) -> ResolvedProgram {
        resolve_active_program(
            &self.schedule,
            &self.breaks,
            &self.clock,
            instant,
            &self.default_title,
        )
    }

    pub fn clock(&self) -> &StationClock {
        &self.clock
    }

    pub fn schedule(&self) -> &ResolvedSchedule {
        &self.schedule
    }
}
