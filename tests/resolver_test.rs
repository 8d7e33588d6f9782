use chrono::{DateTime, TimeZone, Utc, Weekday};

use station_relay::clock::StationClock;
use station_relay::metadata::{ArtworkTable, Enricher, StationIdentity};
use station_relay::resolver::{
    day_sequence, expand_breaks, resolve_active_program, ProgramResolver, SlotKind,
};
use station_relay::schedule::{BreakPatterns, ProgramSlot, WeeklySchedule};

const MORNING_SCHEDULE: &str = r#"{
    "schedule": {
        "Monday": [
            {"time": "06:00", "title": "Morning Show"},
            {"time": "09:00", "title": "Late Show"}
        ],
        "Tuesday": "same as Monday"
    }
}"#;

/// 2024-01-01 is a Monday
fn utc(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
}

fn morning_resolver(breaks: BreakPatterns) -> ProgramResolver {
    let schedule = WeeklySchedule::from_json_str(MORNING_SCHEDULE).unwrap().resolve();
    ProgramResolver::new(schedule, breaks, StationClock::utc(), "We're Be Right Back!")
}

#[test]
fn test_alias_day_resolves_to_target_slots() {
    let resolver = morning_resolver(BreakPatterns::new());

    let program = resolver.resolve(utc(2, 7, 30));
    assert_eq!(program.title(), "Morning Show");
    assert_eq!(program.kind, SlotKind::Program);
    assert_eq!(program.weekday, Weekday::Tue);
    assert_eq!(program.minutes_since_midnight, 7 * 60 + 30);

    assert_eq!(resolver.resolve(utc(2, 9, 0)).title(), "Late Show");
}

#[test]
fn test_commercial_break_offsets() {
    let mut breaks = BreakPatterns::new();
    breaks.insert("Morning Show", vec![30, 60]);
    let resolver = morning_resolver(breaks);

    assert_eq!(resolver.resolve(utc(1, 6, 29)).title(), "Morning Show");

    let program = resolver.resolve(utc(1, 6, 31));
    assert_eq!(program.title(), "Commercial Break");
    assert_eq!(program.kind, SlotKind::CommercialBreak);

    // breaks never end by themselves; the next break or program takes over
    assert_eq!(resolver.resolve(utc(1, 6, 59)).title(), "Commercial Break");
    assert_eq!(resolver.resolve(utc(1, 7, 0)).slot.time, 7 * 60);
    assert_eq!(resolver.resolve(utc(1, 9, 1)).title(), "Late Show");
}

#[test]
fn test_default_program_when_nothing_scheduled() {
    let resolver = morning_resolver(BreakPatterns::new());

    // an empty day carries the previous day's last program
    assert_eq!(resolver.resolve(utc(3, 12, 0)).title(), "Late Show");

    // Thursday follows an empty Wednesday
    let program = resolver.resolve(utc(4, 12, 0));
    assert_eq!(program.kind, SlotKind::Default);
    assert_eq!(program.title(), "We're Be Right Back!");

    // Monday before the first slot, Sunday is empty
    let program = resolver.resolve(utc(1, 5, 59));
    assert_eq!(program.kind, SlotKind::Default);
}

#[test]
fn test_previous_day_spillover_before_first_slot() {
    let mut schedule = WeeklySchedule::new();
    schedule
        .set_slots(
            Weekday::Mon,
            vec![
                ProgramSlot::at("02:00", "Overnight").unwrap(),
                ProgramSlot::at("20:00", "Evening News").unwrap(),
            ],
        )
        .set_slots(Weekday::Tue, vec![ProgramSlot::at("06:00", "Morning Show").unwrap()]);
    let resolved = schedule.resolve();

    // only Monday slots that start before Tuesday's first program spill over
    let sequence = day_sequence(&resolved, Weekday::Tue, 3 * 60);
    let titles: Vec<&str> = sequence.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["Overnight", "Morning Show"]);

    let resolver = ProgramResolver::new(
        resolved.clone(),
        BreakPatterns::new(),
        StationClock::utc(),
        "fallback",
    );
    assert_eq!(resolver.resolve(utc(2, 3, 0)).title(), "Overnight");
    assert_eq!(resolver.resolve(utc(2, 1, 0)).kind, SlotKind::Default);

    // after the first slot today, no spillover
    let sequence = day_sequence(&resolved, Weekday::Tue, 7 * 60);
    assert_eq!(sequence.len(), 1);
}

#[test]
fn test_greatest_start_at_or_before_query_for_every_minute() {
    let mut breaks = BreakPatterns::new();
    breaks.insert("Morning Show", vec![15, 45]);
    let resolver = morning_resolver(breaks.clone());
    let sequence = day_sequence(resolver.schedule(), Weekday::Mon, 12 * 60);
    let expanded = expand_breaks(&sequence, &breaks);

    for minute in 0..24 * 60 {
        let at = utc(1, minute / 60, minute % 60);
        let program = resolver.resolve(at);
        let expected = expanded.iter().filter(|e| e.slot.time <= minute).last();
        match expected {
            Some(entry) => {
                assert_eq!(program.slot, entry.slot, "minute {}", minute);
                assert!(program.slot.time <= minute);
            }
            None => assert_eq!(program.kind, SlotKind::Default, "minute {}", minute),
        }
    }
}

#[test]
fn test_break_expansion_keeps_order() {
    let slots = vec![
        ProgramSlot::at("06:00", "Morning Show").unwrap(),
        ProgramSlot::at("07:00", "Midday").unwrap(),
    ];
    let mut breaks = BreakPatterns::new();
    // unsorted input is normalized
    breaks.insert("Morning Show", vec![50, 20]);

    let expanded = expand_breaks(&slots, &breaks);
    let times: Vec<u32> = expanded.iter().map(|e| e.slot.time).collect();
    assert_eq!(times, vec![360, 380, 410, 420]);
    assert!(times.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(expanded[0].kind, SlotKind::Program);
    assert_eq!(expanded[3].slot.title, "Midday");
    assert_eq!(breaks.offsets("Morning Show"), &[20, 50]);
}

#[test]
fn test_huge_break_offset_is_dropped() {
    let mut breaks = BreakPatterns::new();
    breaks.insert("Morning Show", vec![30, u32::MAX - 100]);
    assert_eq!(breaks.offsets("Morning Show"), &[30]);
    let resolver = morning_resolver(breaks);

    assert_eq!(resolver.resolve(utc(1, 6, 45)).title(), "Commercial Break");
    assert_eq!(resolver.resolve(utc(1, 7, 0)).title(), "Commercial Break");
    assert_eq!(resolver.resolve(utc(1, 9, 0)).title(), "Late Show");
}

#[test]
fn test_break_past_midnight_is_skipped() {
    let slots = vec![ProgramSlot::at("23:00", "Late Movie").unwrap()];
    let mut breaks = BreakPatterns::new();
    breaks.insert("Late Movie", vec![45, 90]);

    let expanded = expand_breaks(&slots, &breaks);
    let times: Vec<u32> = expanded.iter().map(|e| e.slot.time).collect();
    assert_eq!(times, vec![23 * 60, 23 * 60 + 45]);
}

#[test]
fn test_alias_resolution_is_idempotent() {
    let schedule = WeeklySchedule::from_json_str(MORNING_SCHEDULE).unwrap();
    let once = schedule.resolve();
    let twice = WeeklySchedule::from(&once).resolve();
    assert_eq!(once, twice);
    assert_eq!(once.day(Weekday::Mon), once.day(Weekday::Tue));

    // resolving does not touch the source table
    assert!(schedule.entry(Weekday::Tue).is_some());
    assert_eq!(schedule.resolve(), once);
}

#[test]
fn test_chained_and_dangling_aliases_are_empty() {
    let json = r#"{
        "schedule": {
            "Monday": [{"time": "06:00", "title": "Morning Show"}],
            "Tuesday": "same as Monday",
            "Wednesday": "same as Tuesday",
            "Thursday": "Friday",
            "Saturday": "whenever"
        }
    }"#;
    let resolved = WeeklySchedule::from_json_str(json).unwrap().resolve();
    assert_eq!(resolved.day(Weekday::Tue).len(), 1);
    assert!(resolved.day(Weekday::Wed).is_empty());
    assert!(resolved.day(Weekday::Thu).is_empty());
    assert!(resolved.day(Weekday::Sat).is_empty());
}

#[test]
fn test_malformed_slots_are_skipped() {
    let json = r#"{
        "schedule": {
            "Monday": [
                {"time": "06:00", "title": "Morning Show", "artwork": "https://img/morning.png"},
                {"time": "25:00", "title": "Impossible"},
                {"title": "No Time"},
                {"time": "12:00", "title": "Noon"}
            ],
            "Funday": []
        }
    }"#;
    let resolved = WeeklySchedule::from_json_str(json).unwrap().resolve();
    let monday = resolved.day(Weekday::Mon);
    assert_eq!(monday.len(), 2);
    assert_eq!(monday[0].artwork.as_deref(), Some("https://img/morning.png"));
    assert_eq!(monday[1].title, "Noon");

    assert!(WeeklySchedule::from_json_str("not json").is_err());
    assert!(WeeklySchedule::from_json_str(r#"{"days": {}}"#).is_err());
}

#[test]
fn test_unsorted_day_is_sorted() {
    let mut schedule = WeeklySchedule::new();
    schedule.set_slots(
        Weekday::Fri,
        vec![
            ProgramSlot::at("18:00", "Evening").unwrap(),
            ProgramSlot::at("06:00", "Morning").unwrap(),
        ],
    );
    let resolved = schedule.resolve();
    let times: Vec<u32> = resolved.day(Weekday::Fri).iter().map(|s| s.time).collect();
    assert_eq!(times, vec![360, 1080]);
}

#[test]
fn test_named_timezone_conversion() {
    let schedule = WeeklySchedule::from_json_str(MORNING_SCHEDULE).unwrap().resolve();
    let clock = StationClock::from_config(Some("America/New_York"), 0);

    // 12:30 UTC in January is 07:30 EST
    let program = resolve_active_program(
        &schedule,
        &BreakPatterns::new(),
        &clock,
        utc(2, 12, 30),
        "fallback",
    );
    assert_eq!(program.title(), "Morning Show");
    assert_eq!(program.minutes_since_midnight, 7 * 60 + 30);

    // 03:00 UTC Tuesday is still Monday evening in New York
    let local = clock.local_time(utc(2, 3, 0));
    assert_eq!(local.weekday, Weekday::Mon);
    assert_eq!(local.minute_of_day, 22 * 60);
}

#[test]
fn test_fixed_offset_fallback() {
    // unknown zone falls back to the configured offset (EDT)
    let clock = StationClock::from_config(Some("Mars/Olympus_Mons"), -240);
    let local = clock.local_time(utc(2, 11, 30));
    assert_eq!(local.weekday, Weekday::Tue);
    assert_eq!(local.minute_of_day, 7 * 60 + 30);

    let clock = StationClock::from_config(None, 0);
    assert_eq!(clock.local_time(utc(1, 0, 5)).minute_of_day, 5);

    // out-of-range offsets degrade to UTC
    let clock = StationClock::fixed(24 * 60 * 2);
    assert_eq!(clock.local_time(utc(1, 10, 0)).minute_of_day, 600);
}

#[test]
fn test_enricher_artwork_fallbacks() {
    let station = StationIdentity {
        artist: "WKMG-DT1".to_string(),
        comment: "ClickOrlando / News 6".to_string(),
        genre: "Television".to_string(),
        fallback_title: "We're Be Right Back!".to_string(),
        default_artwork: None,
    };
    let mut artwork = ArtworkTable::new();
    artwork
        .insert("Late Show", "https://img/late.png")
        .insert("We're Be Right Back!", "https://img/brb.png");
    let enricher = Enricher::new(station, artwork);

    let json = r#"{
        "schedule": {
            "Monday": [
                {"time": "06:00", "title": "Morning Show", "artwork": "https://img/slot.png"},
                {"time": "09:00", "title": "Late Show"},
                {"time": "12:00", "title": "Unknown Show"}
            ]
        }
    }"#;
    let schedule = WeeklySchedule::from_json_str(json).unwrap().resolve();
    let resolver = ProgramResolver::new(
        schedule,
        BreakPatterns::new(),
        StationClock::utc(),
        "We're Be Right Back!",
    );

    let at = utc(1, 6, 30);
    let meta = enricher.enrich(&resolver.resolve(at), at);
    assert_eq!(meta.artwork, "https://img/slot.png");
    assert_eq!(meta.artist, "WKMG-DT1");
    assert_eq!(meta.comment, "ClickOrlando / News 6");
    assert_eq!(meta.genre, "Television");
    assert_eq!(meta.timestamp, "2024-01-01T06:30:00.000Z");

    let at = utc(1, 9, 30);
    assert_eq!(enricher.enrich(&resolver.resolve(at), at).artwork, "https://img/late.png");

    // no table entry: the fallback program's artwork
    let at = utc(1, 12, 30);
    assert_eq!(enricher.enrich(&resolver.resolve(at), at).artwork, "https://img/brb.png");
}
