use rand::Rng;

/// Title given to synthesized break slots
pub const COMMERCIAL_BREAK_TITLE: &str = "Commercial Break";

/// Title used when nothing in the schedule is on air
pub const DEFAULT_PROGRAM_TITLE: &str = "We're Be Right Back!";

/// Size of each read from the transcoder's stdout
pub const OUTPUT_CHUNK_SIZE: usize = 8192;

/// Minutes in a day, exclusive upper bound for slot times
pub const MINUTES_PER_DAY: u32 = 24 * 60;

/// Generate a unique session ID for this relay run
/// Reported on the metadata endpoint so listeners can detect a service restart
pub fn generate_session_id() -> String {
    format!(
        "relay_{}",
        rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(12)
            .map(char::from)
            .collect::<String>()
    )
}
