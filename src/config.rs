use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::clock::StationClock;
use crate::constants::MINUTES_PER_DAY;
use crate::metadata::StationIdentity;
use crate::supervisor::RestartPolicy;

fn default_api_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "[::]".to_string()
}

fn default_stream_path() -> String {
    "/stream.mp3".to_string()
}

fn default_buffer_chunks() -> usize {
    256
}

fn default_state_file() -> PathBuf {
    PathBuf::from("currentMetadata.json")
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_program() -> String {
    "ffmpeg".to_string()
}

/// Reads the upstream, drops video, encodes MP3 to stdout
fn default_transcoder_args() -> Vec<String> {
    [
        "-hide_banner",
        "-loglevel",
        "error",
        "-re",
        "-i",
        "{input}",
        "-vn",
        "-af",
        "volume=3.0",
        "-acodec",
        "libmp3lame",
        "-b:a",
        "192k",
        "-metadata",
        "title={title}",
        "-metadata",
        "artist={artist}",
        "-metadata",
        "comment={comment}",
        "-metadata",
        "genre={genre}",
        "-f",
        "mp3",
        "pipe:1",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect()
}

fn default_admin_port() -> u16 {
    8000
}

fn default_admin_username() -> String {
    "source".to_string()
}

fn default_update_mode() -> String {
    "updinfo".to_string()
}

fn default_push_timeout_secs() -> u64 {
    5
}

/// Relay configuration file structure (TOML)
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Station branding attached to every snapshot
    pub station: StationIdentity,
    /// Local time policy for schedule lookups
    #[serde(default)]
    pub clock: ClockConfig,
    /// Weekly schedule JSON
    pub schedule_file: PathBuf,
    /// Title -> artwork URL JSON (optional)
    pub artwork_file: Option<PathBuf>,
    /// Program title -> break offsets in minutes
    #[serde(default)]
    pub commercial_breaks: HashMap<String, Vec<u32>>,
    pub transcoder: TranscoderConfig,
    /// Out-of-band metadata push (optional)
    pub admin: Option<AdminConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Snapshot of the latest metadata (default: currentMetadata.json)
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    /// Metadata recompute interval in milliseconds (default: 1000)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Station clock configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClockConfig {
    /// IANA zone name, e.g. "America/New_York"; takes precedence when valid
    pub timezone: Option<String>,
    /// Fixed offset east of UTC in minutes, used when no valid zone is set
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

/// External transcoder process
#[derive(Debug, Clone, Deserialize)]
pub struct TranscoderConfig {
    /// Executable to run (default: ffmpeg)
    #[serde(default = "default_program")]
    pub program: String,
    /// Upstream audio source URL, substituted for {input}
    pub input_url: String,
    /// Argument template; see CommandTranscoder::render_args for placeholders
    #[serde(default = "default_transcoder_args")]
    pub args: Vec<String>,
}

/// Icecast-style admin endpoint for metadata updates
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    /// Use https for admin requests (default: false)
    #[serde(default)]
    pub tls: bool,
    #[serde(default = "default_admin_username")]
    pub username: String,
    /// Inline password; prefer credential_profile
    pub password: Option<String>,
    /// Profile name in ~/.config/station_relay/credentials.toml
    pub credential_profile: Option<String>,
    /// Mount points to update, e.g. "/live.mp3"
    pub mounts: Vec<String>,
    /// Update mode query parameter (default: updinfo)
    #[serde(default = "default_update_mode")]
    pub mode: String,
    /// Per-request timeout in seconds (default: 5)
    #[serde(default = "default_push_timeout_secs")]
    pub timeout_secs: u64,
}

impl AdminConfig {
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    /// Password from the config or, failing that, the credentials file
    pub fn resolve_password(
        &self,
        credentials: &Option<crate::credentials::Credentials>,
    ) -> Result<String, String> {
        if let Some(password) = &self.password {
            return Ok(password.clone());
        }
        match &self.credential_profile {
            Some(profile) => crate::credentials::get_password(credentials, profile),
            None => Err("[admin] needs either password or credential_profile".to_string()),
        }
    }
}

/// Restart timing for the transcoder
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Minimum seconds between metadata-driven restarts (default: 60)
    pub debounce_secs: u64,
    /// Minimum seconds between crash restarts (default: 5)
    pub min_restart_interval_secs: u64,
    /// Upper bound for crash backoff (default: 60)
    pub max_backoff_secs: u64,
    /// A process running this long resets the failure count (default: 30)
    pub stable_after_secs: u64,
    /// How long to wait for a killed process to exit (default: 5)
    pub kill_timeout_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            debounce_secs: 60,
            min_restart_interval_secs: 5,
            max_backoff_secs: 60,
            stable_after_secs: 30,
            kill_timeout_secs: 5,
        }
    }
}

/// HTTP listener settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// API server port (default: 3000)
    pub port: u16,
    /// Bind address (default: [::], IPv4 + IPv6)
    pub bind: String,
    /// Listener stream path (default: /stream.mp3)
    pub stream_path: String,
    /// Chunks a listener may lag behind before skipping (default: 256)
    pub buffer_chunks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
            bind: default_bind_address(),
            stream_path: default_stream_path(),
            buffer_chunks: default_buffer_chunks(),
        }
    }
}

impl RelayConfig {
    /// Read and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file '{}': {}", path.display(), e))?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| format!("Failed to parse config file '{}': {}", path.display(), e))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        let config: RelayConfig = toml::from_str(content).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the TOML schema cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.tick_interval_ms == 0 {
            return Err("tick_interval_ms must be greater than 0".to_string());
        }
        if self.transcoder.input_url.trim().is_empty() {
            return Err("[transcoder] input_url must not be empty".to_string());
        }

        for (title, offsets) in &self.commercial_breaks {
            if let Some(offset) = offsets.iter().find(|offset| **offset >= MINUTES_PER_DAY) {
                return Err(format!(
                    "[commercial_breaks] offset {} for '{}' must be under {} minutes",
                    offset, title, MINUTES_PER_DAY
                ));
            }
        }

        let stream_path = &self.server.stream_path;
        if !stream_path.starts_with('/') || stream_path.len() < 2 {
            return Err(format!(
                "[server] stream_path '{}' must be an absolute path like /stream.mp3",
                stream_path
            ));
        }
        if stream_path == "/metadata" || stream_path.starts_with("/health") {
            return Err(format!(
                "[server] stream_path '{}' collides with a built-in endpoint",
                stream_path
            ));
        }

        if let Some(admin) = &self.admin {
            if admin.mounts.is_empty() {
                return Err("[admin] is configured but mounts is empty".to_string());
            }
            if let Some(mount) = admin.mounts.iter().find(|m| !m.starts_with('/')) {
                return Err(format!("[admin] mount '{}' must start with '/'", mount));
            }
            if admin.password.is_none() && admin.credential_profile.is_none() {
                return Err("[admin] needs either password or credential_profile".to_string());
            }
        }

        Ok(())
    }

    pub fn station_clock(&self) -> StationClock {
        StationClock::from_config(self.clock.timezone.as_deref(), self.clock.utc_offset_minutes)
    }

    pub fn restart_policy(&self) -> RestartPolicy {
        RestartPolicy {
            debounce: Duration::from_secs(self.supervisor.debounce_secs),
            min_restart_interval: Duration::from_secs(self.supervisor.min_restart_interval_secs),
            max_backoff: Duration::from_secs(self.supervisor.max_backoff_secs),
            stable_after: Duration::from_secs(self.supervisor.stable_after_secs),
        }
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor.kill_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Lock file guarding against two relays on the same state
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.state_file.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }
}
