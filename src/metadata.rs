use chrono::{DateTime, SecondsFormat, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::resolver::ResolvedProgram;

/// Fixed station branding attached to every metadata snapshot
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StationIdentity {
    pub artist: String,
    pub comment: String,
    pub genre: String,
    /// Title shown when no program is scheduled
    #[serde(default = "default_fallback_title")]
    pub fallback_title: String,
    /// Image used when neither the slot nor the artwork table has one
    #[serde(default)]
    pub default_artwork: Option<String>,
}

fn default_fallback_title() -> String {
    crate::constants::DEFAULT_PROGRAM_TITLE.to_string()
}

/// Program title -> artwork URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtworkTable {
    entries: HashMap<String, String>,
}

impl ArtworkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, title: impl Into<String>, url: impl Into<String>) -> &mut Self {
        self.entries.insert(title.into(), url.into());
        self
    }

    pub fn get(&self, title: &str) -> Option<&str> {
        self.entries
            .get(title)
            .map(String::as_str)
            .filter(|url| !url.is_empty())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load a JSON object of title -> URL
    ///
    /// A missing or malformed file yields an empty table; artwork then falls
    /// back to the station default.
    pub fn load_or_empty(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Artwork table '{}' not loaded: {}", path.display(), e);
                return Self::new();
            }
        };
        match serde_json::from_str::<HashMap<String, String>>(&content) {
            Ok(entries) => Self { entries },
            Err(e) => {
                warn!("Artwork table '{}' is invalid: {}", path.display(), e);
                Self::new()
            }
        }
    }
}

impl From<HashMap<String, String>> for ArtworkTable {
    fn from(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

/// The externally visible metadata unit, replaced wholesale each tick
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMetadata {
    pub title: String,
    pub artist: String,
    pub comment: String,
    pub genre: String,
    pub artwork: String,
    /// ISO-8601 UTC instant the snapshot was computed for
    pub timestamp: String,
}

impl ResolvedMetadata {
    /// Same content, ignoring when it was computed
    pub fn same_content(&self, other: &ResolvedMetadata) -> bool {
        self.title == other.title
            && self.artist == other.artist
            && self.comment == other.comment
            && self.genre == other.genre
            && self.artwork == other.artwork
    }
}

/// Format an instant the way snapshots carry it: 2024-01-01T06:00:00.000Z
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Turns a resolved program into display metadata
#[derive(Debug, Clone)]
pub struct Enricher {
    station: StationIdentity,
    artwork: ArtworkTable,
}

impl Enricher {
    pub fn new(station: StationIdentity, artwork: ArtworkTable) -> Self {
        Self { station, artwork }
    }

    /// Artwork for a program: slot URL, then the table, then the station default
    pub fn artwork_for(&self, program: &ResolvedProgram) -> String {
        program
            .slot
            .artwork
            .as_deref()
            .filter(|url| !url.is_empty())
            .or_else(|| self.artwork.get(program.title()))
            .map(str::to_string)
            .unwrap_or_else(|| self.default_artwork())
    }

    fn default_artwork(&self) -> String {
        self.station
            .default_artwork
            .as_deref()
            .filter(|url| !url.is_empty())
            .or_else(|| self.artwork.get(&self.station.fallback_title))
            .unwrap_or_default()
            .to_string()
    }

    pub fn enrich(&self, program: &ResolvedProgram, at: DateTime<Utc>) -> ResolvedMetadata {
        ResolvedMetadata {
            title: program.title().to_string(),
            artist: self.station.artist.clone(),
            comment: self.station.comment.clone(),
            genre: self.station.genre.clone(),
            artwork: self.artwork_for(program),
            timestamp: format_timestamp(at),
        }
    }
}
