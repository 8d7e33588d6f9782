use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// Credentials file structure
///
/// Format:
/// ```toml
/// [icecast.profile_name]
/// password = "your_admin_password_here"
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    #[serde(default)]
    pub icecast: HashMap<String, CredentialProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CredentialProfile {
    pub password: String,
}

/// Default credentials file path: ~/.config/station_relay/credentials.toml
pub fn get_credentials_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("station_relay")
            .join("credentials.toml"),
    )
}

/// Load credentials from the default location
/// Returns None if the file doesn't exist
pub fn load_credentials() -> Result<Option<Credentials>, Box<dyn std::error::Error + Send + Sync>> {
    match get_credentials_path() {
        Some(path) => load_credentials_from(&path),
        None => Ok(None),
    }
}

pub fn load_credentials_from(
    path: &std::path::Path,
) -> Result<Option<Credentials>, Box<dyn std::error::Error + Send + Sync>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)?;
    let credentials: Credentials = toml::from_str(&content)?;

    Ok(Some(credentials))
}

/// Get the admin password for an `[icecast.<profile>]` entry
pub fn get_password(credentials: &Option<Credentials>, profile: &str) -> Result<String, String> {
    match credentials {
        Some(creds) => creds
            .icecast
            .get(profile)
            .map(|p| p.password.clone())
            .ok_or_else(|| {
                format!(
                    "Credential profile '[icecast.{}]' not found in credentials file",
                    profile
                )
            }),
        None => Err(format!(
            "Credentials file not found. Expected at: {}",
            get_credentials_path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "~/.config/station_relay/credentials.toml".to_string())
        )),
    }
}
