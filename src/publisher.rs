//! Publishes each metadata snapshot: always to the local state file, and to
//! the streaming server's admin endpoint whenever the content changed.

use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::AdminConfig;
use crate::metadata::{format_timestamp, ResolvedMetadata};

#[derive(Debug)]
pub enum PublishError {
    Io(PathBuf, std::io::Error),
    Serialize(serde_json::Error),
    Url(String),
    Request(reqwest::Error),
    Rejected { mount: String, status: u16 },
}

impl fmt::Display for PublishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishError::Io(path, err) => {
                write!(f, "Failed to write '{}': {}", path.display(), err)
            }
            PublishError::Serialize(err) => write!(f, "Failed to encode metadata: {}", err),
            PublishError::Url(msg) => write!(f, "Invalid admin URL: {}", msg),
            PublishError::Request(err) => write!(f, "Admin request failed: {}", err),
            PublishError::Rejected { mount, status } => {
                write!(f, "Admin rejected update for {} with HTTP {}", mount, status)
            }
        }
    }
}

impl std::error::Error for PublishError {}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        PublishError::Request(err)
    }
}

/// Outcome of the latest push to one mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushStatus {
    pub ok: bool,
    pub title: String,
    pub at: String,
    pub error: Option<String>,
}

/// Where and how to push metadata updates
#[derive(Debug, Clone)]
pub struct AdminTarget {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub mounts: Vec<String>,
    pub mode: String,
    pub timeout: Duration,
}

impl AdminTarget {
    pub fn from_config(config: &AdminConfig, password: String) -> Self {
        Self {
            base_url: config.base_url(),
            username: config.username.clone(),
            password,
            mounts: config.mounts.clone(),
            mode: config.mode.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// `{base}/admin/metadata?mount=..&mode=..&song=..`
    pub fn update_url(&self, mount: &str, song: &str) -> Result<url::Url, PublishError> {
        let mut url = url::Url::parse(&self.base_url)
            .and_then(|base| base.join("/admin/metadata"))
            .map_err(|e| PublishError::Url(format!("{}: {}", self.base_url, e)))?;
        url.query_pairs_mut()
            .append_pair("mount", mount)
            .append_pair("mode", &self.mode)
            .append_pair("song", song);
        Ok(url)
    }
}

pub type PushStatusMap = Arc<DashMap<String, PushStatus>>;

pub struct MetadataPublisher {
    client: reqwest::Client,
    admin: Option<Arc<AdminTarget>>,
    state_path: PathBuf,
    last_pushed: Option<ResolvedMetadata>,
    push_status: PushStatusMap,
}

impl MetadataPublisher {
    pub fn new(state_path: PathBuf, admin: Option<AdminTarget>) -> Result<Self, PublishError> {
        let timeout = admin
            .as_ref()
            .map(|target| target.timeout)
            .unwrap_or(Duration::from_secs(5));
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            admin: admin.map(Arc::new),
            state_path,
            last_pushed: None,
            push_status: Arc::new(DashMap::new()),
        })
    }

    /// Treat `metadata` as already pushed, e.g. a snapshot left by a previous run
    pub fn seed(&mut self, metadata: ResolvedMetadata) {
        self.last_pushed = Some(metadata);
    }

    /// Shared view of per-mount push results
    pub fn push_status(&self) -> PushStatusMap {
        Arc::clone(&self.push_status)
    }

    /// Persist the snapshot and, if its content changed, push it
    ///
    /// Pushes run in the background; one slow or failing mount never delays
    /// the caller or the other mounts. The handles are returned for callers
    /// that want to wait on them.
    pub fn publish(&mut self, metadata: &ResolvedMetadata) -> Vec<JoinHandle<()>> {
        if let Err(e) = persist_snapshot(&self.state_path, metadata) {
            warn!("{}", e);
        }

        let changed = self
            .last_pushed
            .as_ref()
            .map_or(true, |last| !last.same_content(metadata));
        if !changed {
            return Vec::new();
        }
        self.last_pushed = Some(metadata.clone());
        info!("Now playing: {} ({})", metadata.title, metadata.artist);

        let Some(admin) = &self.admin else {
            return Vec::new();
        };

        admin
            .mounts
            .iter()
            .map(|mount| {
                let client = self.client.clone();
                let admin = Arc::clone(admin);
                let status = Arc::clone(&self.push_status);
                let mount = mount.clone();
                let title = metadata.title.clone();
                tokio::spawn(async move {
                    let result = push_to_mount(&client, &admin, &mount, &title).await;
                    let at = format_timestamp(chrono::Utc::now());
                    let entry = match result {
                        Ok(()) => {
                            debug!("Pushed '{}' to {}", title, mount);
                            PushStatus {
                                ok: true,
                                title,
                                at,
                                error: None,
                            }
                        }
                        Err(e) => {
                            warn!("Metadata push to {} failed: {}", mount, e);
                            PushStatus {
                                ok: false,
                                title,
                                at,
                                error: Some(e.to_string()),
                            }
                        }
                    };
                    status.insert(mount, entry);
                })
            })
            .collect()
    }
}

/// Send one admin metadata update
pub async fn push_to_mount(
    client: &reqwest::Client,
    admin: &AdminTarget,
    mount: &str,
    song: &str,
) -> Result<(), PublishError> {
    let url = admin.update_url(mount, song)?;
    let response = client
        .get(url)
        .basic_auth(&admin.username, Some(&admin.password))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(PublishError::Rejected {
            mount: mount.to_string(),
            status: response.status().as_u16(),
        });
    }
    Ok(())
}

/// Write the snapshot as pretty JSON, replacing the file atomically
pub fn persist_snapshot(path: &Path, metadata: &ResolvedMetadata) -> Result<(), PublishError> {
    let json = serde_json::to_string_pretty(metadata).map_err(PublishError::Serialize)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let io_err = |e: std::io::Error| PublishError::Io(path.to_path_buf(), e);

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(json.as_bytes()).map_err(io_err)?;
    file.write_all(b"\n").map_err(io_err)?;
    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// Read a snapshot written by [`persist_snapshot`]; None if absent or unreadable
pub fn load_snapshot(path: &Path) -> Option<ResolvedMetadata> {
    let content = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(metadata) => Some(metadata),
        Err(e) => {
            warn!("Ignoring unreadable snapshot '{}': {}", path.display(), e);
            None
        }
    }
}
