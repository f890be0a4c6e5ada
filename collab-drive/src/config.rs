//! Configuration for the drive and the synchronization endpoint.
//!
//! Both structs have sensible defaults and can be loaded from TOML; missing
//! keys fall back to the defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CollabError, Result};

/// Client-side collaboration settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Global collaboration flag; when off the drive is a plain pass-through
    pub collaborative: bool,
    /// Base URL of the synchronization endpoint, e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    /// Provider handshake deadline in milliseconds (`None` = wait forever)
    pub ready_timeout_ms: Option<u64>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            collaborative: true,
            server_url: "ws://127.0.0.1:9090".to_string(),
            ready_timeout_ms: Some(10_000),
        }
    }
}

impl DriveConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| CollabError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }

    pub fn ready_timeout(&self) -> Option<Duration> {
        self.ready_timeout_ms.map(Duration::from_millis)
    }
}

/// Synchronization endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds (0 disables pings)
    pub heartbeat_interval_secs: u64,
    /// Directory served as storage (None = in-memory rooms only)
    pub root_dir: Option<PathBuf>,
    /// Warn when two sessions edit the same document
    pub detect_conflicts: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            root_dir: None,
            detect_conflicts: true,
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| CollabError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_toml_str(&read_config(path.as_ref())?)
    }
}

fn read_config(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| CollabError::Config(format!("{}: {e}", path.display())))
}
