//! Tunnel Configuration

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Identity used when the caller does not name one
pub const DEFAULT_USERNAME: &str = "jumpbox";

/// Jump host tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Username for `start` and for `dialer` calls with an empty username
    #[serde(default = "default_username")]
    pub username: String,

    /// TCP connect + SSH handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// SSH keepalive interval in seconds (None disables keepalives)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: Option<u64>,

    /// Disconnect after this many unanswered keepalives
    #[serde(default = "default_keepalive_max")]
    pub keepalive_max: usize,

    /// How long `stop` waits for in-flight relays, in milliseconds
    #[serde(default = "default_stop_grace")]
    pub stop_grace_ms: u64,
}

impl TunnelConfig {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SshError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SshError::Config(format!("read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| SshError::Config(format!("parse {}: {}", path.display(), e)))
    }

    /// Resolve the identity for a session; empty means the configured default
    pub fn resolve_username<'a>(&'a self, username: &'a str) -> &'a str {
        if username.is_empty() {
            &self.username
        } else {
            username
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// russh client configuration derived from this config
    pub(crate) fn client_config(&self) -> russh::client::Config {
        russh::client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.keepalive_interval_secs.map(Duration::from_secs),
            keepalive_max: self.keepalive_max,
            ..Default::default()
        }
    }
}

fn default_username() -> String {
    DEFAULT_USERNAME.to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_keepalive_interval() -> Option<u64> {
    Some(30)
}

fn default_keepalive_max() -> usize {
    3
}

fn default_stop_grace() -> u64 {
    5000
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            timeout_secs: default_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            keepalive_max: default_keepalive_max(),
            stop_grace_ms: default_stop_grace(),
        }
    }
}
