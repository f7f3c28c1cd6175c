//! known_hosts backed host key provider
//!
//! Looks the jump host up in an OpenSSH `known_hosts` file and pins the stored
//! key. Hashed entries (`|1|...`) and markers (`@cert-authority`, `@revoked`)
//! are skipped. An unknown host is an error: this provider never trusts on
//! first use.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use russh::keys::PublicKey;
use tracing::{debug, warn};

use super::client::split_host_port;
use super::error::{BoxError, SshError};
use super::host_key::HostKeyProvider;

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// Host key provider reading an OpenSSH known_hosts file
pub struct KnownHostsProvider {
    /// host lookup key -> stored keys (several key types per host)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    path: PathBuf,
    /// Preferred key type when a host has several entries
    preferred_type: Option<String>,
}

impl KnownHostsProvider {
    /// Load `~/.ssh/known_hosts`
    pub fn user_default() -> Result<Self, SshError> {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .ok_or_else(|| SshError::Config("cannot locate home directory".to_string()))?;
        Self::with_path(path)
    }

    /// Load a specific known_hosts file
    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self, SshError> {
        let provider = Self {
            hosts: RwLock::new(HashMap::new()),
            path: path.into(),
            preferred_type: None,
        };
        provider.reload()?;
        Ok(provider)
    }

    /// Prefer a key type (e.g. `ssh-ed25519`) when a host lists several
    pub fn prefer_key_type(mut self, key_type: impl Into<String>) -> Self {
        self.preferred_type = Some(key_type.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file
    pub fn reload(&self) -> Result<(), SshError> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| SshError::Config(format!("read {}: {}", self.path.display(), e)))?;
        let parsed = parse_known_hosts(&contents);
        debug!(
            "Loaded {} known hosts from {}",
            parsed.len(),
            self.path.display()
        );
        *self.hosts.write() = parsed;
        Ok(())
    }

    /// Stored key for `host:port`, if any
    pub fn lookup(&self, server_addr: &str) -> Result<Option<PublicKey>, SshError> {
        let (host, port) = split_host_port(server_addr)?;
        let hosts = self.hosts.read();

        let entries = hosts
            .get(&make_key(&host, port))
            .or_else(|| hosts.get(&host.to_lowercase()));
        let Some(entries) = entries else {
            return Ok(None);
        };

        let entry = self
            .preferred_type
            .as_ref()
            .and_then(|t| entries.iter().find(|e| &e.key_type == t))
            .or_else(|| entries.first());

        match entry {
            Some(entry) => russh::keys::parse_public_key_base64(&entry.key_data)
                .map(Some)
                .map_err(|e| {
                    SshError::Config(format!(
                        "bad {} key for {} in {}: {}",
                        entry.key_type,
                        server_addr,
                        self.path.display(),
                        e
                    ))
                }),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl HostKeyProvider for KnownHostsProvider {
    async fn host_key(
        &self,
        _username: &str,
        _private_key: &str,
        server_addr: &str,
    ) -> Result<PublicKey, BoxError> {
        match self.lookup(server_addr)? {
            Some(key) => Ok(key),
            None => Err(format!(
                "{} not found in {}",
                server_addr,
                self.path.display()
            )
            .into()),
        }
    }
}

/// Parse known_hosts contents into lookup key -> entries
fn parse_known_hosts(contents: &str) -> HashMap<String, Vec<HostKeyEntry>> {
    let mut hosts: HashMap<String, Vec<HostKeyEntry>> = HashMap::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(patterns), Some(key_type), Some(key_data)) =
            (parts.next(), parts.next(), parts.next())
        else {
            warn!("Skipping malformed known_hosts line {}", lineno + 1);
            continue;
        };

        if patterns.starts_with('|') {
            continue;
        }

        for pattern in patterns.split(',') {
            hosts
                .entry(normalize_pattern(pattern))
                .or_default()
                .push(HostKeyEntry {
                    key_type: key_type.to_string(),
                    key_data: key_data.to_string(),
                });
        }
    }

    hosts
}

/// Lowercase a host pattern, keeping the `[host]:port` form
fn normalize_pattern(pattern: &str) -> String {
    match pattern.strip_prefix('[').and_then(|p| p.split_once("]:")) {
        Some((host, "22")) => host.to_lowercase(),
        Some((host, port)) => format!("[{}]:{}", host.to_lowercase(), port),
        None => pattern.to_lowercase(),
    }
}

/// Create lookup key for host:port
fn make_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}
