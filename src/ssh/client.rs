//! SSH Client implementation using russh
//!
//! Establishes the authenticated connection to the jump host. The order of the
//! steps is fixed: parse the key, ask the [`HostKeyProvider`] for the expected
//! host key, then dial. A malformed key never costs a network round trip and a
//! failed host key lookup never opens a socket.

use std::sync::Arc;

use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PrivateKey, PublicKey};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::error::SshError;
use super::handle_owner::spawn_handle_owner_task;
use super::host_key::{fingerprint, same_key, HostKeyProvider};
use super::session::SshSession;

/// Parse an OpenSSH/PEM private key
pub fn parse_private_key(private_key: &str) -> Result<PrivateKey, SshError> {
    russh::keys::decode_secret_key(private_key, None)
        .map_err(|e| SshError::ParsePrivateKey(e.to_string()))
}

/// Split a `host:port` jump host address
///
/// Bracketed IPv6 (`[::1]:22`) is accepted. Failures are reported as dial
/// errors.
pub fn split_host_port(addr: &str) -> Result<(String, u16), SshError> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        SshError::SshDial(format!("address {}: missing port in address", addr))
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.contains(':') && !addr.starts_with('[') {
        return Err(SshError::SshDial(format!(
            "address {}: too many colons in address",
            addr
        )));
    }
    let port = port
        .parse::<u16>()
        .map_err(|_| SshError::SshDial(format!("address {}: invalid port", addr)))?;
    Ok((host.to_string(), port))
}

/// Establishes sessions to a jump host
pub struct SshClient {
    config: TunnelConfig,
    host_keys: Arc<dyn HostKeyProvider>,
}

impl SshClient {
    pub fn new(config: TunnelConfig, host_keys: Arc<dyn HostKeyProvider>) -> Self {
        Self { config, host_keys }
    }

    /// Connect to the jump host and return a session
    ///
    /// An empty `username` falls back to the configured default identity.
    pub async fn connect(
        &self,
        username: &str,
        private_key: &str,
        server_addr: &str,
    ) -> Result<SshSession, SshError> {
        let username = self.config.resolve_username(username).to_string();

        let key = parse_private_key(private_key)?;

        let expected = self
            .host_keys
            .host_key(&username, private_key, server_addr)
            .await
            .map_err(SshError::GetHostKey)?;

        debug!(
            "Pinned host key for {}: {}",
            server_addr,
            fingerprint(&expected)
        );

        let handle = self
            .dial(&username, key, server_addr, expected)
            .await
            .map_err(|e| match e {
                SshError::SshDial(_) => e,
                other => SshError::SshDial(other.to_string()),
            })?;

        info!("SSH session established to {}@{}", username, server_addr);

        let controller = spawn_handle_owner_task(handle, server_addr.to_string());
        Ok(SshSession::new(controller, username, server_addr.to_string()))
    }

    async fn dial(
        &self,
        username: &str,
        key: PrivateKey,
        server_addr: &str,
        expected: PublicKey,
    ) -> Result<client::Handle<ClientHandler>, SshError> {
        let (host, port) = split_host_port(server_addr)?;
        let timeout = self.config.timeout();

        info!("Connecting to jump host at {}", server_addr);

        let stream = tokio::time::timeout(timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| SshError::SshDial(format!("dial tcp {}: i/o timeout", server_addr)))?
            .map_err(|e| SshError::SshDial(format!("dial tcp {}: {}", server_addr, e)))?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let handler = ClientHandler::new(server_addr.to_string(), expected);

        let mut handle = tokio::time::timeout(
            timeout,
            client::connect_stream(Arc::new(self.config.client_config()), stream, handler),
        )
        .await
        .map_err(|_| SshError::SshDial(format!("handshake with {} timed out", server_addr)))??;

        debug!("SSH handshake completed");

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
        let authenticated = tokio::time::timeout(
            timeout,
            handle.authenticate_publickey(username, key_with_hash),
        )
        .await
        .map_err(|_| SshError::SshDial(format!("authentication with {} timed out", server_addr)))??;

        if !authenticated.success() {
            return Err(SshError::SshDial(format!(
                "unable to authenticate as {}: publickey rejected by {}",
                username, server_addr
            )));
        }

        debug!("SSH authentication successful");
        Ok(handle)
    }
}

/// Client handler for russh callbacks
///
/// Accepts the server iff it presents exactly the pinned key.
pub struct ClientHandler {
    /// Jump host address, for messages
    host: String,
    /// Key the server must present
    expected: PublicKey,
}

impl ClientHandler {
    pub fn new(host: String, expected: PublicKey) -> Self {
        Self { host, expected }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if same_key(server_public_key, &self.expected) {
            debug!("Host key verified for {}", self.host);
            return Ok(true);
        }

        let expected = fingerprint(&self.expected);
        let actual = fingerprint(server_public_key);
        warn!(
            "HOST KEY MISMATCH for {}! Expected {}, got {}",
            self.host, expected, actual
        );
        Err(SshError::HostKeyMismatch {
            host: self.host.clone(),
            expected,
            actual,
        })
    }
}
