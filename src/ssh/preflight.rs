//! Host key scan (trust on first use)
//!
//! [`KeyScanProvider`] starts an SSH handshake with the jump host, captures the
//! key presented in `check_server_key` and aborts. The session that follows is
//! then pinned to that key, which only protects against the key changing
//! between the scan and the real connection. Prefer a provider backed by an
//! out-of-band source (a cloud metadata lookup, `KnownHostsProvider`) when one
//! is available.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config};
use russh::keys::PublicKey;
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::client::split_host_port;
use super::error::{BoxError, SshError};
use super::host_key::{fingerprint, HostKeyProvider};

/// Handler that captures the host key and aborts the connection
struct PreflightHandler {
    captured: Arc<parking_lot::Mutex<Option<PublicKey>>>,
}

impl client::Handler for PreflightHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        *self.captured.lock() = Some(server_public_key.clone());
        // Stop here, the scan never authenticates
        Err(SshError::ProtocolError("host key captured".to_string()))
    }
}

/// Host key provider that asks the jump host for its own key
#[derive(Debug, Clone)]
pub struct KeyScanProvider {
    timeout: Duration,
}

impl KeyScanProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Handshake with `server_addr` and return the key it presents
    pub async fn scan(&self, server_addr: &str) -> Result<PublicKey, SshError> {
        let (host, port) = split_host_port(server_addr)?;
        debug!("Scanning host key of {}", server_addr);

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| SshError::SshDial(format!("dial tcp {}: i/o timeout", server_addr)))?
            .map_err(|e| SshError::SshDial(format!("dial tcp {}: {}", server_addr, e)))?;

        let captured = Arc::new(parking_lot::Mutex::new(None));
        let handler = PreflightHandler {
            captured: captured.clone(),
        };
        let config = Config {
            inactivity_timeout: Some(self.timeout),
            ..Default::default()
        };

        // Expected to fail once the key is captured
        let outcome = tokio::time::timeout(
            self.timeout,
            client::connect_stream(Arc::new(config), stream, handler),
        )
        .await;

        if let Some(key) = captured.lock().take() {
            info!(
                "Scanned host key for {}: {}",
                server_addr,
                fingerprint(&key)
            );
            return Ok(key);
        }

        Err(match outcome {
            Ok(Ok(_)) => SshError::ProtocolError(format!(
                "handshake with {} completed without a host key",
                server_addr
            )),
            Ok(Err(e)) => e,
            Err(_) => SshError::SshDial(format!("handshake with {} timed out", server_addr)),
        })
    }
}

impl Default for KeyScanProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl HostKeyProvider for KeyScanProvider {
    async fn host_key(
        &self,
        _username: &str,
        _private_key: &str,
        server_addr: &str,
    ) -> Result<PublicKey, BoxError> {
        Ok(self.scan(server_addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_rejects_bad_address() {
        let err = KeyScanProvider::default().scan("no-port").await.unwrap_err();
        assert!(matches!(err, SshError::SshDial(_)));
    }

    #[tokio::test]
    async fn test_scan_connection_refused() {
        // Grab a free port and release it so nothing listens there
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = KeyScanProvider::new(Duration::from_secs(2))
            .scan(&addr.to_string())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("ssh dial: dial tcp"));
    }
}
