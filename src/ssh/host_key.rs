//! Host Identity Verification
//!
//! A [`HostKeyProvider`] tells the session layer which public key the jump host
//! must present. The key is pinned for exactly one handshake: every session
//! establishment asks the provider again, nothing is cached here.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::keys::{PublicKey, PublicKeyBase64};
use sha2::{Digest, Sha256};

use super::error::BoxError;

/// Source of the expected host key for a jump host
///
/// Implementations may query an external directory, read a file or talk to the
/// host itself. Errors are surfaced to the caller unchanged, wrapped as
/// `get host key: <cause>`.
#[async_trait]
pub trait HostKeyProvider: Send + Sync {
    async fn host_key(
        &self,
        username: &str,
        private_key: &str,
        server_addr: &str,
    ) -> Result<PublicKey, BoxError>;
}

/// A provider that always returns the same pinned key
#[derive(Debug, Clone)]
pub struct StaticHostKey {
    key: PublicKey,
}

impl StaticHostKey {
    pub fn new(key: PublicKey) -> Self {
        Self { key }
    }

    /// Parse an OpenSSH public key line (`ssh-ed25519 AAAA... comment`)
    pub fn from_openssh(line: &str) -> Result<Self, BoxError> {
        let key = PublicKey::from_openssh(line.trim())?;
        Ok(Self { key })
    }
}

#[async_trait]
impl HostKeyProvider for StaticHostKey {
    async fn host_key(&self, _: &str, _: &str, _: &str) -> Result<PublicKey, BoxError> {
        Ok(self.key.clone())
    }
}

/// Compute SHA256 fingerprint of public key
pub fn fingerprint(key: &PublicKey) -> String {
    fingerprint_bytes(&key.public_key_bytes())
}

pub(crate) fn fingerprint_bytes(key_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key_bytes);
    let hash = hasher.finalize();
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Byte-for-byte comparison of the wire encoding of two keys (comments ignored)
pub fn same_key(a: &PublicKey, b: &PublicKey) -> bool {
    a.public_key_bytes() == b.public_key_bytes()
}
