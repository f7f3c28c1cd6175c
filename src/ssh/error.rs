//! SSH Error types

use thiserror::Error;

/// Boxed error returned by pluggable collaborators (host key providers).
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("parse private key: {0}")]
    ParsePrivateKey(String),

    #[error("get host key: {0}")]
    GetHostKey(#[source] BoxError),

    #[error("ssh dial: {0}")]
    SshDial(String),

    #[error("open port: {0}")]
    OpenPort(String),

    #[error("socks5 proxy is not running")]
    NotRunning,

    #[error("host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Channel error: {0}")]
    ChannelError(String),

    /// The jump host refused to open a channel to `address`
    #[error("dial tcp {address}: channel open failure: {reason:?}")]
    ChannelOpenFailed {
        address: String,
        reason: russh::ChannelOpenFailure,
    },

    #[error("socks5: {0}")]
    Socks5(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Disconnected")]
    Disconnected,
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::ParsePrivateKey(err.to_string())
    }
}
