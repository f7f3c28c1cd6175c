//! SSH Session management
//!
//! An [`SshSession`] is one authenticated connection to the jump host. It can
//! be cloned freely; all clones share the connection and may dial concurrently.

use async_trait::async_trait;
use russh::client::Msg;
use russh::ChannelStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tracing::debug;

use super::error::SshError;
use super::handle_owner::HandleController;

/// Byte stream opened through the jump host
pub type TunnelStream = ChannelStream<Msg>;

/// Something that can open a stream to `(network, address)`
///
/// This is the "dial function" handed out by the broker and consumed by the
/// SOCKS5 relay server.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self, network: &str, address: &str) -> Result<Self::Conn, SshError>;
}

/// A handle to an established jump host session
#[derive(Clone)]
pub struct SshSession {
    controller: HandleController,
    username: String,
    server_addr: String,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("username", &self.username)
            .field("server_addr", &self.server_addr)
            .finish_non_exhaustive()
    }
}

impl SshSession {
    pub(crate) fn new(controller: HandleController, username: String, server_addr: String) -> Self {
        Self {
            controller,
            username,
            server_addr,
        }
    }

    /// Identity the session authenticated as
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Jump host address
    pub fn server_addr(&self) -> &str {
        &self.server_addr
    }

    /// Check if the underlying connection is still up
    pub fn is_connected(&self) -> bool {
        self.controller.is_connected()
    }

    /// Receiver that fires once when the connection goes away
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.controller.subscribe_disconnect()
    }

    /// Open a TCP stream to `address` (`host:port`) through the jump host
    pub async fn dial(&self, network: &str, address: &str) -> Result<TunnelStream, SshError> {
        match network {
            "tcp" | "tcp4" | "tcp6" => {}
            other => {
                return Err(SshError::ChannelError(format!(
                    "dial {} {}: unsupported network",
                    other, address
                )))
            }
        }

        let (host, port) = split_destination(address)?;

        debug!("Dialing {}:{} via {}", host, port, self.server_addr);

        let channel = self
            .controller
            .open_direct_tcpip(&host, port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| match e {
                SshError::ChannelError(cause) => {
                    SshError::ChannelError(format!("dial {} {}: {}", network, address, cause))
                }
                other => other,
            })?;

        Ok(channel.into_stream())
    }

    /// Tear down the connection and every stream opened through it
    pub async fn close(&self) {
        debug!("Closing SSH session to {}", self.server_addr);
        self.controller.disconnect().await;
    }
}

#[async_trait]
impl Dial for SshSession {
    type Conn = TunnelStream;

    async fn dial(&self, network: &str, address: &str) -> Result<TunnelStream, SshError> {
        SshSession::dial(self, network, address).await
    }
}

/// Split a destination `host:port`, accepting bracketed IPv6 literals
fn split_destination(address: &str) -> Result<(String, u16), SshError> {
    let invalid = |why: &str| SshError::ChannelError(format!("address {}: {}", address, why));

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port in address"))?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| invalid("missing ']' in address"))?,
        None => host,
    };
    let port = port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok((host.to_string(), port))
}
