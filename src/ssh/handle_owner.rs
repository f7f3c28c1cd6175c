//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the jump host SSH Handle.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. Every dialer (relay tasks,
//! `Dialer` callers) talks to it through a cloneable `HandleController` that
//! sends commands over an mpsc channel. Each channel open runs in its own task
//! so a destination that is slow to answer never holds up other dials, a
//! disconnect request or peer-close detection.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, "10.0.0.5:22".into());
//! let channel = controller.open_direct_tcpip("10.0.0.6", 25555, "127.0.0.1", 0).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

const CLOSED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand<C = Channel<Msg>> {
    /// Open a direct-tcpip channel to a destination behind the jump host
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<C, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (copies the sender). The owner task exits, and the SSH
/// connection is closed, once `disconnect` is called or every clone is dropped.
pub struct HandleController<C = Channel<Msg>> {
    cmd_tx: mpsc::Sender<HandleCommand<C>>,
    disconnect_tx: broadcast::Sender<()>,
}

impl<C> Clone for HandleController<C> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            disconnect_tx: self.disconnect_tx.clone(),
        }
    }
}

impl<C: Send + 'static> HandleController<C> {
    /// Subscribe to SSH disconnect notifications.
    ///
    /// The owner marks the controller disconnected before it broadcasts, so a
    /// subscriber that checks `is_connected` after subscribing never misses
    /// the disconnect.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<C, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| open_error(host, port, e))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// A controller whose owner is already gone
#[cfg(test)]
pub(crate) fn detached_controller() -> HandleController {
    let (cmd_tx, _) = mpsc::channel(1);
    let (disconnect_tx, _) = broadcast::channel(1);
    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Keep the typed refusal reason so the relay can answer with a precise code
fn open_error(host: &str, port: u32, err: russh::Error) -> SshError {
    match err {
        russh::Error::ChannelOpenFailure(reason) => {
            let address = if host.contains(':') {
                format!("[{}]:{}", host, port)
            } else {
                format!("{}:{}", host, port)
            };
            SshError::ChannelOpenFailed { address, reason }
        }
        russh::Error::Disconnect => SshError::Disconnected,
        other => SshError::ChannelError(other.to_string()),
    }
}

/// What the owner task needs from the SSH handle
#[async_trait]
trait ChannelOpener: Send + Sync + 'static {
    type Channel: Send + 'static;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Self::Channel, russh::Error>;

    fn is_closed(&self) -> bool;

    async fn disconnect(&self);
}

#[async_trait]
impl ChannelOpener for Handle<ClientHandler> {
    type Channel = Channel<Msg>;

    async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, russh::Error> {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
            .await
    }

    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    async fn disconnect(&self) {
        let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for sending commands.
/// `label` only appears in logs.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, label: String) -> HandleController {
    spawn_owner(Arc::new(handle), label)
}

fn spawn_owner<O: ChannelOpener>(opener: Arc<O>, label: String) -> HandleController<O::Channel> {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand<O::Channel>>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);
    let disconnect_tx_clone = disconnect_tx.clone();

    tokio::spawn(async move {
        let mut opens = JoinSet::new();

        debug!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    }) => {
                        let opener = opener.clone();
                        opens.spawn(async move {
                            let result = opener
                                .open_direct_tcpip(&host, port, &originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                // Channel is dropped here, the server closes it
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                    None => {
                        debug!("All controllers dropped for {}", label);
                        break;
                    }
                },

                // Reap finished opens
                Some(_) = opens.join_next(), if !opens.is_empty() => {}

                // Keepalive failure or server disconnect ends the session
                _ = closed(opener.as_ref()) => {
                    warn!("SSH connection to {} closed by peer", label);
                    break;
                }
            }
        }

        // Callers of in-flight opens see Disconnected
        opens.abort_all();

        // Close before notifying: late subscribers rely on is_connected
        drain_pending_commands(&mut cmd_rx);

        // Notify disconnect subscribers (relay servers); no subscribers is fine
        let _ = disconnect_tx_clone.send(());

        opener.disconnect().await;
        debug!("Handle owner task terminated for {}", label);
    });

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

/// Resolves once the underlying session is gone
async fn closed<O: ChannelOpener>(opener: &O) {
    loop {
        if opener.is_closed() {
            return;
        }
        tokio::time::sleep(CLOSED_POLL_INTERVAL).await;
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands<C>(cmd_rx: &mut mpsc::Receiver<HandleCommand<C>>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
