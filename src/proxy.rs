//! SOCKS5 proxy to a jump host
//!
//! [`Socks5Proxy`] owns at most one SSH session plus relay listener pair and
//! hands out standalone dialers that bypass the listener.
//!
//! # Lifecycle
//!
//! `Idle -> Starting -> Running`. `start` while running is a no-op that does
//! not look at its arguments: a second call with a different key or jump host
//! keeps the first session. Callers that need to switch jump hosts must `stop`
//! first. Concurrent `start` calls queue on the lifecycle lock, so only one
//! establishment is ever in flight.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::forwarding::{ForwardStats, ListenerFactory, RelayHandle, RelayServer};
use crate::ssh::{Dial, HostKeyProvider, SshClient, SshError, SshSession, TunnelConfig};

/// The running half of the proxy
struct Running {
    relay: RelayHandle,
    /// None when started from a caller supplied dialer
    session: Option<SshSession>,
}

impl Running {
    /// Listener up and, when the proxy owns one, session still connected
    fn is_live(&self) -> bool {
        self.relay.is_running() && self.session.as_ref().map_or(true, |s| s.is_connected())
    }
}

/// Local SOCKS5 proxy tunnelled through a jump host
pub struct Socks5Proxy {
    host_keys: Arc<dyn HostKeyProvider>,
    config: TunnelConfig,
    client: SshClient,
    relay_server: RelayServer,
    /// Serializes start/stop
    lifecycle: Mutex<()>,
    running: RwLock<Option<Running>>,
}

impl Socks5Proxy {
    pub fn new(host_keys: Arc<dyn HostKeyProvider>) -> Self {
        let config = TunnelConfig::default();
        Self {
            client: SshClient::new(config.clone(), host_keys.clone()),
            host_keys,
            config,
            relay_server: RelayServer::default(),
            lifecycle: Mutex::new(()),
            running: RwLock::new(None),
        }
    }

    pub fn with_config(mut self, config: TunnelConfig) -> Self {
        self.client = SshClient::new(config.clone(), self.host_keys.clone());
        self.config = config;
        self
    }

    /// Replace how the relay opens its listening socket
    pub fn with_listener_factory(mut self, factory: Arc<dyn ListenerFactory>) -> Self {
        self.relay_server = RelayServer::new(factory);
        self
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Connect to the jump host as the configured identity and start the
    /// SOCKS5 listener. No-op if already running.
    pub async fn start(&self, private_key: &str, server_addr: &str) -> Result<(), SshError> {
        let _guard = self.lifecycle.lock().await;
        if !self.prepare_start().await {
            return Ok(());
        }

        let session = self.client.connect("", private_key, server_addr).await?;
        let disconnect_rx = session.subscribe_disconnect();

        let bound = match self.relay_server.bind().await {
            Ok(bound) => bound,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        // Lost before we subscribed; the broadcast is gone but the flag is not
        if !session.is_connected() {
            return Err(SshError::SshDial(format!(
                "connection to {} closed during startup",
                server_addr
            )));
        }

        let relay = bound.serve(Arc::new(session.clone()), Some(disconnect_rx));
        info!(
            "SOCKS5 proxy on {} tunnelling through {}",
            relay.bound_addr(),
            server_addr
        );

        *self.running.write() = Some(Running {
            relay,
            session: Some(session),
        });
        Ok(())
    }

    /// Start the SOCKS5 listener on top of an existing dialer, without
    /// establishing a session. No-op if already running.
    pub async fn start_with_dialer<D: Dial>(&self, dialer: D) -> Result<(), SshError> {
        let _guard = self.lifecycle.lock().await;
        if !self.prepare_start().await {
            return Ok(());
        }

        let relay = self.relay_server.bind().await?.serve(Arc::new(dialer), None);
        info!("SOCKS5 proxy on {} using a caller dialer", relay.bound_addr());

        *self.running.write() = Some(Running {
            relay,
            session: None,
        });
        Ok(())
    }

    /// Address of the running SOCKS5 listener (`127.0.0.1:<port>`)
    pub fn addr(&self) -> Result<String, SshError> {
        self.running
            .read()
            .as_ref()
            .filter(|r| r.is_live())
            .map(|r| r.relay.bound_addr().to_string())
            .ok_or(SshError::NotRunning)
    }

    /// Whether the listener is up
    pub fn is_running(&self) -> bool {
        self.addr().is_ok()
    }

    /// Relay statistics of the running listener
    pub fn stats(&self) -> Option<ForwardStats> {
        self.running.read().as_ref().map(|r| r.relay.stats())
    }

    /// Establish a fresh session and return it as a dialer
    ///
    /// Independent of the listener: never shares the broker's session and does
    /// not change `start` state. An empty `username` means the configured
    /// default identity.
    pub async fn dialer(
        &self,
        username: &str,
        private_key: &str,
        server_addr: &str,
    ) -> Result<SshSession, SshError> {
        self.client.connect(username, private_key, server_addr).await
    }

    /// Stop the listener and close the broker's session; back to idle
    ///
    /// Relays still in flight get `stop_grace_ms` to finish, after which the
    /// session is closed anyway, which ends them.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        let running = self.running.write().take();
        if let Some(running) = running {
            Self::teardown(running, &self.config).await;
        }
    }

    /// Returns false when already running. A listener whose session went away
    /// is torn down so a fresh start can proceed.
    async fn prepare_start(&self) -> bool {
        let stale = {
            let mut running = self.running.write();
            match running.as_ref() {
                Some(r) if r.is_live() => {
                    debug!("SOCKS5 proxy already running on {}", r.relay.bound_addr());
                    return false;
                }
                Some(_) => running.take(),
                None => None,
            }
        };

        if let Some(stale) = stale {
            info!("Replacing SOCKS5 proxy whose session went away");
            Self::teardown(stale, &self.config).await;
        }
        true
    }

    async fn teardown(running: Running, config: &TunnelConfig) {
        let Running { relay, session } = running;
        relay.stop(config.stop_grace()).await;
        if let Some(session) = session {
            session.close().await;
        }
        info!("SOCKS5 proxy stopped");
    }
}
