//! Dynamic SOCKS5 Proxy Forwarding
//!
//! Implements a local SOCKS5 proxy server that tunnels connections through a
//! [`Dial`] implementation (normally the jump host [`SshSession`]).
//! Example: SOCKS5 proxy on 127.0.0.1:<ephemeral> -> SSH tunnel -> any destination
//!
//! [`SshSession`]: crate::ssh::SshSession

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::socks5::{self, negotiate_method, read_request, reply_code_for, write_reply};
use crate::ssh::{Dial, SshError};

/// The relay only ever listens on loopback with an OS-assigned port
pub const LOOPBACK_EPHEMERAL: &str = "127.0.0.1:0";

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Forward statistics
#[derive(Debug, Clone, Default)]
pub struct ForwardStats {
    /// Total connection count
    pub connection_count: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total bytes sent (to remote)
    pub bytes_sent: u64,
    /// Total bytes received (from remote)
    pub bytes_received: u64,
}

/// Opens the relay's listening socket
///
/// Injected into [`RelayServer`] so tests can simulate bind failures.
#[async_trait]
pub trait ListenerFactory: Send + Sync {
    async fn listen(&self, addr: &str) -> std::io::Result<TcpListener>;
}

/// Plain `TcpListener::bind`
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpListenerFactory;

#[async_trait]
impl ListenerFactory for TcpListenerFactory {
    async fn listen(&self, addr: &str) -> std::io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }
}

/// SOCKS5 relay server
#[derive(Clone)]
pub struct RelayServer {
    listener_factory: Arc<dyn ListenerFactory>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new(Arc::new(TcpListenerFactory))
    }
}

impl RelayServer {
    pub fn new(listener_factory: Arc<dyn ListenerFactory>) -> Self {
        Self { listener_factory }
    }

    /// Open the loopback listener
    pub async fn bind(&self) -> Result<BoundRelay, SshError> {
        let listener = self
            .listener_factory
            .listen(LOOPBACK_EPHEMERAL)
            .await
            .map_err(|e| SshError::OpenPort(e.to_string()))?;

        let bound_addr = listener
            .local_addr()
            .map_err(|e| SshError::OpenPort(e.to_string()))?;

        Ok(BoundRelay {
            listener,
            bound_addr,
        })
    }
}

/// A bound, not yet serving, relay listener
pub struct BoundRelay {
    listener: TcpListener,
    bound_addr: SocketAddr,
}

impl BoundRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Start the accept loop in the background
    ///
    /// The loop ends on `RelayHandle::stop`, when the handle is dropped, or
    /// when `disconnect_rx` fires. Relays already in flight are left alone.
    pub fn serve<D: Dial>(
        self,
        dialer: Arc<D>,
        disconnect_rx: Option<broadcast::Receiver<()>>,
    ) -> RelayHandle {
        let BoundRelay {
            listener,
            bound_addr,
        } = self;

        info!("Started SOCKS5 proxy on {}", bound_addr);

        let running = Arc::new(AtomicBool::new(true));
        let running_clone = running.clone();
        let (stop_tx, stop_rx) = mpsc::channel::<()>(1);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let task = tokio::spawn(accept_loop(
            listener,
            dialer,
            stop_rx,
            disconnect_rx,
            running_clone,
            stats.clone(),
        ));

        RelayHandle {
            bound_addr,
            running,
            stop_tx,
            stats,
            task,
        }
    }
}

/// Handle to a running SOCKS5 relay
pub struct RelayHandle {
    bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: Arc<RwLock<ForwardStats>>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Address clients should connect to; fixed for the relay's lifetime
    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    /// Check if the accept loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current stats
    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }

    /// Stop accepting, join the accept loop, then wait up to `grace` for
    /// in-flight relays to finish on their own
    pub async fn stop(self, grace: Duration) {
        info!("Stopping SOCKS5 proxy on {}", self.bound_addr);
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!("SOCKS5 accept loop ended abnormally: {}", e);
        }

        let start = Instant::now();
        while self.stats.read().active_connections > 0 {
            if start.elapsed() > grace {
                warn!(
                    "Leaving {} active relays running on {}",
                    self.stats.read().active_connections,
                    self.bound_addr
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

async fn accept_loop<D: Dial>(
    listener: TcpListener,
    dialer: Arc<D>,
    mut stop_rx: mpsc::Receiver<()>,
    mut disconnect_rx: Option<broadcast::Receiver<()>>,
    running: Arc<AtomicBool>,
    stats: Arc<RwLock<ForwardStats>>,
) {
    loop {
        tokio::select! {
            _ = wait_disconnect(&mut disconnect_rx) => {
                info!("SOCKS5 proxy stopped: SSH disconnected");
                break;
            }

            // Also fires when the handle is dropped
            _ = stop_rx.recv() => {
                info!("SOCKS5 proxy stopped by request");
                break;
            }

            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY: {}", e);
                        }

                        debug!("SOCKS5: Accepted connection from {}", peer_addr);

                        {
                            let mut s = stats.write();
                            s.connection_count += 1;
                            s.active_connections += 1;
                        }

                        let dialer = dialer.clone();
                        let stats_for_conn = stats.clone();

                        tokio::spawn(async move {
                            let result =
                                handle_socks5_connection(dialer, stream, stats_for_conn.clone()).await;

                            {
                                let mut s = stats_for_conn.write();
                                s.active_connections = s.active_connections.saturating_sub(1);
                            }

                            if let Err(e) = result {
                                warn!("SOCKS5 connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("SOCKS5 accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }

    running.store(false, Ordering::SeqCst);
    debug!("SOCKS5 accept loop exited");
}

/// Resolves when the disconnect broadcast fires; never without a receiver
async fn wait_disconnect(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// Handle a single SOCKS5 connection
async fn handle_socks5_connection<D: Dial>(
    dialer: Arc<D>,
    mut stream: TcpStream,
    stats: Arc<RwLock<ForwardStats>>,
) -> Result<(), SshError> {
    negotiate_method(&mut stream).await?;
    let target = read_request(&mut stream).await?;
    let address = target.to_string();

    debug!("SOCKS5: Connecting to {}", address);

    let remote = match dialer.dial("tcp", &address).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Failed to dial {} through tunnel: {}", address, e);
            write_reply(&mut stream, reply_code_for(&e), None).await?;
            return Err(e);
        }
    };

    let bound = stream.local_addr().ok();
    write_reply(&mut stream, socks5::REP_SUCCESS, bound).await?;

    debug!("SOCKS5: Tunnel established to {}", address);

    relay(stream, remote, stats).await;

    debug!("SOCKS5 connection to {} closed", address);
    Ok(())
}

#[derive(Clone, Copy)]
enum Direction {
    /// client -> remote
    Sent,
    /// remote -> client
    Received,
}

/// Copy one direction until EOF or error
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    stats: &RwLock<ForwardStats>,
    direction: Direction,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        {
            let mut s = stats.write();
            match direction {
                Direction::Sent => s.bytes_sent += n as u64,
                Direction::Received => s.bytes_received += n as u64,
            }
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
    }
}

/// Relay bytes both ways; whichever direction finishes first closes both ends
pub(crate) async fn relay<A, B>(client: A, remote: B, stats: Arc<RwLock<ForwardStats>>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut remote_read, mut remote_write) = tokio::io::split(remote);

    tokio::select! {
        result = pump(&mut client_read, &mut remote_write, &stats, Direction::Sent) => {
            if let Err(e) = result {
                debug!("Local read error: {}", e);
            }
        }
        result = pump(&mut remote_read, &mut client_write, &stats, Direction::Received) => {
            if let Err(e) = result {
                debug!("Tunnel read error: {}", e);
            }
        }
    }

    let _ = remote_write.shutdown().await;
    let _ = client_write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::duplex;

    /// Dials plain TCP, no SSH involved
    struct DirectDialer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Dial for DirectDialer {
        type Conn = TcpStream;

        async fn dial(&self, _network: &str, address: &str) -> Result<TcpStream, SshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            TcpStream::connect(address)
                .await
                .map_err(|e| SshError::ChannelError(e.to_string()))
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl ListenerFactory for FailingFactory {
        async fn listen(&self, _addr: &str) -> std::io::Result<TcpListener> {
            Err(std::io::Error::other("coconut"))
        }
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, [u8; 10]) {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream.write_all(&[5, 1, 0]).await.unwrap();
        let mut method = [0u8; 2];
        stream.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);

        let SocketAddr::V4(v4) = target else {
            panic!("expected IPv4 target")
        };
        let mut request = vec![5, 1, 0, 1];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_bind_is_loopback_ephemeral() {
        let bound = RelayServer::default().bind().await.unwrap();
        let addr = bound.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_failure_is_open_port() {
        let server = RelayServer::new(Arc::new(FailingFactory));
        let err = server.bind().await.err().unwrap();
        assert_eq!(err.to_string(), "open port: coconut");
    }

    #[tokio::test]
    async fn test_relay_round_trip_and_stats() {
        let echo = echo_server().await;
        let dialer = Arc::new(DirectDialer {
            calls: AtomicUsize::new(0),
        });
        let handle = RelayServer::default()
            .bind()
            .await
            .unwrap()
            .serve(dialer.clone(), None);

        let (mut stream, reply) = socks5_connect(handle.bound_addr(), echo).await;
        assert_eq!(reply[1], socks5::REP_SUCCESS);
        assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(dialer.calls.load(Ordering::SeqCst), 1);
        let stats = handle.stats();
        assert_eq!(stats.connection_count, 1);
        assert_eq!(stats.bytes_sent, 4);

        drop(stream);
        handle.stop(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_dial_failure_gets_error_reply() {
        // Nothing listens on the released port
        let closed = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let dialer = Arc::new(DirectDialer {
            calls: AtomicUsize::new(0),
        });
        let handle = RelayServer::default()
            .bind()
            .await
            .unwrap()
            .serve(dialer, None);

        let (mut stream, reply) = socks5_connect(handle.bound_addr(), closed).await;
        assert_eq!(reply[1], socks5::REP_CONN_REFUSED);
        let mut rest = Vec::new();
        assert_eq!(stream.read_to_end(&mut rest).await.unwrap(), 0);

        assert!(handle.is_running());
    }

    #[tokio::test]
    async fn test_malformed_client_does_not_stop_server() {
        let echo = echo_server().await;
        let dialer = Arc::new(DirectDialer {
            calls: AtomicUsize::new(0),
        });
        let handle = RelayServer::default()
            .bind()
            .await
            .unwrap()
            .serve(dialer, None);

        let mut bad = TcpStream::connect(handle.bound_addr()).await.unwrap();
        bad.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut rest = Vec::new();
        let _ = bad.read_to_end(&mut rest).await;

        let (mut good, reply) = socks5_connect(handle.bound_addr(), echo).await;
        assert_eq!(reply[1], socks5::REP_SUCCESS);
        good.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        good.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"still here");
    }

    #[tokio::test]
    async fn test_stop_and_disconnect_end_accept_loop() {
        let dialer = Arc::new(DirectDialer {
            calls: AtomicUsize::new(0),
        });
        let (disconnect_tx, disconnect_rx) = broadcast::channel(1);
        let handle = RelayServer::default()
            .bind()
            .await
            .unwrap()
            .serve(dialer, Some(disconnect_rx));
        assert!(handle.is_running());

        disconnect_tx.send(()).unwrap();
        for _ in 0..50 {
            if !handle.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!handle.is_running());
        handle.stop(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_relay_closes_both_ends_when_remote_finishes() {
        let (client, mut client_peer) = duplex(1024);
        let (remote, mut remote_peer) = duplex(1024);
        let stats = Arc::new(RwLock::new(ForwardStats::default()));

        let task = tokio::spawn(relay(client, remote, stats.clone()));

        remote_peer.write_all(b"HTTP/1.0 200 OK\r\n").await.unwrap();
        drop(remote_peer);

        let mut received = Vec::new();
        client_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"HTTP/1.0 200 OK\r\n");

        task.await.unwrap();
        assert_eq!(stats.read().bytes_received, 17);
    }
}
