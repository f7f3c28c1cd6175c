//! jumpbox-socks5 - reach private hosts through an SSH jump host
//!
//! Exposes either a local SOCKS5 listener ([`Socks5Proxy::start`]) or a bare
//! dialer ([`Socks5Proxy::dialer`]) whose traffic travels over one
//! authenticated, host-key-pinned SSH connection.
//!
//! ```ignore
//! let proxy = Socks5Proxy::new(Arc::new(KnownHostsProvider::user_default()?));
//! proxy.start(&private_key_pem, "10.0.0.5:22").await?;
//! println!("ALL_PROXY=socks5://{}", proxy.addr()?);
//! ```

pub mod forwarding;
pub mod proxy;
pub mod ssh;

pub use forwarding::{ForwardStats, ListenerFactory, TcpListenerFactory};
pub use proxy::Socks5Proxy;
pub use ssh::{
    Dial, HostKeyProvider, KeyScanProvider, KnownHostsProvider, SshError, SshSession,
    StaticHostKey, TunnelConfig,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG`, default `info`)
///
/// For binaries; the library itself never installs a subscriber.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
