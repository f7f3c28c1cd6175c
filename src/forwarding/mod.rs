//! Port Forwarding Module
//!
//! Provides the local SOCKS5 relay that forwards client connections through
//! the jump host.

mod dynamic;
pub mod socks5;

pub use dynamic::{
    BoundRelay, ForwardStats, ListenerFactory, RelayHandle, RelayServer, TcpListenerFactory,
    LOOPBACK_EPHEMERAL,
};
pub use socks5::TargetAddr;
