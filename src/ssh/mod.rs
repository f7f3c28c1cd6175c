//! SSH module - the jump host side of the tunnel
//!
//! This module provides the transport session using the russh library.
//!
//! # Features
//! - Public key authentication from an in-memory private key
//! - Mandatory host key pinning through a pluggable [`HostKeyProvider`]
//! - Concurrent `direct-tcpip` dials over one shared connection
//! - Bundled providers: static key, known_hosts file, handshake scan

mod client;
mod config;
mod error;
mod handle_owner;
pub mod host_key;
pub mod known_hosts;
pub mod preflight;
mod session;

pub use client::{parse_private_key, split_host_port, ClientHandler, SshClient};
pub use config::{TunnelConfig, DEFAULT_USERNAME};
pub use error::{BoxError, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
#[cfg(test)]
pub(crate) use handle_owner::detached_controller;
pub use host_key::{fingerprint, same_key, HostKeyProvider, StaticHostKey};
pub use known_hosts::KnownHostsProvider;
pub use preflight::KeyScanProvider;
pub use session::{Dial, SshSession, TunnelStream};
