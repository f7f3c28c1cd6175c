//! jumpbox-socks5: run a local SOCKS5 proxy through an SSH jump host.
//!
//! The jump host key is pinned from `--known-hosts` (default
//! `~/.ssh/known_hosts`). The SOCKS5 address is printed on stdout; logs go to
//! stderr. Runs until Ctrl-C.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use jumpbox_socks5::{
    init_logging, HostKeyProvider, KnownHostsProvider, Socks5Proxy, SshError, TunnelConfig,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "jumpbox-socks5")]
#[command(version)]
#[command(about = "Local SOCKS5 proxy tunnelled through an SSH jump host")]
struct Cli {
    /// Private key file (OpenSSH or PEM)
    #[arg(long)]
    key: PathBuf,

    /// Jump host address (host:port)
    #[arg(long)]
    target: String,

    /// known_hosts file used to pin the jump host key
    #[arg(long)]
    known_hosts: Option<PathBuf>,

    /// JSON tunnel configuration
    #[arg(long)]
    config: Option<PathBuf>,
}

async fn run(cli: Cli) -> Result<(), SshError> {
    let config = match cli.config {
        Some(path) => TunnelConfig::from_json_file(path)?,
        None => TunnelConfig::default(),
    };

    let host_keys: Arc<dyn HostKeyProvider> = Arc::new(match cli.known_hosts {
        Some(path) => KnownHostsProvider::with_path(path)?,
        None => KnownHostsProvider::user_default()?,
    });

    let private_key = std::fs::read_to_string(&cli.key)
        .map_err(|e| SshError::Config(format!("read {}: {}", cli.key.display(), e)))?;

    let proxy = Socks5Proxy::new(host_keys).with_config(config);
    proxy.start(&private_key, &cli.target).await?;

    println!("{}", proxy.addr()?);

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    proxy.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
