//! SOCKS5 wire codec (RFC 1928 subset)
//!
//! Only what the relay needs: the "no authentication" method and the CONNECT
//! command with IPv4, domain name or IPv6 destinations.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use russh::ChannelOpenFailure;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ssh::SshError;

pub const VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REP_SUCCESS: u8 = 0x00;
pub const REP_GENERAL_FAILURE: u8 = 0x01;
pub const REP_NOT_ALLOWED: u8 = 0x02;
pub const REP_NETWORK_UNREACHABLE: u8 = 0x03;
pub const REP_HOST_UNREACHABLE: u8 = 0x04;
pub const REP_CONN_REFUSED: u8 = 0x05;
pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;

/// Destination requested by a SOCKS5 client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    /// `host:port`, with IPv6 literals bracketed
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

fn read_err(what: &str, e: std::io::Error) -> SshError {
    SshError::Socks5(format!("failed to read {}: {}", what, e))
}

/// Read the client greeting and select "no authentication"
pub async fn negotiate_method<S>(stream: &mut S) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| read_err("greeting", e))?;

    if header[0] != VERSION {
        return Err(SshError::Socks5(format!(
            "unsupported SOCKS version: {}",
            header[0]
        )));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| read_err("auth methods", e))?;

    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[VERSION, AUTH_NO_ACCEPTABLE]).await.ok();
        return Err(SshError::Socks5(
            "client does not offer the no-auth method".into(),
        ));
    }

    stream
        .write_all(&[VERSION, AUTH_NONE])
        .await
        .map_err(|e| SshError::Socks5(format!("failed to send method selection: {}", e)))
}

/// Read a CONNECT request
///
/// Unsupported commands and address types are answered with the matching
/// error reply before returning the error.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // VER | CMD | RSV | ATYP
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| read_err("request", e))?;

    let [version, cmd, _, atyp] = header;

    if version != VERSION {
        return Err(SshError::Socks5(format!(
            "invalid SOCKS version in request: {}",
            version
        )));
    }

    if cmd != CMD_CONNECT {
        write_reply(stream, REP_CMD_NOT_SUPPORTED, None).await?;
        return Err(SshError::Socks5(format!("unsupported command: {}", cmd)));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| read_err("IPv4 address", e))?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::Ip(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        ATYP_DOMAIN => {
            let len = stream
                .read_u8()
                .await
                .map_err(|e| read_err("domain length", e))? as usize;
            let mut buf = vec![0u8; len + 2];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| read_err("domain", e))?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let domain = match String::from_utf8(buf) {
                Ok(domain) if !domain.is_empty() => domain,
                _ => {
                    write_reply(stream, REP_GENERAL_FAILURE, None).await?;
                    return Err(SshError::Socks5("malformed domain name".into()));
                }
            };
            TargetAddr::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream
                .read_exact(&mut buf)
                .await
                .map_err(|e| read_err("IPv6 address", e))?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::Ip(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                port,
                0,
                0,
            )))
        }
        other => {
            write_reply(stream, REP_ADDR_NOT_SUPPORTED, None).await?;
            return Err(SshError::Socks5(format!(
                "unsupported address type: {}",
                other
            )));
        }
    };

    Ok(target)
}

/// Send a reply; `bound` defaults to 0.0.0.0:0
pub async fn write_reply<S>(
    stream: &mut S,
    status: u8,
    bound: Option<SocketAddr>,
) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    // VER | REP | RSV | ATYP | BND.ADDR | BND.PORT
    let bound = bound.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
    let mut reply = Vec::with_capacity(22);
    reply.extend_from_slice(&[VERSION, status, 0x00]);
    match bound {
        SocketAddr::V4(addr) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());

    stream
        .write_all(&reply)
        .await
        .map_err(|e| SshError::Socks5(format!("failed to send reply: {}", e)))
}

/// Reply code for a failed dial
///
/// Typed failures (SSH channel refusals, socket errors) map directly; other
/// dialers' errors fall back to their message.
pub fn reply_code_for(err: &SshError) -> u8 {
    match err {
        SshError::ChannelOpenFailed { reason, .. } => {
            return match reason {
                ChannelOpenFailure::ConnectFailed => REP_CONN_REFUSED,
                ChannelOpenFailure::AdministrativelyProhibited => REP_NOT_ALLOWED,
                _ => REP_GENERAL_FAILURE,
            }
        }
        SshError::IoError(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            return REP_CONN_REFUSED
        }
        _ => {}
    }

    let message = err.to_string().to_lowercase();
    if message.contains("refused") {
        REP_CONN_REFUSED
    } else if message.contains("unreachable") {
        REP_NETWORK_UNREACHABLE
    } else {
        REP_HOST_UNREACHABLE
    }
}
