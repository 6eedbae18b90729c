//! SOCKS5 proxy side of the loopback gateway (RFC 1928, RFC 1929).
//!
//! Only username/password authentication and the CONNECT command are
//! supported. Targets are dialed through the node, so overlay peers are
//! reachable by address from any SOCKS-capable program.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::gateway::auth::credential_matches;
use crate::net::dialer::Dialer;

pub const VERSION: u8 = 0x05;
pub const USERNAME: &str = "embednet";

const AUTH_VERSION: u8 = 0x01;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;
const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

#[derive(Debug, Error)]
pub enum Socks5Error {
    #[error("socks5 io: {0}")]
    Io(#[from] io::Error),

    #[error("socks5: unsupported version {0}")]
    BadVersion(u8),

    #[error("socks5: client offered no username/password method")]
    NoAcceptableMethod,

    #[error("socks5: authentication failed")]
    AuthFailed,

    #[error("socks5: unsupported command {0}")]
    UnsupportedCommand(u8),

    #[error("socks5: unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("socks5: dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
}

/// Requested CONNECT destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

pub struct Socks5Server {
    dialer: Arc<Dialer>,
    password: String,
}

impl Socks5Server {
    pub fn new(dialer: Arc<Dialer>, password: String) -> Self {
        Self { dialer, password }
    }

    /// Run one proxy session to completion.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), Socks5Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = handshake(&mut stream, USERNAME, &self.password).await?;
        let target_str = target.to_string();

        let mut upstream = match self.dialer.dial("tcp", &target_str).await {
            Ok(conn) => conn,
            Err(source) => {
                send_reply(&mut stream, reply_for(&source), None).await?;
                return Err(Socks5Error::Dial {
                    target: target_str,
                    source,
                });
            }
        };
        send_reply(&mut stream, REP_SUCCEEDED, Some(upstream.local_addr())).await?;
        tracing::debug!(target = %target_str, "SOCKS5 connect established");

        let (up, down) = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await?;
        tracing::trace!(target = %target_str, bytes_up = up, bytes_down = down, "SOCKS5 session done");
        Ok(())
    }
}

fn reply_for(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REP_CONNECTION_REFUSED,
        io::ErrorKind::AddrNotAvailable | io::ErrorKind::NotFound => REP_HOST_UNREACHABLE,
        _ => REP_GENERAL_FAILURE,
    }
}

/// Negotiate auth and read the CONNECT request. Replies to failures itself.
pub async fn handshake<S>(stream: &mut S, user: &str, password: &str) -> Result<TargetAddr, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }
    let count = stream.read_u8().await? as usize;
    let mut methods = vec![0u8; count];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_USER_PASS) {
        stream.write_all(&[VERSION, METHOD_NONE_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod);
    }
    stream.write_all(&[VERSION, METHOD_USER_PASS]).await?;

    let auth_version = stream.read_u8().await?;
    if auth_version != AUTH_VERSION {
        return Err(Socks5Error::BadVersion(auth_version));
    }
    let given_user = read_short_string(stream).await?;
    let given_password = read_short_string(stream).await?;
    let user_ok = credential_matches(&given_user, user.as_bytes());
    let password_ok = credential_matches(&given_password, password.as_bytes());
    if !(user_ok & password_ok) {
        stream.write_all(&[AUTH_VERSION, 0x01]).await?;
        return Err(Socks5Error::AuthFailed);
    }
    stream.write_all(&[AUTH_VERSION, 0x00]).await?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != VERSION {
        return Err(Socks5Error::BadVersion(version));
    }

    let target = match atyp {
        ATYP_V4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        ATYP_V6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        ATYP_DOMAIN => {
            let host = read_short_string(stream).await?;
            let port = stream.read_u16().await?;
            let host = String::from_utf8(host)
                .map_err(|_| Socks5Error::UnsupportedAddressType(ATYP_DOMAIN))?;
            TargetAddr::Domain(host, port)
        }
        other => {
            send_reply(stream, REP_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(Socks5Error::UnsupportedAddressType(other));
        }
    };

    if command != CMD_CONNECT {
        send_reply(stream, REP_COMMAND_NOT_SUPPORTED, None).await?;
        return Err(Socks5Error::UnsupportedCommand(command));
    }
    Ok(target)
}

async fn read_short_string<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn send_reply<S>(stream: &mut S, code: u8, bound: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut reply = vec![VERSION, code, 0x00];
    match bound.ip() {
        IpAddr::V4(ip) => {
            reply.push(ATYP_V4);
            reply.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            reply.push(ATYP_V6);
            reply.extend_from_slice(&ip.octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&reply).await?;
    stream.flush().await
}
