//! Outbound dialing for the node.
//!
//! # Responsibilities
//! - Parse the network name and resolve the address
//! - Send traffic for known overlay peers through the virtual stack
//! - Fall back to the host network for everything else
//!
//! The overlay route is installed once, after the virtual stack exists;
//! until then every dial goes to the host network.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpStream, UdpSocket};

use crate::net::conn::{Conn, PacketConn};
use crate::net::registry::{Network, Transport};
use crate::stack::{PacketEngine, VirtualStack};

const UDP_QUEUE: usize = 256;
const MAX_DATAGRAM: usize = 64 * 1024;

struct OverlayRoute {
    engine: Arc<dyn PacketEngine>,
    stack: Arc<dyn VirtualStack>,
}

/// Dialer shared by the engine, the control backend and the public `dial`.
#[derive(Default)]
pub struct Dialer {
    closed: AtomicBool,
    overlay: OnceLock<OverlayRoute>,
}

impl Dialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route destinations the engine knows as peers through `stack`.
    pub(crate) fn route_overlay(&self, engine: Arc<dyn PacketEngine>, stack: Arc<dyn VirtualStack>) {
        if self.overlay.set(OverlayRoute { engine, stack }).is_err() {
            tracing::warn!("Overlay route already installed");
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Dial `address` ("host:port") on `network` ("tcp", "udp4", ...).
    pub async fn dial(&self, network: &str, address: &str) -> io::Result<Conn> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "dialer is closed"));
        }
        let network: Network = network
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let targets: Vec<SocketAddr> = tokio::net::lookup_host(address)
            .await?
            .filter(|addr| network.admits(addr.ip()))
            .collect();
        if targets.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no {network} address for {address}"),
            ));
        }

        let mut last_err = None;
        for dst in targets {
            match self.dial_addr(network.transport(), dst).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    tracing::debug!(dst = %dst, error = %e, "Dial attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
    }

    async fn dial_addr(&self, transport: Transport, dst: SocketAddr) -> io::Result<Conn> {
        if let Some(route) = self.overlay.get() {
            if route.engine.peer_for_ip(dst.ip()).is_some() {
                return match transport {
                    Transport::Tcp => route.stack.dial_tcp(dst).await,
                    Transport::Udp => route.stack.dial_udp(dst).await,
                };
            }
        }
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(dst).await?;
                let local = stream.local_addr()?;
                Ok(Conn::stream(local, dst, stream))
            }
            Transport::Udp => dial_host_udp(dst).await,
        }
    }
}

/// Connected host UDP socket pumped into a packet connection.
async fn dial_host_udp(dst: SocketAddr) -> io::Result<Conn> {
    let bind: SocketAddr = if dst.is_ipv4() {
        "0.0.0.0:0".parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
    } else {
        "[::]:0".parse().map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(dst).await?;
    let local = socket.local_addr()?;

    let (app, mut pump) = PacketConn::pair(local, dst, UDP_QUEUE);
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                outbound = pump.recv_packet() => match outbound {
                    Some(packet) => {
                        if let Err(e) = socket.send(&packet).await {
                            tracing::debug!(dst = %dst, error = %e, "UDP send failed");
                        }
                    }
                    None => break,
                },
                inbound = socket.recv(&mut buf) => match inbound {
                    Ok(n) => {
                        if pump.send(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(dst = %dst, error = %e, "UDP receive failed");
                        break;
                    }
                },
            }
        }
    });

    Ok(Conn::packet(app))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn dials_host_tcp() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = server.accept().await.unwrap();
            stream.write_all(b"hi").await.unwrap();
        });

        let dialer = Dialer::new();
        let mut conn = dialer.dial("tcp", &addr.to_string()).await.unwrap();
        assert_eq!(conn.peer_addr(), addr);
        let mut buf = [0u8; 2];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn dials_host_udp() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let dialer = Dialer::new();
        let conn = dialer.dial("udp4", &addr.to_string()).await.unwrap();
        let mut packets = conn.into_packet().unwrap();
        packets.send(b"ping").unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).await.unwrap();
        assert_eq!(packets.recv_packet().await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn rejects_bad_network_and_closed_dialer() {
        let dialer = Dialer::new();
        let err = dialer.dial("sctp", "127.0.0.1:1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);

        let err = dialer.dial("tcp6", "127.0.0.1:1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);

        dialer.close();
        let err = dialer.dial("tcp", "127.0.0.1:1").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
