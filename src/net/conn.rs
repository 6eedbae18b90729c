//! Connection types handed to applications.
//!
//! A [`Conn`] wraps either a byte stream (TCP) or a packet channel (UDP).
//! Both implement `AsyncRead`/`AsyncWrite`; for UDP every read returns one
//! datagram and every write sends one.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::net::registry::Transport;

/// Any bidirectional byte stream that can back a [`Conn`].
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Packet-oriented connection to a single peer.
///
/// Message boundaries are preserved. A full outbound queue drops the packet,
/// the way a congested UDP path would; a read into a buffer shorter than the
/// packet truncates it.
pub struct PacketConn {
    local: SocketAddr,
    peer: SocketAddr,
    rx: mpsc::Receiver<Vec<u8>>,
    tx: Option<mpsc::Sender<Vec<u8>>>,
}

impl PacketConn {
    pub fn new(
        local: SocketAddr,
        peer: SocketAddr,
        rx: mpsc::Receiver<Vec<u8>>,
        tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            local,
            peer,
            rx,
            tx: Some(tx),
        }
    }

    /// Two connected ends: `a` sees `b` as its peer and vice versa.
    pub fn pair(a: SocketAddr, b: SocketAddr, capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (Self::new(a, b, a_rx, a_tx), Self::new(b, a, b_rx, b_tx))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Next whole packet, or `None` once the peer has gone away.
    pub async fn recv_packet(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Receive one packet into `buf`, truncating if it does not fit.
    /// Returns `Ok(0)` at end of stream.
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.recv().await {
            Some(packet) => {
                let n = packet.len().min(buf.len());
                buf[..n].copy_from_slice(&packet[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    /// Send one packet. Never waits for queue space.
    pub fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let Some(tx) = &self.tx else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "packet conn shut down",
            ));
        };
        match tx.try_send(payload.to_vec()) {
            Ok(()) => Ok(payload.len()),
            Err(TrySendError::Full(_)) => {
                tracing::trace!(peer = %self.peer, len = payload.len(), "Packet queue full, dropping");
                Ok(payload.len())
            }
            Err(TrySendError::Closed(_)) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer closed",
            )),
        }
    }
}

impl fmt::Debug for PacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketConn")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for PacketConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let n = packet.len().min(buf.remaining());
                buf.put_slice(&packet[..n]);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for PacketConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(self.send(buf))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().tx = None;
        Poll::Ready(Ok(()))
    }
}

enum ConnIo {
    Stream(Box<dyn AsyncStream>),
    Packet(PacketConn),
}

/// A connection on the overlay (or host) network.
pub struct Conn {
    local: SocketAddr,
    peer: SocketAddr,
    io: ConnIo,
}

impl Conn {
    pub fn stream(local: SocketAddr, peer: SocketAddr, io: impl AsyncStream + 'static) -> Self {
        Self {
            local,
            peer,
            io: ConnIo::Stream(Box::new(io)),
        }
    }

    pub fn packet(conn: PacketConn) -> Self {
        Self {
            local: conn.local_addr(),
            peer: conn.peer_addr(),
            io: ConnIo::Packet(conn),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn transport(&self) -> Transport {
        match self.io {
            ConnIo::Stream(_) => Transport::Tcp,
            ConnIo::Packet(_) => Transport::Udp,
        }
    }

    /// The packet API of a UDP connection. A stream connection is handed back.
    pub fn into_packet(self) -> Result<PacketConn, Conn> {
        let Conn { local, peer, io } = self;
        match io {
            ConnIo::Packet(conn) => Ok(conn),
            io => Err(Conn { local, peer, io }),
        }
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("transport", &self.transport())
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            ConnIo::Stream(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnIo::Packet(packet) => Pin::new(packet).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().io {
            ConnIo::Stream(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnIo::Packet(packet) => Pin::new(packet).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            ConnIo::Stream(stream) => Pin::new(stream).poll_flush(cx),
            ConnIo::Packet(packet) => Pin::new(packet).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().io {
            ConnIo::Stream(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnIo::Packet(packet) => Pin::new(packet).poll_shutdown(cx),
        }
    }
}
