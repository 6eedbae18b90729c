//! In-memory listener/dialer pair used for the in-process control API.
//!
//! No sockets are involved: every `connect` creates a duplex pipe and hands
//! one end to the listener's accept queue.

use std::io;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const PIPE_BUFFER: usize = 64 * 1024;
const BACKLOG: usize = 16;

/// Address the in-memory control API pretends to live at.
pub const LOCAL_API_ADDR: &str = "local-node.sock:80";

/// Accept side of an in-memory transport.
#[derive(Debug)]
pub struct MemListener {
    rx: mpsc::Receiver<DuplexStream>,
}

/// Connect side of an in-memory transport. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemDialer {
    tx: mpsc::Sender<DuplexStream>,
}

/// A connected listener/dialer pair.
pub fn pipe() -> (MemListener, MemDialer) {
    let (tx, rx) = mpsc::channel(BACKLOG);
    (MemListener { rx }, MemDialer { tx })
}

impl MemListener {
    /// Next inbound pipe, or `None` once every dialer is gone.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl MemDialer {
    pub async fn connect(&self) -> io::Result<DuplexStream> {
        let (ours, theirs) = tokio::io::duplex(PIPE_BUFFER);
        self.tx.send(theirs).await.map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "in-memory listener closed")
        })?;
        Ok(ours)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn connect_reaches_listener() {
        let (mut listener, dialer) = pipe();
        let mut client = dialer.connect().await.unwrap();
        let mut server = listener.accept().await.unwrap();

        client.write_all(b"GET").await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET");
    }

    #[tokio::test]
    async fn connect_after_listener_dropped_is_refused() {
        let (listener, dialer) = pipe();
        drop(listener);
        let err = dialer.connect().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
