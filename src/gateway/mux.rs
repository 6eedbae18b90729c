//! Protocol demultiplexing on the gateway socket.
//!
//! The first byte decides: `0x05` is a SOCKS5 greeting, anything else is
//! treated as an HTTP request line. The byte is peeked, not consumed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::gateway::socks5::{self, Socks5Server};
use crate::http::HttpServer;
use crate::net::connection::SessionTracker;
use crate::observability::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Socks5,
    Http,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Socks5 => "socks5",
            Protocol::Http => "http",
        }
    }
}

pub fn classify(first_byte: u8) -> Protocol {
    if first_byte == socks5::VERSION {
        Protocol::Socks5
    } else {
        Protocol::Http
    }
}

pub(crate) struct Mux {
    pub http: HttpServer,
    pub proxy: Socks5Server,
    pub sniff: Duration,
    pub cancel: CancellationToken,
    pub sessions: SessionTracker,
}

impl Mux {
    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let mux = Arc::clone(&self);
                    tokio::spawn(async move { mux.handle(stream, peer).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Gateway accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        tracing::debug!(active = self.sessions.active_count(), "Gateway accept loop stopped");
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let session = self.sessions.track();

        let mut first = [0u8; 1];
        let peeked = tokio::time::timeout(self.sniff, stream.peek(&mut first)).await;
        let protocol = match peeked {
            Ok(Ok(0)) => return,
            Ok(Ok(_)) => classify(first[0]),
            Ok(Err(e)) => {
                tracing::debug!(session = %session.id(), peer = %peer, error = %e, "Gateway peek failed");
                return;
            }
            Err(_) => {
                tracing::debug!(session = %session.id(), peer = %peer, "Gateway client sent nothing");
                return;
            }
        };
        metrics::record_gateway_connection(protocol.as_str());
        tracing::debug!(session = %session.id(), peer = %peer, protocol = protocol.as_str(), "Gateway connection");

        match protocol {
            Protocol::Socks5 => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    result = self.proxy.serve(stream) => {
                        if let Err(e) = result {
                            tracing::debug!(session = %session.id(), error = %e, "SOCKS5 session failed");
                        }
                    }
                }
            }
            Protocol::Http => self.http.serve_connection(stream, self.cancel.clone()).await,
        }
    }
}
