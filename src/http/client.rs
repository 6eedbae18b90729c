//! HTTP client whose connections go through the node's dialer.
//!
//! Plain `http://` only. Overlay peers are reached by address; anything the
//! dialer does not route as a peer goes out on the host network.

use axum::body::Body;
use futures_util::future::BoxFuture;
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::net::conn::Conn;
use crate::net::dialer::Dialer;

/// Pooled HTTP/1.1 client dialing through a node.
pub type NodeHttpClient = Client<DialerConnector, Body>;

/// Build a client on top of `dialer`.
pub fn client(dialer: Arc<Dialer>) -> NodeHttpClient {
    Client::builder(TokioExecutor::new()).build(DialerConnector::new(dialer))
}

/// Connector that opens each connection with [`Dialer::dial`].
#[derive(Clone)]
pub struct DialerConnector {
    dialer: Arc<Dialer>,
}

impl DialerConnector {
    pub fn new(dialer: Arc<Dialer>) -> Self {
        Self { dialer }
    }
}

impl tower::Service<Uri> for DialerConnector {
    type Response = TokioIo<Conn>;
    type Error = io::Error;
    type Future = BoxFuture<'static, io::Result<TokioIo<Conn>>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        Box::pin(async move {
            let address = dial_target(&uri)?;
            tracing::trace!(%address, "HTTP client dialing");
            let conn = dialer.dial("tcp", &address).await?;
            Ok(TokioIo::new(conn))
        })
    }
}

impl Connection for Conn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// `host:port` for a request URI, defaulting the port to 80.
fn dial_target(uri: &Uri) -> io::Result<String> {
    match uri.scheme_str() {
        None | Some("http") => {}
        Some(scheme) => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported scheme {scheme:?}"),
            ))
        }
    }
    let host = uri
        .host()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "request URI has no host"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = uri.port_u16().unwrap_or(80);
    if host.contains(':') {
        Ok(format!("[{host}]:{port}"))
    } else {
        Ok(format!("{host}:{port}"))
    }
}
