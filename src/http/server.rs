//! HTTP/1.1 serving over arbitrary byte streams.
//!
//! # Responsibilities
//! - Drive an axum router over one connection with hyper
//! - Accept in-memory pipes until cancelled
//!
//! The control API never touches a real socket in-process, so the server
//! takes streams rather than binding a `TcpListener`.

use axum::Router;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use crate::net::conn::AsyncStream;
use crate::net::memnet::MemListener;

/// HTTP server for the control API.
#[derive(Clone)]
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Serve requests on one connection until the peer hangs up or `cancel` fires.
    pub async fn serve_connection<S>(&self, io: S, cancel: CancellationToken)
    where
        S: AsyncStream + 'static,
    {
        let router = self.router.clone();
        let service = service_fn(move |request: axum::http::Request<hyper::body::Incoming>| {
            router.clone().oneshot(request)
        });
        let conn = http1::Builder::new().serve_connection(TokioIo::new(io), service);
        tokio::pin!(conn);

        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(error = %e, "HTTP connection ended with error");
                }
            }
            _ = cancel.cancelled() => {
                conn.as_mut().graceful_shutdown();
                let _ = conn.await;
            }
        }
    }

    /// Accept in-memory connections until cancelled or every dialer is gone.
    pub async fn run(self, mut listener: MemListener, cancel: CancellationToken) {
        tracing::debug!("In-memory control API serving");
        loop {
            let stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                stream = listener.accept() => match stream {
                    Some(stream) => stream,
                    None => break,
                },
            };
            let server = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { server.serve_connection(stream, cancel).await });
        }
        tracing::debug!("In-memory control API stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::memnet;
    use axum::routing::get;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn serves_over_memory_pipe() {
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        let (listener, dialer) = memnet::pipe();
        let cancel = CancellationToken::new();
        tokio::spawn(HttpServer::new(router).run(listener, cancel.clone()));

        let mut stream = dialer.connect().await.unwrap();
        stream
            .write_all(b"GET /ping HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("pong"));

        cancel.cancel();
    }
}
