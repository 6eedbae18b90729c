//! Client for the in-process control API.
//!
//! Speaks HTTP/1.1 over the in-memory transport, one pipe per request.

use axum::body::{Body, BodyDataStream};
use axum::http::{header, Method, Request, StatusCode};
use futures_util::StreamExt;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::control::api::ListenerInfo;
use crate::control::backend::{Notify, Prefs, Status};
use crate::net::memnet::{MemDialer, LOCAL_API_ADDR};

const MAX_BODY: usize = 4 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("local API connect: {0}")]
    Connect(#[from] std::io::Error),

    #[error("local API http: {0}")]
    Http(#[from] hyper::Error),

    #[error("local API request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("local API body: {0}")]
    Body(#[from] axum::Error),

    #[error("local API returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("local API decode: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Handle to the node's control API. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocalClient {
    dialer: MemDialer,
}

impl LocalClient {
    pub fn new(dialer: MemDialer) -> Self {
        Self { dialer }
    }

    pub async fn status(&self) -> Result<Status, ClientError> {
        self.get_json("/localapi/v0/status").await
    }

    pub async fn prefs(&self) -> Result<Prefs, ClientError> {
        self.get_json("/localapi/v0/prefs").await
    }

    pub async fn listeners(&self) -> Result<Vec<ListenerInfo>, ClientError> {
        self.get_json("/localapi/v0/listeners").await
    }

    pub async fn start_login_interactive(&self) -> Result<(), ClientError> {
        self.post("/localapi/v0/login-interactive").await
    }

    pub async fn logout(&self) -> Result<(), ClientError> {
        self.post("/localapi/v0/logout").await
    }

    /// Subscribe to backend notifications.
    pub async fn watch(&self) -> Result<NotifyStream, ClientError> {
        let body = self.send(Method::GET, "/localapi/v0/watch-ipn-bus").await?;
        Ok(NotifyStream {
            data: body.into_data_stream(),
            buf: Vec::new(),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let body = self.send(Method::GET, path).await?;
        let bytes = axum::body::to_bytes(body, MAX_BODY).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post(&self, path: &str) -> Result<(), ClientError> {
        let body = self.send(Method::POST, path).await?;
        axum::body::to_bytes(body, MAX_BODY).await?;
        Ok(())
    }

    /// Send one request on a fresh pipe; returns the body of a 2xx response.
    async fn send(&self, method: Method, path: &str) -> Result<Body, ClientError> {
        let stream = self.dialer.connect().await?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Local API connection ended");
            }
        });

        let host = LOCAL_API_ADDR.trim_end_matches(":80");
        let request = Request::builder()
            .method(method)
            .uri(format!("http://{host}{path}"))
            .header(header::HOST, host)
            .body(Body::empty())?;
        let response = sender.send_request(request).await?;

        let status = response.status();
        let body = Body::new(response.into_body());
        if !status.is_success() {
            let bytes = axum::body::to_bytes(body, MAX_BODY).await?;
            return Err(ClientError::Status {
                status,
                body: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }
        Ok(body)
    }
}

/// Stream of notifications from `watch-ipn-bus`.
pub struct NotifyStream {
    data: BodyDataStream,
    buf: Vec<u8>,
}

impl NotifyStream {
    /// Next notification, or `None` when the server ends the stream.
    pub async fn next(&mut self) -> Option<Result<Notify, ClientError>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                return Some(serde_json::from_slice(&line[..pos]).map_err(ClientError::from));
            }
            match self.data.next().await? {
                Ok(chunk) => self.buf.extend_from_slice(&chunk),
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::backend::BackendState;

    fn stream_of(chunks: Vec<&'static str>) -> NotifyStream {
        let chunks = futures_util::stream::iter(chunks.into_iter().map(Ok::<_, std::io::Error>));
        NotifyStream {
            data: Body::from_stream(chunks).into_data_stream(),
            buf: Vec::new(),
        }
    }

    #[tokio::test]
    async fn lines_split_across_chunks() {
        let mut stream = stream_of(vec![
            "{\"state\":\"Sta",
            "rting\"}\n{\"state\":\"Running\"}\n",
        ]);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.state, Some(BackendState::Starting));
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.state, Some(BackendState::Running));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn bad_line_is_a_decode_error() {
        let mut stream = stream_of(vec!["not json\n"]);
        assert!(matches!(stream.next().await, Some(Err(ClientError::Decode(_)))));
    }
}
