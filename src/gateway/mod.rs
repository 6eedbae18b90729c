//! Loopback gateway: one local socket, two protocols.
//!
//! # Data Flow
//! ```text
//! 127.0.0.1:<port>
//!     → mux.rs (peek first byte)
//!         ├─ 0x05 → socks5.rs (user "embednet" + proxy credential) → Dialer
//!         └─ else → HttpServer
//!                     → auth.rs (Sec-Embednet: localapi, else 403)
//!                     → control API (basic auth with control credential, else 401)
//! ```
//!
//! # Design Decisions
//! - Opened lazily on first `open`; later calls return the same values
//! - The header check wraps the API router as its own layer

pub mod auth;
pub mod mux;
pub mod socks5;

use axum::middleware;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::control::api::{self, ApiAccess, ApiState};
use crate::http::HttpServer;
use crate::net::connection::SessionTracker;
use crate::net::dialer::Dialer;

use self::mux::Mux;
use self::socks5::Socks5Server;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("bind loopback socket: {0}")]
    Bind(#[source] io::Error),

    #[error("gateway is closed")]
    Closed,
}

/// Address and credentials of an open gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackInfo {
    pub address: SocketAddr,
    /// SOCKS5 password for user [`socks5::USERNAME`].
    pub proxy_credential: String,
    /// Basic-auth password for the control API.
    pub control_credential: String,
}

pub struct LoopbackGateway {
    dialer: Arc<Dialer>,
    api: ApiState,
    sniff: Duration,
    cancel: CancellationToken,
    sessions: SessionTracker,
    opened: tokio::sync::Mutex<Option<LoopbackInfo>>,
}

impl LoopbackGateway {
    pub fn new(dialer: Arc<Dialer>, api: ApiState, sniff: Duration) -> Self {
        Self {
            dialer,
            api,
            sniff,
            cancel: CancellationToken::new(),
            sessions: SessionTracker::new(),
            opened: tokio::sync::Mutex::new(None),
        }
    }

    /// Open the gateway, or return the values from the first successful open.
    pub async fn open(&self) -> Result<LoopbackInfo, GatewayError> {
        let mut opened = self.opened.lock().await;
        if let Some(info) = opened.as_ref() {
            return Ok(info.clone());
        }
        if self.cancel.is_cancelled() {
            return Err(GatewayError::Closed);
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(GatewayError::Bind)?;
        let address = listener.local_addr().map_err(GatewayError::Bind)?;
        let info = LoopbackInfo {
            address,
            proxy_credential: auth::generate_credential(),
            control_credential: auth::generate_credential(),
        };

        let router = api::router(
            self.api.clone(),
            ApiAccess::with_password(info.control_credential.clone()),
        )
        .layer(middleware::from_fn(auth::require_localapi_header));
        let mux = Arc::new(Mux {
            http: HttpServer::new(router),
            proxy: Socks5Server::new(Arc::clone(&self.dialer), info.proxy_credential.clone()),
            sniff: self.sniff,
            cancel: self.cancel.clone(),
            sessions: self.sessions.clone(),
        });
        tokio::spawn(mux.accept_loop(listener));

        tracing::info!(address = %address, "Loopback gateway listening");
        *opened = Some(info.clone());
        Ok(info)
    }

    /// Stop accepting and end live sessions.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn active_sessions(&self) -> u64 {
        self.sessions.active_count()
    }
}
