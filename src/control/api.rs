//! Local control API.
//!
//! Served twice: in-process over an in-memory transport (full access, no
//! password) and on the loopback gateway (password required, behind the
//! gateway's header check).

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::control::backend::{ControlBackend, Prefs, Status};
use crate::gateway::auth::credential_matches;
use crate::net::registry::ListenerRegistry;

/// Who may do what through one instance of the API.
#[derive(Debug, Clone, Default)]
pub struct ApiAccess {
    pub permit_read: bool,
    pub permit_write: bool,
    /// Basic-auth password every request must carry, if set.
    pub required_password: Option<String>,
}

impl ApiAccess {
    /// Full access, no password. Used for the in-process transport.
    pub fn local() -> Self {
        Self {
            permit_read: true,
            permit_write: true,
            required_password: None,
        }
    }

    pub fn with_password(password: impl Into<String>) -> Self {
        Self {
            required_password: Some(password.into()),
            ..Self::local()
        }
    }
}

/// Handles every handler needs.
#[derive(Clone)]
pub struct ApiState {
    pub backend: Arc<dyn ControlBackend>,
    pub registry: Arc<ListenerRegistry>,
    /// Node shutdown; ends open notification streams.
    pub stopped: CancellationToken,
}

/// A registered listener as reported by `GET listeners`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerInfo {
    pub network: String,
    pub host: Option<IpAddr>,
    pub port: u16,
}

pub fn router(state: ApiState, access: ApiAccess) -> Router {
    Router::new()
        .route("/localapi/v0/status", get(get_status))
        .route("/localapi/v0/prefs", get(get_prefs))
        .route("/localapi/v0/listeners", get(get_listeners))
        .route("/localapi/v0/watch-ipn-bus", get(watch_ipn_bus))
        .route("/localapi/v0/login-interactive", post(login_interactive))
        .route("/localapi/v0/logout", post(logout))
        .layer(middleware::from_fn_with_state(Arc::new(access), check_access))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn basic_auth_password(request: &Request) -> Option<String> {
    let value = request.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (_user, password) = decoded.split_once(':')?;
    Some(password.to_string())
}

async fn check_access(
    State(access): State<Arc<ApiAccess>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(required) = &access.required_password {
        let given = basic_auth_password(&request);
        let matches = given
            .as_deref()
            .is_some_and(|given| credential_matches(given.as_bytes(), required.as_bytes()));
        if !matches {
            return (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Basic realm=\"embednet\"")],
                "auth required\n",
            )
                .into_response();
        }
    }

    let permitted = if request.method() == axum::http::Method::GET {
        access.permit_read
    } else {
        access.permit_write
    };
    if !permitted {
        return (StatusCode::FORBIDDEN, "access denied\n").into_response();
    }

    next.run(request).await
}

fn backend_error(err: crate::error::BoxError) -> Response {
    tracing::warn!(error = %err, "Control API backend call failed");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}\n")).into_response()
}

async fn get_status(State(state): State<ApiState>) -> Json<Status> {
    Json(state.backend.status())
}

async fn get_prefs(State(state): State<ApiState>) -> Json<Prefs> {
    Json(state.backend.prefs())
}

async fn get_listeners(State(state): State<ApiState>) -> Json<Vec<ListenerInfo>> {
    let mut listeners: Vec<ListenerInfo> = state
        .registry
        .keys()
        .into_iter()
        .map(|key| ListenerInfo {
            network: key.network.to_string(),
            host: key.host,
            port: key.port,
        })
        .collect();
    listeners.sort_by(|a, b| (a.port, &a.network).cmp(&(b.port, &b.network)));
    Json(listeners)
}

/// Newline-delimited JSON notifications until the backend goes away or
/// the node shuts down.
async fn watch_ipn_bus(State(state): State<ApiState>) -> Response {
    let watcher = state.backend.watch();
    let lines = futures_util::stream::unfold(watcher, |mut watcher| async move {
        let notify = watcher.next().await?;
        let mut line = match serde_json::to_vec(&notify) {
            Ok(line) => line,
            Err(e) => return Some((Err(std::io::Error::other(e)), watcher)),
        };
        line.push(b'\n');
        Some((Ok(line), watcher))
    })
    .take_until(state.stopped.clone().cancelled_owned());
    (
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response()
}

async fn login_interactive(State(state): State<ApiState>) -> Response {
    match state.backend.start_login_interactive().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => backend_error(e),
    }
}

async fn logout(State(state): State<ApiState>) -> Response {
    match state.backend.logout().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => backend_error(e),
    }
}
