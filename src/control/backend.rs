//! Control backend seam and its state types.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use tokio::sync::broadcast;

use crate::error::BoxError;

/// Where the backend is in joining the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendState {
    #[default]
    NoState,
    NeedsLogin,
    NeedsMachineAuth,
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Desired node settings applied at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prefs {
    pub hostname: String,
    pub want_running: bool,
    pub control_url: Option<String>,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            want_running: true,
            control_url: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginFlags {
    pub ephemeral: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub prefs: Prefs,
    pub auth_key: Option<String>,
    pub login_flags: LoginFlags,
}

/// Snapshot of the backend's view of this node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub backend_state: BackendState,
    pub auth_url: Option<String>,
    pub hostname: String,
    pub overlay_ips: Vec<IpAddr>,
}

/// One state-change notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<BackendState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browse_to_url: Option<String>,
}

impl Notify {
    pub fn state(state: BackendState) -> Self {
        Self {
            state: Some(state),
            ..Self::default()
        }
    }
}

/// Subscription to backend notifications: the initial state first, then
/// live changes.
pub struct Watcher {
    initial: Option<Notify>,
    rx: broadcast::Receiver<Notify>,
}

impl Watcher {
    pub fn new(initial: Notify, rx: broadcast::Receiver<Notify>) -> Self {
        Self {
            initial: Some(initial),
            rx,
        }
    }

    /// Next notification, or `None` once the backend is gone.
    pub async fn next(&mut self) -> Option<Notify> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        loop {
            match self.rx.recv().await {
                Ok(notify) => return Some(notify),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Watcher lagged behind backend notifications");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Control-protocol client that negotiates network membership.
pub trait ControlBackend: Send + Sync {
    fn start(&self, opts: StartOptions) -> BoxFuture<'_, Result<(), BoxError>>;

    fn state(&self) -> BackendState;

    fn status(&self) -> Status;

    fn prefs(&self) -> Prefs;

    fn watch(&self) -> Watcher;

    fn start_login_interactive(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    fn logout(&self) -> BoxFuture<'_, Result<(), BoxError>>;

    fn shutdown(&self);
}
