//! Crate-wide error types.
//!
//! Configuration errors (bad listen spec, duplicate binding, closed node) are
//! returned synchronously and never retried. Initialization failures are
//! wrapped with the step that failed and cached as the node's sticky start
//! outcome. `Up` has its own error so callers can tell cancellation, shutdown
//! and backend problems apart.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::net::registry::{ListenSpecError, RegistryError};

/// Error type used at collaborator seams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The initialization step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStep {
    StateDir,
    LogPolicy,
    LogSpool,
    LinkMonitor,
    Engine,
    VirtualStack,
    StateStore,
    Backend,
    BackendStart,
}

impl fmt::Display for InitStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            InitStep::StateDir => "resolving state directory",
            InitStep::LogPolicy => "loading log policy",
            InitStep::LogSpool => "opening log spool",
            InitStep::LinkMonitor => "starting link monitor",
            InitStep::Engine => "creating packet engine",
            InitStep::VirtualStack => "creating virtual stack",
            InitStep::StateStore => "opening state store",
            InitStep::Backend => "creating control backend",
            InitStep::BackendStart => "starting control backend",
        };
        f.write_str(step)
    }
}

/// Why `Node::start` failed. Cached and returned on every later attempt.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("{step}: {source}")]
    Step {
        step: InitStep,
        #[source]
        source: BoxError,
    },

    #[error("node was closed during startup")]
    ClosedDuringStartup,
}

impl StartError {
    pub(crate) fn at(step: InitStep, source: impl Into<BoxError>) -> Self {
        StartError::Step {
            step,
            source: source.into(),
        }
    }

    /// The step that failed, if the failure belongs to one.
    pub fn step(&self) -> Option<InitStep> {
        match self {
            StartError::Step { step, .. } => Some(*step),
            StartError::ClosedDuringStartup => None,
        }
    }
}

/// Errors returned by the public `Node` surface.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("embednet: {0}")]
    Start(#[source] Arc<StartError>),

    #[error("embednet: {0}")]
    ListenSpec(#[from] ListenSpecError),

    #[error("embednet: listener already open for {network}, {addr}")]
    AlreadyBound { network: String, addr: String },

    #[error("embednet: node is closed")]
    Closed,

    #[error("embednet: dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("embednet: loopback gateway: {0}")]
    Gateway(#[from] crate::gateway::GatewayError),
}

impl NodeError {
    pub(crate) fn from_registry(err: RegistryError, addr: &str) -> Self {
        match err {
            RegistryError::AlreadyBound(key) => NodeError::AlreadyBound {
                network: key.network.to_string(),
                addr: addr.to_string(),
            },
            RegistryError::Closed => NodeError::Closed,
        }
    }
}

/// Errors returned by `Node::up`.
#[derive(Debug, Error)]
pub enum UpError {
    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("embednet up: cancelled")]
    Cancelled,

    #[error("embednet up: node shut down while waiting")]
    Shutdown,

    #[error("embednet up: backend: {0}")]
    Backend(String),

    #[error("embednet up: running, but no overlay address")]
    NoAddress,

    #[error("embednet up: backend notification stream closed")]
    WatchClosed,
}
