//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the global subscriber (binaries only)
//! - Fan node-level messages out to tracing, the log shipper and the
//!   embedder's log function
//!
//! # Design Decisions
//! - The library never installs a subscriber; hosts decide
//! - `RUST_LOG` overrides the configured level

use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::observability::shipper::LogShipper;

/// Embedder-supplied sink for node log lines.
pub type LogFn = Arc<dyn Fn(&str) + Send + Sync>;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `level` if unset.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("embednet={level},tower_http={level}")));
    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if result.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

#[derive(Default)]
struct Sinks {
    user: Option<LogFn>,
    shipper: RwLock<Option<Arc<dyn LogShipper>>>,
    log_id: OnceLock<String>,
}

/// Node-level log fan-out. Cheap to clone.
#[derive(Clone, Default)]
pub struct NodeLog {
    sinks: Arc<Sinks>,
}

impl NodeLog {
    pub fn new(user: Option<LogFn>) -> Self {
        Self {
            sinks: Arc::new(Sinks {
                user,
                ..Sinks::default()
            }),
        }
    }

    /// Start copying lines to `shipper`, tagged with the node's log id.
    pub fn attach(&self, shipper: Arc<dyn LogShipper>, log_id: &str) {
        let _ = self.sinks.log_id.set(log_id.to_string());
        *self.sinks.shipper.write().unwrap_or_else(PoisonError::into_inner) = Some(shipper);
    }

    /// Stop copying lines to the shipper.
    pub fn detach(&self) {
        self.sinks
            .shipper
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn log_id(&self) -> Option<&str> {
        self.sinks.log_id.get().map(String::as_str)
    }

    pub fn info(&self, message: &str) {
        tracing::info!(log_id = self.log_id().unwrap_or(""), "{message}");
        self.fan_out(message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(log_id = self.log_id().unwrap_or(""), "{message}");
        self.fan_out(message);
    }

    fn fan_out(&self, message: &str) {
        let shipper = self
            .sinks
            .shipper
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(shipper) = shipper {
            shipper.write(message);
        }
        if let Some(user) = &self.sinks.user {
            user(message);
        }
    }
}

impl std::fmt::Debug for NodeLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLog")
            .field("log_id", &self.log_id())
            .field("user_sink", &self.sinks.user.is_some())
            .finish()
    }
}
