//! Factories for the collaborators a node starts.
//!
//! Startup asks a [`Subsystems`] implementation for each collaborator in
//! order. The default link monitor and log shipper are the real ones; the
//! engine, stack and control backend have no default.

use futures_util::future::BoxFuture;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::control::backend::ControlBackend;
use crate::error::BoxError;
use crate::net::dialer::Dialer;
use crate::net::monitor::LinkMonitor;
use crate::observability::shipper::{LogShipper, SpoolShipper};
use crate::observability::NodeLog;
use crate::stack::{PacketEngine, VirtualStack};
use crate::store::StateStore;

/// What the control backend is built from.
pub struct BackendContext<'a> {
    pub store: &'a Arc<dyn StateStore>,
    pub dialer: &'a Arc<Dialer>,
    pub engine: &'a Arc<dyn PacketEngine>,
    pub log: &'a NodeLog,
}

pub trait Subsystems: Send + Sync {
    fn link_monitor(&self, poll: Duration) -> BoxFuture<'_, Result<Arc<LinkMonitor>, BoxError>> {
        Box::pin(async move { Ok(Arc::new(LinkMonitor::start(poll).await)) })
    }

    fn log_shipper(&self, dir: &Path, log_id: &str) -> Result<Arc<dyn LogShipper>, BoxError> {
        Ok(Arc::new(SpoolShipper::open(dir, log_id)?))
    }

    fn engine(
        &self,
        dialer: &Arc<Dialer>,
        link: &Arc<LinkMonitor>,
    ) -> Result<Arc<dyn PacketEngine>, BoxError>;

    fn stack(&self, engine: &Arc<dyn PacketEngine>) -> Result<Arc<dyn VirtualStack>, BoxError>;

    fn backend(&self, ctx: BackendContext<'_>) -> Result<Arc<dyn ControlBackend>, BoxError>;
}
