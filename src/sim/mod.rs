//! In-process overlay network.
//!
//! # Data Flow
//! ```text
//! MemBackend ──set_netmap──▶ MemEngine ──on_netmap──▶ MemStack ──attach──▶ MemNetwork
//!                                                        ▲                    │
//!                 Node::dial ─▶ Dialer ─▶ dial_tcp ──────┘      inject_tcp/udp│
//!                                                                             ▼
//!                                                    owning MemStack → FlowInterceptor
//! ```
//!
//! Several nodes built from the same [`InProcess`] share one network and
//! can reach each other by overlay address. Nothing leaves the process.

pub mod backend;
pub mod engine;
pub mod network;
pub mod stack;

pub use backend::MemBackend;
pub use engine::MemEngine;
pub use network::{Machine, MemNetwork};
pub use stack::MemStack;

use std::sync::Arc;

use crate::control::backend::ControlBackend;
use crate::error::BoxError;
use crate::lifecycle::subsystems::{BackendContext, Subsystems};
use crate::net::dialer::Dialer;
use crate::net::monitor::LinkMonitor;
use crate::stack::{PacketEngine, VirtualStack};

/// Subsystem factory wiring nodes onto a shared [`MemNetwork`].
#[derive(Clone)]
pub struct InProcess {
    network: Arc<MemNetwork>,
}

impl InProcess {
    pub fn new(network: Arc<MemNetwork>) -> Self {
        Self { network }
    }

    /// A factory with a private network of its own.
    pub fn standalone() -> Self {
        Self::new(MemNetwork::new())
    }

    pub fn network(&self) -> &Arc<MemNetwork> {
        &self.network
    }
}

impl Subsystems for InProcess {
    fn engine(
        &self,
        _dialer: &Arc<Dialer>,
        link: &Arc<LinkMonitor>,
    ) -> Result<Arc<dyn PacketEngine>, BoxError> {
        let engine = MemEngine::new(Arc::clone(&self.network)).with_link(link.subscribe());
        Ok(Arc::new(engine))
    }

    fn stack(&self, engine: &Arc<dyn PacketEngine>) -> Result<Arc<dyn VirtualStack>, BoxError> {
        Ok(MemStack::new(Arc::clone(&self.network), engine))
    }

    fn backend(&self, ctx: BackendContext<'_>) -> Result<Arc<dyn ControlBackend>, BoxError> {
        Ok(MemBackend::new(
            Arc::clone(&self.network),
            Arc::clone(ctx.store),
            Arc::clone(ctx.engine),
            ctx.log.clone(),
        ))
    }
}
