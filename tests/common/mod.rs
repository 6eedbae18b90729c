//! Shared utilities for integration tests.
#![allow(dead_code)]

use futures_util::future::BoxFuture;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embednet::control::{BackendState, ControlBackend, Prefs, StartOptions, Status, Watcher};
use embednet::error::BoxError;
use embednet::lifecycle::{BackendContext, Subsystems};
use embednet::net::monitor::{LinkMonitor, LinkState};
use embednet::net::Dialer;
use embednet::observability::LogShipper;
use embednet::sim::{InProcess, MemBackend, MemEngine, MemNetwork, MemStack};
use embednet::stack::{PacketEngine, VirtualStack};
use embednet::NodeConfig;

pub const TEST_KEY: &str = "test-key";

/// Config for a node living in `dir`, joining with [`TEST_KEY`].
pub fn node_config(dir: &Path, hostname: &str) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.dir = Some(dir.to_path_buf());
    config.hostname = Some(hostname.to_string());
    config.auth_key = Some(TEST_KEY.to_string());
    config.listeners.handoff_grace_ms = 200;
    config.timeouts.close_flush_secs = 1;
    config.timeouts.auth_poll_secs = 1;
    config
}

/// Which factory call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    Nowhere,
    LogShipper,
    LinkMonitor,
    Engine,
    Stack,
    Backend,
}

/// How the built backend departs from the in-process one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quirk {
    None,
    /// `logout` never completes.
    StallLogout,
    /// Reports Running but no overlay addresses.
    NoAddress,
}

/// [`MemBackend`] with one behaviour overridden.
struct QuirkyBackend {
    inner: Arc<MemBackend>,
    quirk: Quirk,
}

impl ControlBackend for QuirkyBackend {
    fn start(&self, opts: StartOptions) -> BoxFuture<'_, Result<(), BoxError>> {
        self.inner.start(opts)
    }

    fn state(&self) -> BackendState {
        self.inner.state()
    }

    fn status(&self) -> Status {
        let mut status = self.inner.status();
        if self.quirk == Quirk::NoAddress {
            status.overlay_ips.clear();
        }
        status
    }

    fn prefs(&self) -> Prefs {
        self.inner.prefs()
    }

    fn watch(&self) -> Watcher {
        self.inner.watch()
    }

    fn start_login_interactive(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        self.inner.start_login_interactive()
    }

    fn logout(&self) -> BoxFuture<'_, Result<(), BoxError>> {
        match self.quirk {
            Quirk::StallLogout => Box::pin(futures_util::future::pending()),
            _ => self.inner.logout(),
        }
    }

    fn shutdown(&self) {
        self.inner.shutdown()
    }
}

/// In-process subsystems that remember what they built and can fail on cue.
#[derive(Clone)]
pub struct Recording {
    inner: InProcess,
    fail_at: FailAt,
    quirk: Quirk,
    link_delay: Duration,
    pub events: Arc<Mutex<Vec<&'static str>>>,
    pub engine: Arc<Mutex<Option<Arc<MemEngine>>>>,
    pub stack: Arc<Mutex<Option<Arc<MemStack>>>>,
    pub backend: Arc<Mutex<Option<Arc<MemBackend>>>>,
}

impl Recording {
    pub fn new(network: Arc<MemNetwork>, fail_at: FailAt) -> Self {
        Self {
            inner: InProcess::new(network),
            fail_at,
            quirk: Quirk::None,
            link_delay: Duration::ZERO,
            events: Arc::default(),
            engine: Arc::default(),
            stack: Arc::default(),
            backend: Arc::default(),
        }
    }

    /// Make the link monitor step take `delay`.
    pub fn with_link_delay(mut self, delay: Duration) -> Self {
        self.link_delay = delay;
        self
    }

    pub fn with_quirk(mut self, quirk: Quirk) -> Self {
        self.quirk = quirk;
        self
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    pub fn built_engine(&self) -> Option<Arc<MemEngine>> {
        self.engine.lock().unwrap().clone()
    }

    pub fn built_stack(&self) -> Option<Arc<MemStack>> {
        self.stack.lock().unwrap().clone()
    }

    pub fn built_backend(&self) -> Option<Arc<MemBackend>> {
        self.backend.lock().unwrap().clone()
    }

    fn step(&self, name: &'static str, at: FailAt) -> Result<(), BoxError> {
        self.events.lock().unwrap().push(name);
        if self.fail_at == at {
            return Err(format!("injected {name} failure").into());
        }
        Ok(())
    }
}

impl Subsystems for Recording {
    fn link_monitor(&self, _poll: Duration) -> BoxFuture<'_, Result<Arc<LinkMonitor>, BoxError>> {
        Box::pin(async move {
            self.step("link monitor", FailAt::LinkMonitor)?;
            tokio::time::sleep(self.link_delay).await;
            Ok(Arc::new(LinkMonitor::fixed(LinkState::default())))
        })
    }

    fn log_shipper(&self, dir: &Path, log_id: &str) -> Result<Arc<dyn LogShipper>, BoxError> {
        self.step("log shipper", FailAt::LogShipper)?;
        self.inner.log_shipper(dir, log_id)
    }

    fn engine(
        &self,
        _dialer: &Arc<Dialer>,
        _link: &Arc<LinkMonitor>,
    ) -> Result<Arc<dyn PacketEngine>, BoxError> {
        self.step("engine", FailAt::Engine)?;
        let engine = Arc::new(MemEngine::new(Arc::clone(self.inner.network())));
        *self.engine.lock().unwrap() = Some(Arc::clone(&engine));
        Ok(engine)
    }

    fn stack(&self, engine: &Arc<dyn PacketEngine>) -> Result<Arc<dyn VirtualStack>, BoxError> {
        self.step("stack", FailAt::Stack)?;
        let stack = MemStack::new(Arc::clone(self.inner.network()), engine);
        *self.stack.lock().unwrap() = Some(Arc::clone(&stack));
        Ok(stack)
    }

    fn backend(&self, ctx: BackendContext<'_>) -> Result<Arc<dyn ControlBackend>, BoxError> {
        self.step("backend", FailAt::Backend)?;
        let backend = MemBackend::new(
            Arc::clone(self.inner.network()),
            Arc::clone(ctx.store),
            Arc::clone(ctx.engine),
            ctx.log.clone(),
        );
        *self.backend.lock().unwrap() = Some(Arc::clone(&backend));
        if self.quirk == Quirk::None {
            return Ok(backend);
        }
        Ok(Arc::new(QuirkyBackend {
            inner: backend,
            quirk: self.quirk,
        }))
    }
}
