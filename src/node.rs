//! The embeddable node.
//!
//! A [`Node`] is built unstarted. The first call that needs the network
//! (`start`, `up`, `dial`, `listen`, `local_client`, `loopback`,
//! `http_client`) runs startup once; every later call sees the same
//! outcome, including a failure. `close` tears everything down and is safe to repeat.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::control::backend::{BackendState, Status};
use crate::control::client::LocalClient;
use crate::error::{NodeError, StartError, UpError};
use crate::gateway::LoopbackInfo;
use crate::http::client::{self as http_client, NodeHttpClient};
use crate::lifecycle::startup::{self, Running, StartContext};
use crate::lifecycle::Subsystems;
use crate::net::conn::Conn;
use crate::net::listener::Listener;
use crate::net::registry::{ListenKey, ListenerRegistry};
use crate::observability::{metrics, LogFn, NodeLog};
use crate::sim::InProcess;
use crate::store::StateStore;

/// Where a node is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Unstarted = 0,
    Initializing = 1,
    Running = 2,
    Failed = 3,
    Closed = 4,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Initializing,
            2 => Phase::Running,
            3 => Phase::Failed,
            4 => Phase::Closed,
            _ => Phase::Unstarted,
        }
    }
}

type StartOutcome = Result<Arc<Running>, Arc<StartError>>;

pub struct Node {
    config: NodeConfig,
    store: Option<Arc<dyn StateStore>>,
    log: NodeLog,
    subsystems: Arc<dyn Subsystems>,
    registry: Arc<ListenerRegistry>,
    started: OnceCell<StartOutcome>,
    phase: AtomicU8,
    closed: AtomicBool,
}

/// Builder for the parts of a node that do not live in [`NodeConfig`].
pub struct NodeBuilder {
    config: NodeConfig,
    store: Option<Arc<dyn StateStore>>,
    log_fn: Option<LogFn>,
    subsystems: Option<Arc<dyn Subsystems>>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            store: None,
            log_fn: None,
            subsystems: None,
        }
    }

    /// Use this state store instead of the one `config.store` describes.
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Also send node log lines to `f`.
    pub fn log_fn(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_fn = Some(Arc::new(f));
        self
    }

    pub fn subsystems(mut self, subsystems: impl Subsystems + 'static) -> Self {
        self.subsystems = Some(Arc::new(subsystems));
        self
    }

    pub fn build(self) -> Node {
        Node {
            config: self.config,
            store: self.store,
            log: NodeLog::new(self.log_fn),
            subsystems: self
                .subsystems
                .unwrap_or_else(|| Arc::new(InProcess::standalone())),
            registry: Arc::new(ListenerRegistry::new()),
            started: OnceCell::new(),
            phase: AtomicU8::new(Phase::Unstarted as u8),
            closed: AtomicBool::new(false),
        }
    }
}

impl Node {
    /// A node on a private in-process network.
    pub fn new(config: NodeConfig) -> Self {
        NodeBuilder::new(config).build()
    }

    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        if self.closed.load(Ordering::Acquire) {
            return Phase::Closed;
        }
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Run startup if it has not run yet and return its outcome.
    pub async fn start(&self) -> Result<(), NodeError> {
        self.running().await.map(|_| ())
    }

    async fn running(&self) -> Result<Arc<Running>, NodeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NodeError::Closed);
        }
        let outcome = self
            .started
            .get_or_init(|| async {
                self.phase.store(Phase::Initializing as u8, Ordering::Release);
                let outcome = self.initialize().await;
                let (phase, label) = match &outcome {
                    Ok(_) => (Phase::Running, "ok"),
                    Err(_) => (Phase::Failed, "failed"),
                };
                metrics::record_start(label);
                self.phase.store(phase as u8, Ordering::Release);
                outcome
            })
            .await;
        match outcome {
            Ok(running) => Ok(Arc::clone(running)),
            Err(e) => Err(NodeError::Start(Arc::clone(e))),
        }
    }

    async fn initialize(&self) -> StartOutcome {
        let result = startup::initialize(StartContext {
            config: &self.config,
            store: self.store.clone(),
            log: &self.log,
            subsystems: self.subsystems.as_ref(),
            registry: &self.registry,
            closed: &self.closed,
        })
        .await;

        match result {
            Ok(running) => {
                let running = Arc::new(running);
                if self.closed.load(Ordering::Acquire) {
                    running
                        .close(self.config.ephemeral, self.config.timeouts.close_flush())
                        .await;
                    return Err(Arc::new(StartError::ClosedDuringStartup));
                }
                Ok(running)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Node start failed");
                self.log.warn(&format!("start failed: {e}"));
                Err(Arc::new(e))
            }
        }
    }

    /// Wait until the node is on the network with an address.
    ///
    /// Returns early when `cancel` fires, the node is closed, or the backend
    /// reports an error.
    pub async fn up(&self, cancel: &CancellationToken) -> Result<Status, UpError> {
        let running = self.running().await?;
        let stopped = running.shutdown.token();
        let mut watcher = running.backend.watch();

        loop {
            let notify = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UpError::Cancelled),
                _ = stopped.cancelled() => return Err(UpError::Shutdown),
                notify = watcher.next() => notify,
            };
            let Some(notify) = notify else {
                return Err(UpError::WatchClosed);
            };
            if let Some(error) = notify.error {
                return Err(UpError::Backend(error));
            }
            if notify.state == Some(BackendState::Running) {
                let status = running.backend.status();
                if status.overlay_ips.is_empty() {
                    return Err(UpError::NoAddress);
                }
                return Ok(status);
            }
        }
    }

    /// Connect to `address` on `network` ("tcp", "udp4", ...).
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, NodeError> {
        let running = self.running().await?;
        running
            .dialer
            .dial(network, address)
            .await
            .map_err(|source| NodeError::Dial {
                address: address.to_string(),
                source,
            })
    }

    /// Accept overlay connections for `address` on `network`.
    ///
    /// An empty or unspecified host listens on every overlay address.
    pub async fn listen(&self, network: &str, address: &str) -> Result<Listener, NodeError> {
        let key = ListenKey::parse(network, address)?;
        self.running().await?;
        Listener::open(&self.registry, key, address)
            .map_err(|e| NodeError::from_registry(e, address))
    }

    /// Client for the in-process control API.
    pub async fn local_client(&self) -> Result<LocalClient, NodeError> {
        Ok(self.running().await?.local_client.clone())
    }

    /// Open (once) the loopback SOCKS5 + control API socket.
    pub async fn loopback(&self) -> Result<LoopbackInfo, NodeError> {
        let running = self.running().await?;
        Ok(running.gateway.open().await?)
    }

    /// HTTP client whose connections are dialed through this node.
    pub async fn http_client(&self) -> Result<NodeHttpClient, NodeError> {
        let running = self.running().await?;
        Ok(http_client::client(Arc::clone(&running.dialer)))
    }

    /// The node's overlay addresses, once assigned.
    pub fn overlay_ips(&self) -> (Option<Ipv4Addr>, Option<Ipv6Addr>) {
        let Some(Ok(running)) = self.started.get() else {
            return (None, None);
        };
        let mut v4 = None;
        let mut v6 = None;
        for ip in running.backend.status().overlay_ips {
            match ip {
                IpAddr::V4(ip) if v4.is_none() => v4 = Some(ip),
                IpAddr::V6(ip) if v6.is_none() => v6 = Some(ip),
                _ => {}
            }
        }
        (v4, v6)
    }

    /// Shut the node down. Always succeeds; later calls do nothing.
    pub async fn close(&self) -> Result<(), NodeError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Waits for an in-flight start; seals an unstarted node.
        let outcome = self
            .started
            .get_or_init(|| async { Err(Arc::new(StartError::ClosedDuringStartup)) })
            .await;
        if let Ok(running) = outcome {
            running
                .close(self.config.ephemeral, self.config.timeouts.close_flush())
                .await;
        }
        let closed = self.registry.close_all();
        tracing::debug!(listeners = closed, "Closed remaining listeners");
        self.phase.store(Phase::Closed as u8, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("hostname", &self.config.hostname)
            .field("phase", &self.phase())
            .field("listeners", &self.registry.len())
            .finish()
    }
}
