//! Link change monitoring.
//!
//! Polls the host's default-route source address and publishes changes on a
//! watch channel. A UDP `connect` never sends a packet, so probing is free
//! even when the host is offline.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Documentation ranges; never routed, only used to pick a source address.
const ROUTE_TARGET_V4: &str = "192.0.2.1:9";
const ROUTE_TARGET_V6: &str = "[2001:db8::1]:9";

/// What the host network looks like right now.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    pub default_v4: Option<IpAddr>,
    pub default_v6: Option<IpAddr>,
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        self.default_v4.is_some() || self.default_v6.is_some()
    }
}

pub struct LinkMonitor {
    state: watch::Receiver<LinkState>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LinkMonitor {
    /// Take an initial reading and start polling every `interval`.
    pub async fn start(interval: Duration) -> Self {
        let initial = sample_link().await;
        tracing::debug!(v4 = ?initial.default_v4, v6 = ?initial.default_v6, "Link monitor started");

        let (tx, rx) = watch::channel(initial);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(tx, interval, cancel.clone()));
        Self {
            state: rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// A monitor that never changes state, for nodes without a host network.
    pub fn fixed(state: LinkState) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self {
            state: rx,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn current(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn poll_loop(tx: watch::Sender<LinkState>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let next = sample_link().await;
        tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::info!(
                old_v4 = ?current.default_v4,
                new_v4 = ?next.default_v4,
                old_v6 = ?current.default_v6,
                new_v6 = ?next.default_v6,
                "Link change"
            );
            *current = next;
            true
        });
    }
}

async fn sample_link() -> LinkState {
    LinkState {
        default_v4: source_for("0.0.0.0:0", ROUTE_TARGET_V4).await,
        default_v6: source_for("[::]:0", ROUTE_TARGET_V6).await,
    }
}

async fn source_for(bind: &str, target: &str) -> Option<IpAddr> {
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    let local: SocketAddr = socket.local_addr().ok()?;
    Some(local.ip()).filter(|ip| !ip.is_unspecified())
}
