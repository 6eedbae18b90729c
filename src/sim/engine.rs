//! Packet engine for the in-process network.

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

use crate::net::monitor::LinkState;
use crate::sim::network::MemNetwork;
use crate::stack::{NetMap, NetMapCallback, PacketEngine, PeerInfo};

pub struct MemEngine {
    network: Arc<MemNetwork>,
    netmap: ArcSwap<NetMap>,
    callbacks: Mutex<Vec<NetMapCallback>>,
    link: Option<watch::Receiver<LinkState>>,
    closed: AtomicBool,
}

impl MemEngine {
    pub fn new(network: Arc<MemNetwork>) -> Self {
        Self {
            network,
            netmap: ArcSwap::from_pointee(NetMap::default()),
            callbacks: Mutex::new(Vec::new()),
            link: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Follow the host link state published by a link monitor.
    pub fn with_link(mut self, link: watch::Receiver<LinkState>) -> Self {
        self.link = Some(link);
        self
    }

    /// Host link state, or the default when no monitor is attached.
    pub fn link_state(&self) -> LinkState {
        self.link.as_ref().map(|rx| *rx.borrow()).unwrap_or_default()
    }

    pub fn netmap(&self) -> Arc<NetMap> {
        self.netmap.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl PacketEngine for MemEngine {
    fn peer_for_ip(&self, ip: IpAddr) -> Option<PeerInfo> {
        if self.is_closed() {
            return None;
        }
        self.network.machine_for_ip(ip).map(|machine| PeerInfo {
            addresses: machine.addresses(),
            name: machine.hostname,
        })
    }

    fn set_netmap(&self, netmap: NetMap) {
        if self.is_closed() {
            return;
        }
        let netmap = Arc::new(netmap);
        self.netmap.store(Arc::clone(&netmap));
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(&netmap);
        }
    }

    fn on_netmap(&self, callback: NetMapCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::debug!("Packet engine closed");
    }
}
