//! Virtual stack for the in-process network.

use futures_util::future::BoxFuture;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tokio::io::DuplexStream;

use crate::control::backend::ControlBackend;
use crate::error::BoxError;
use crate::net::conn::{Conn, PacketConn};
use crate::sim::network::MemNetwork;
use crate::stack::{FlowInterceptor, Interception, NetMap, PacketEngine, VirtualStack};

const STREAM_BUFFER: usize = 64 * 1024;
const PACKET_QUEUE: usize = 64;
const EPHEMERAL_PORTS: std::ops::RangeInclusive<u16> = 49152..=65535;

pub struct MemStack {
    network: Arc<MemNetwork>,
    interceptor: RwLock<Option<Arc<dyn FlowInterceptor>>>,
    addresses: Mutex<Vec<IpAddr>>,
    started: AtomicBool,
    closed: AtomicBool,
    next_port: AtomicU16,
}

impl MemStack {
    /// Build a stack that follows `engine`'s network map.
    pub fn new(network: Arc<MemNetwork>, engine: &Arc<dyn PacketEngine>) -> Arc<Self> {
        let stack = Arc::new(Self {
            network,
            interceptor: RwLock::new(None),
            addresses: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            next_port: AtomicU16::new(*EPHEMERAL_PORTS.start()),
        });
        let weak: Weak<MemStack> = Arc::downgrade(&stack);
        engine.on_netmap(Box::new(move |netmap| {
            if let Some(stack) = weak.upgrade() {
                stack.apply_netmap(netmap);
            }
        }));
        stack
    }

    pub fn addresses(&self) -> Vec<IpAddr> {
        self.addresses.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn apply_netmap(self: &Arc<Self>, netmap: &NetMap) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut addresses = self.addresses.lock().unwrap_or_else(PoisonError::into_inner);
        for ip in addresses.drain(..) {
            self.network.detach(ip, self);
        }
        for ip in &netmap.self_addresses {
            self.network.attach(*ip, self);
        }
        addresses.extend(netmap.self_addresses.iter().copied());
        tracing::debug!(addresses = ?*addresses, "Stack addresses updated");
    }

    fn interceptor(&self) -> io::Result<Arc<dyn FlowInterceptor>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "stack is closed"));
        }
        self.interceptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no interceptor installed"))
    }

    pub(crate) fn accept_tcp(&self, src: SocketAddr, dst: SocketAddr) -> io::Result<DuplexStream> {
        match self.interceptor()?.resolve_tcp(src, dst) {
            Interception::Handle(handler) => {
                let (initiator, accepted) = tokio::io::duplex(STREAM_BUFFER);
                tokio::spawn(handler.deliver(Conn::stream(dst, src, accepted)));
                Ok(initiator)
            }
            Interception::Drop => Err(refused(dst, "flow dropped")),
            Interception::Pass => Err(refused(dst, "nothing listening")),
        }
    }

    pub(crate) fn accept_udp(&self, src: SocketAddr, dst: SocketAddr) -> io::Result<PacketConn> {
        match self.interceptor()?.resolve_udp(src, dst) {
            Interception::Handle(handler) => {
                let (initiator, accepted) = PacketConn::pair(src, dst, PACKET_QUEUE);
                tokio::spawn(handler.deliver(accepted));
                Ok(initiator)
            }
            Interception::Drop => Err(refused(dst, "flow dropped")),
            Interception::Pass => Err(refused(dst, "nothing listening")),
        }
    }

    fn source_for(&self, dst: SocketAddr) -> io::Result<SocketAddr> {
        if !self.started.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stack is not running"));
        }
        let ip = self
            .addresses()
            .into_iter()
            .find(|ip| ip.is_ipv6() == dst.is_ipv6())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::AddrNotAvailable, "no overlay address of that family")
            })?;
        Ok(SocketAddr::new(ip, self.ephemeral_port()))
    }

    fn ephemeral_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == *EPHEMERAL_PORTS.end() {
            self.next_port.store(*EPHEMERAL_PORTS.start(), Ordering::Relaxed);
        }
        port
    }
}

fn refused(dst: SocketAddr, reason: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, format!("{dst}: {reason}"))
}

impl VirtualStack for MemStack {
    fn set_interceptor(&self, interceptor: Arc<dyn FlowInterceptor>) {
        *self.interceptor.write().unwrap_or_else(PoisonError::into_inner) = Some(interceptor);
    }

    fn start(&self, _backend: Arc<dyn ControlBackend>) -> Result<(), BoxError> {
        if self.closed.load(Ordering::Acquire) {
            return Err("stack is closed".into());
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn dial_tcp(&self, dst: SocketAddr) -> BoxFuture<'_, io::Result<Conn>> {
        Box::pin(async move {
            let src = self.source_for(dst)?;
            let io = self.network.inject_tcp(src, dst)?;
            Ok(Conn::stream(src, dst, io))
        })
    }

    fn dial_udp(&self, dst: SocketAddr) -> BoxFuture<'_, io::Result<Conn>> {
        Box::pin(async move {
            let src = self.source_for(dst)?;
            let packets = self.network.inject_udp(src, dst)?;
            Ok(Conn::packet(packets))
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut addresses = self.addresses.lock().unwrap_or_else(PoisonError::into_inner);
        for ip in addresses.drain(..) {
            self.network.detach(ip, self);
        }
        self.interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::registry::{ListenKey, ListenerRegistry, Network};
    use crate::net::dispatch::FlowDispatcher;
    use crate::net::listener::Listener;
    use crate::sim::engine::MemEngine;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn stack_at(network: &Arc<MemNetwork>, ip: &str) -> (Arc<MemStack>, Arc<ListenerRegistry>) {
        let engine: Arc<dyn PacketEngine> = Arc::new(MemEngine::new(network.clone()));
        let stack = MemStack::new(network.clone(), &engine);
        let registry = Arc::new(ListenerRegistry::new());
        stack.set_interceptor(Arc::new(FlowDispatcher::new(
            registry.clone(),
            Duration::from_secs(1),
        )));
        engine.set_netmap(NetMap {
            self_addresses: vec![ip.parse().unwrap()],
            peers: Vec::new(),
        });
        (stack, registry)
    }

    #[tokio::test]
    async fn injected_flow_reaches_listener() {
        let network = MemNetwork::new();
        let (_stack, registry) = stack_at(&network, "100.64.0.5");
        let key = ListenKey::new(Network::Tcp, None, 80);
        let listener = Listener::open(&registry, key, ":80").unwrap();

        let mut client = network
            .inject_tcp("100.64.0.9:4000".parse().unwrap(), "100.64.0.5:80".parse().unwrap())
            .unwrap();
        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.peer_addr(), "100.64.0.9:4000".parse().unwrap());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn unclaimed_port_is_refused() {
        let network = MemNetwork::new();
        let (_stack, _registry) = stack_at(&network, "100.64.0.5");
        let err = network
            .inject_tcp("100.64.0.9:4000".parse().unwrap(), "100.64.0.5:22".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn closed_stack_leaves_the_network() {
        let network = MemNetwork::new();
        let (stack, _registry) = stack_at(&network, "100.64.0.5");
        stack.close();
        assert!(stack.addresses().is_empty());
        let err = network
            .inject_tcp("100.64.0.9:4000".parse().unwrap(), "100.64.0.5:80".parse().unwrap())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn dial_requires_start() {
        let network = MemNetwork::new();
        let (stack, _registry) = stack_at(&network, "100.64.0.5");
        let err = stack
            .dial_tcp("100.64.0.6:80".parse().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
