//! Inbound flow dispatch.
//!
//! The virtual stack asks the dispatcher about every new flow. Resolution is
//! one registry lookup; the handoff wait happens later, inside the handler
//! the stack runs once the flow is established.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::net::conn::{Conn, PacketConn};
use crate::net::listener::{Handoff, ListenerEntry};
use crate::net::registry::{ListenerRegistry, Transport};
use crate::observability::metrics;
use crate::stack::{FlowInterceptor, Interception};

/// How long a resolved flow waits for `accept` before it is dropped.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

struct Target {
    entry: Arc<ListenerEntry>,
    grace: Duration,
    src: SocketAddr,
    dst: SocketAddr,
}

impl Target {
    async fn deliver(self, conn: Conn) -> Handoff {
        let transport = conn.transport();
        let outcome = self.entry.offer(conn, self.grace).await;
        match outcome {
            Handoff::Accepted => {
                tracing::trace!(src = %self.src, dst = %self.dst, "Flow accepted");
            }
            Handoff::Expired => {
                metrics::record_handoff_dropped(transport);
                tracing::debug!(
                    src = %self.src,
                    dst = %self.dst,
                    listener = %self.entry.key(),
                    grace_ms = self.grace.as_millis() as u64,
                    "Listener did not accept in time, dropping flow"
                );
            }
            Handoff::Closed => {
                metrics::record_handoff_dropped(transport);
                tracing::debug!(src = %self.src, dst = %self.dst, "Listener closed, dropping flow");
            }
        }
        outcome
    }
}

/// Receives an established TCP flow for a listener.
pub struct TcpHandler(Target);

impl TcpHandler {
    /// Hand the stream to the listener, dropping it after the grace period.
    pub async fn deliver(self, conn: Conn) -> Handoff {
        self.0.deliver(conn).await
    }

    pub fn listener_addr(&self) -> &str {
        self.0.entry.addr()
    }
}

/// Receives a UDP flow for a listener.
pub struct UdpHandler(Target);

impl UdpHandler {
    /// Wrap the packet channel as a connection and hand it to the listener.
    pub async fn deliver(self, packets: PacketConn) -> Handoff {
        self.0.deliver(Conn::packet(packets)).await
    }

    pub fn listener_addr(&self) -> &str {
        self.0.entry.addr()
    }
}

impl std::fmt::Debug for TcpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TcpHandler").field(&self.0.entry.key()).finish()
    }
}

impl std::fmt::Debug for UdpHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UdpHandler").field(&self.0.entry.key()).finish()
    }
}

/// Routes inbound flows to registered listeners.
pub struct FlowDispatcher {
    registry: Arc<ListenerRegistry>,
    grace: Duration,
}

impl FlowDispatcher {
    pub fn new(registry: Arc<ListenerRegistry>, grace: Duration) -> Self {
        Self { registry, grace }
    }

    fn resolve(&self, transport: Transport, src: SocketAddr, dst: SocketAddr) -> Interception<Target> {
        match self.registry.resolve(transport, dst) {
            Some(entry) => {
                metrics::record_flow(transport, "intercepted");
                Interception::Handle(Target {
                    entry,
                    grace: self.grace,
                    src,
                    dst,
                })
            }
            // Never let unclaimed flows reach the host's loopback.
            None if dst.ip().is_loopback() => {
                metrics::record_flow(transport, "dropped");
                Interception::Drop
            }
            None => {
                metrics::record_flow(transport, "passed");
                Interception::Pass
            }
        }
    }
}

impl FlowInterceptor for FlowDispatcher {
    fn resolve_tcp(&self, src: SocketAddr, dst: SocketAddr) -> Interception<TcpHandler> {
        match self.resolve(Transport::Tcp, src, dst) {
            Interception::Handle(target) => Interception::Handle(TcpHandler(target)),
            Interception::Drop => Interception::Drop,
            Interception::Pass => Interception::Pass,
        }
    }

    fn resolve_udp(&self, src: SocketAddr, dst: SocketAddr) -> Interception<UdpHandler> {
        match self.resolve(Transport::Udp, src, dst) {
            Interception::Handle(target) => Interception::Handle(UdpHandler(target)),
            Interception::Drop => Interception::Drop,
            Interception::Pass => Interception::Pass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::listener::Listener;
    use crate::net::registry::{ListenKey, Network};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn listen(registry: &Arc<ListenerRegistry>, network: &str, spec: &str) -> Listener {
        let key = ListenKey::parse(network, spec).unwrap();
        Listener::open(registry, key, spec).unwrap()
    }

    #[test]
    fn unmatched_flows_pass_except_loopback() {
        let registry = Arc::new(ListenerRegistry::new());
        let dispatcher = FlowDispatcher::new(registry, DEFAULT_GRACE);
        let src = addr("100.64.0.2:40000");

        assert!(matches!(
            dispatcher.resolve_tcp(src, addr("100.64.0.1:22")),
            Interception::Pass
        ));
        assert!(matches!(
            dispatcher.resolve_tcp(src, addr("127.0.0.1:22")),
            Interception::Drop
        ));
        assert!(matches!(
            dispatcher.resolve_udp(src, addr("[::1]:53")),
            Interception::Drop
        ));
    }

    #[test]
    fn tcp_and_udp_resolve_separately() {
        let registry = Arc::new(ListenerRegistry::new());
        let _dns = listen(&registry, "udp", ":53");
        let dispatcher = FlowDispatcher::new(Arc::clone(&registry), DEFAULT_GRACE);
        let src = addr("100.64.0.2:40000");
        let dst = addr("100.64.0.1:53");

        let udp = dispatcher.resolve_udp(src, dst).handler().unwrap();
        assert_eq!(udp.listener_addr(), ":53");
        assert!(matches!(dispatcher.resolve_tcp(src, dst), Interception::Pass));
    }

    #[tokio::test]
    async fn tcp_flow_reaches_accept() {
        let registry = Arc::new(ListenerRegistry::new());
        let listener = listen(&registry, "tcp", ":80");
        let dispatcher = FlowDispatcher::new(Arc::clone(&registry), DEFAULT_GRACE);
        let src = addr("100.64.0.2:40000");
        let dst = addr("100.64.0.1:80");

        let handler = dispatcher.resolve_tcp(src, dst).handler().unwrap();
        let (server, mut client) = tokio::io::duplex(64);
        let delivery = tokio::spawn(handler.deliver(Conn::stream(dst, src, server)));

        let mut conn = listener.accept().await.unwrap();
        assert_eq!(conn.local_addr(), dst);
        conn.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(delivery.await.unwrap(), Handoff::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_listener_does_not_block_others() {
        let registry = Arc::new(ListenerRegistry::new());
        let _idle = listen(&registry, "tcp", ":1");
        let busy = listen(&registry, "tcp", ":2");
        let dispatcher = FlowDispatcher::new(Arc::clone(&registry), Duration::from_millis(300));
        let src = addr("100.64.0.2:40000");

        let to_idle = dispatcher.resolve_tcp(src, addr("100.64.0.1:1")).handler().unwrap();
        let (server, _client) = tokio::io::duplex(8);
        let idle_delivery = tokio::spawn(to_idle.deliver(Conn::stream(addr("100.64.0.1:1"), src, server)));

        let to_busy = dispatcher.resolve_tcp(src, addr("100.64.0.1:2")).handler().unwrap();
        let (server, _client2) = tokio::io::duplex(8);
        let busy_delivery = tokio::spawn(to_busy.deliver(Conn::stream(addr("100.64.0.1:2"), src, server)));

        let conn = busy.accept().await.unwrap();
        assert_eq!(conn.local_addr().port(), 2);
        assert_eq!(busy_delivery.await.unwrap(), Handoff::Accepted);
        assert_eq!(idle_delivery.await.unwrap(), Handoff::Expired);
    }

    #[tokio::test]
    async fn udp_flow_is_packet_oriented() {
        let registry = Arc::new(ListenerRegistry::new());
        let listener = listen(&registry, "udp4", ":53");
        let dispatcher = FlowDispatcher::new(Arc::clone(&registry), DEFAULT_GRACE);
        let src = addr("100.64.0.2:40000");
        let dst = addr("100.64.0.1:53");

        let handler = dispatcher.resolve_udp(src, dst).handler().unwrap();
        let (ours, theirs) = PacketConn::pair(dst, src, 8);
        tokio::spawn(handler.deliver(ours));
        theirs.send(b"query").unwrap();

        let conn = listener.accept().await.unwrap();
        assert_eq!(conn.transport(), Transport::Udp);
        assert_eq!(listener.network(), Network::Udp4);
        let mut packets = conn.into_packet().unwrap();
        assert_eq!(packets.recv_packet().await.unwrap(), b"query");
    }
}
