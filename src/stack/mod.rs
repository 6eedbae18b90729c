//! Seams to the packet engine and the virtual TCP/IP stack.
//!
//! # Data Flow
//! ```text
//! control backend ──set_netmap──▶ PacketEngine ──on_netmap──▶ VirtualStack
//!                                                               │
//!                 inbound flow (src, dst) ──────────────────────┤
//!                                                               ▼
//!                                         FlowInterceptor::resolve_tcp/udp
//!                                               │ Pass / Drop / Handle
//!                                               ▼
//!                                     handler.deliver(conn) → Listener
//! ```
//!
//! The engine and stack themselves are collaborators; this module only
//! names what the node needs from them.

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::control::backend::ControlBackend;
use crate::error::BoxError;
use crate::net::conn::Conn;
use crate::net::dispatch::{TcpHandler, UdpHandler};

/// Outcome of asking the interceptor about a flow.
#[derive(Debug)]
pub enum Interception<H> {
    /// Not ours; the stack applies its default policy.
    Pass,
    /// Ours, but the flow must be dropped.
    Drop,
    /// Ours; hand the established flow to this handler.
    Handle(H),
}

impl<H> Interception<H> {
    pub fn is_intercepted(&self) -> bool {
        !matches!(self, Interception::Pass)
    }

    pub fn handler(self) -> Option<H> {
        match self {
            Interception::Handle(handler) => Some(handler),
            Interception::Pass | Interception::Drop => None,
        }
    }
}

/// Callback installed on the virtual stack to claim inbound flows.
///
/// Called synchronously on the stack's accept path; implementations must
/// not block.
pub trait FlowInterceptor: Send + Sync {
    fn resolve_tcp(&self, src: SocketAddr, dst: SocketAddr) -> Interception<TcpHandler>;
    fn resolve_udp(&self, src: SocketAddr, dst: SocketAddr) -> Interception<UdpHandler>;
}

/// A peer known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub name: String,
    pub addresses: Vec<IpAddr>,
}

/// The node's view of the overlay: its own addresses and its peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetMap {
    pub self_addresses: Vec<IpAddr>,
    pub peers: Vec<PeerInfo>,
}

pub type NetMapCallback = Box<dyn Fn(&NetMap) + Send + Sync>;

/// Packet-forwarding engine.
pub trait PacketEngine: Send + Sync {
    /// The overlay peer that owns `ip`, if any.
    fn peer_for_ip(&self, ip: IpAddr) -> Option<PeerInfo>;

    /// Install a new network map. Callbacks run before this returns.
    fn set_netmap(&self, netmap: NetMap);

    fn on_netmap(&self, callback: NetMapCallback);

    fn close(&self);
}

/// User-space TCP/IP stack running atop the engine.
pub trait VirtualStack: Send + Sync {
    fn set_interceptor(&self, interceptor: Arc<dyn FlowInterceptor>);

    fn start(&self, backend: Arc<dyn ControlBackend>) -> Result<(), BoxError>;

    fn dial_tcp(&self, dst: SocketAddr) -> BoxFuture<'_, io::Result<Conn>>;

    fn dial_udp(&self, dst: SocketAddr) -> BoxFuture<'_, io::Result<Conn>>;

    fn close(&self);
}
