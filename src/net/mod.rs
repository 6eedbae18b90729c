//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Inbound flow from the virtual stack
//!     → dispatch.rs (resolve destination, build handler)
//!     → registry.rs (most specific listener for the destination)
//!     → listener.rs (grace-bounded handoff, accept)
//!     → application
//!
//! Outbound:
//!     Node::dial → dialer.rs → virtual stack (overlay peers) | host network
//!
//! Local-only plumbing:
//!     memnet.rs (in-memory control API transport)
//!     monitor.rs (link change polling)
//!     connection.rs (gateway session tracking)
//! ```
//!
//! # Design Decisions
//! - The registry lock is the only lock on the flow hot path
//! - A flow nobody accepts is dropped after the grace period, never queued
//!   indefinitely
//! - TCP and UDP share one connection type and one resolution path

pub mod conn;
pub mod connection;
pub mod dialer;
pub mod dispatch;
pub mod listener;
pub mod memnet;
pub mod monitor;
pub mod registry;

pub use conn::{AsyncStream, Conn, PacketConn};
pub use dialer::Dialer;
pub use dispatch::{FlowDispatcher, TcpHandler, UdpHandler, DEFAULT_GRACE};
pub use listener::{Handoff, Listener, ListenerError};
pub use registry::{ListenKey, ListenerRegistry, Network, Transport};
