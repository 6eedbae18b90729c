//! Embeddable overlay-network node.
//!
//! An application builds a [`Node`], optionally waits for it to come
//! [`up`](Node::up), and then dials and listens on the overlay as if it
//! were an ordinary network. Inbound flows are routed to the most specific
//! matching [`Listener`]; a loopback gateway offers SOCKS5 and the control
//! API to other local programs.

pub mod config;
pub mod control;
pub mod error;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod node;
pub mod observability;
pub mod sim;
pub mod stack;
pub mod store;

pub use config::NodeConfig;
pub use control::{LocalClient, Status};
pub use error::{InitStep, NodeError, StartError, UpError};
pub use gateway::LoopbackInfo;
pub use http::NodeHttpClient;
pub use net::{Conn, Listener, ListenerError, PacketConn};
pub use node::{Node, NodeBuilder, Phase};
