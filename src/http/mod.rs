//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! In-memory pipe (memnet) or sniffed gateway TCP stream
//!     → server.rs (hyper HTTP/1.1 connection)
//!     → axum router (control API, gateway header layer)
//!     → response
//!
//! Application request
//!     → client.rs (pooled hyper client)
//!     → node dialer → overlay peer
//! ```

pub mod client;
pub mod server;

pub use client::{DialerConnector, NodeHttpClient};
pub use server::HttpServer;
