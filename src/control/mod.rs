//! Control-plane subsystem.
//!
//! # Data Flow
//! ```text
//! Node ──StartOptions──▶ ControlBackend (backend.rs)
//!                            │ Notify broadcast
//!                            ▼
//!                         Watcher ──▶ Node::up
//!
//! LocalClient (client.rs) ──HTTP/1.1 over memnet──▶ api.rs router ──▶ backend
//! Loopback gateway ──HTTP over TCP──▶ api.rs router (password + header)
//! ```

pub mod api;
pub mod backend;
pub mod client;

pub use api::{ApiAccess, ApiState, ListenerInfo};
pub use backend::{
    BackendState, ControlBackend, LoginFlags, Notify, Prefs, StartOptions, Status, Watcher,
};
pub use client::{ClientError, LocalClient, NotifyStream};
