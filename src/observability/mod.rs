//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Node-level messages (NodeLog):
//!     → logging.rs (tracing event + embedder log function)
//!     → shipper.rs (queue) → spool.rs (node.log1.txt / node.log2.txt)
//!
//! Log identity:
//!     logpolicy.rs (node.log.conf: collection + private/public ids)
//!
//! Counters and gauges:
//!     metrics.rs → recorder installed by the host (Prometheus)
//! ```
//!
//! # Design Decisions
//! - Structured `tracing` events everywhere; the subscriber belongs to the host
//! - Shipping never blocks the caller; the final flush is bounded at close
//! - Metrics are cheap no-ops until a recorder exists

pub mod logging;
pub mod logpolicy;
pub mod metrics;
pub mod shipper;
pub mod spool;

pub use logging::{LogFn, NodeLog};
pub use logpolicy::LogPolicy;
pub use shipper::{LogShipper, SpoolShipper};
