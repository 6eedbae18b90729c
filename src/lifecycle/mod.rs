//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     dir → log policy → spool/shipper → link monitor → dialer + engine
//!         → stack (+ dispatcher) → state store → backend → prefs + start
//!         → auth loop → in-memory control API
//!     any failure → CloseStack unwinds newest first
//!
//! Shutdown (shutdown.rs):
//!     Close → flush logs ∥ ordered teardown → close every listener
//! ```
//!
//! # Design Decisions
//! - Ordered startup: collaborators start in dependency order, not concurrently
//! - One cancellation token stops every background loop
//! - Only the log flush is time-bounded at close

mod authloop;
pub mod shutdown;
pub(crate) mod startup;
pub mod subsystems;

pub use shutdown::Shutdown;
pub use subsystems::{BackendContext, Subsystems};
